//! Ownership-tracking mutexes.
//!
//! A [`Mutex`] is a non-reentrant lock with four observable states:
//!
//! ```text
//! unlocked/not-abandoned --lock--> locked/owned --unlock--> unlocked/not-abandoned
//!                                       |
//!                                owner terminates
//!                                       v
//!                              unlocked/abandoned --lock--> locked/owned
//!                                                           (+ abandoned-mutex signalled once)
//!
//! locked/not-owned: held "by no thread", for explicit handoff patterns
//! ```
//!
//! Ownership is advisory: it drives state reporting and abandonment
//! detection, but `unlock` releases regardless of the caller. The owner
//! back-pointer is weak; it never keeps a thread alive. There is no
//! re-entrancy: a thread that relocks a mutex it owns blocks and can
//! deadlock itself.

use crate::condvar::ConditionVariable;
use crate::registry::ThreadRegistry;
use crate::thread::{EvalThread, ThreadInner};
use crate::{deadline_after, emit, ThreadEvent};
use lispkit_rts_gc::{object_id, Marker, ObjectId, Trace};
use lispkit_value::{Condition, NativeObject, ThreadError, Value};
use parking_lot::{Condvar, Mutex as NativeMutex};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Observable state of a [`Mutex`].
#[derive(Debug, Clone, PartialEq)]
pub enum MutexState {
    /// Not held by anyone; `abandoned` reports whether the previous owner
    /// terminated while holding it.
    Unlocked {
        /// The previous owner terminated without unlocking.
        abandoned: bool,
    },
    /// Held on behalf of the given thread.
    LockedOwned(EvalThread),
    /// Held "by no thread" after an explicit ownerless acquisition.
    LockedNotOwned,
}

/// State protected by the mutex's native lock.
#[derive(Default)]
struct MutexCore {
    locked: bool,
    abandoned: bool,
    /// Weak by design of the data model: a relation, never a keep-alive.
    owner: Option<Weak<ThreadInner>>,
}

impl MutexCore {
    /// True when a locked mutex's owner terminated without unlocking.
    ///
    /// Covers the race where a handle was dropped or termination finished
    /// before the mutex made it onto the owner's held list; the common
    /// path is the eager abandonment performed by the terminating thread.
    fn owner_terminated(&self) -> bool {
        match &self.owner {
            Some(owner) => match owner.upgrade() {
                Some(inner) => inner.state().is_terminal(),
                None => true,
            },
            None => false,
        }
    }
}

pub(crate) struct MutexInner {
    name: Option<Value>,
    tag: Option<Value>,
    core: NativeMutex<MutexCore>,
    /// Woken when the mutex is released or abandoned.
    lock_cv: Condvar,
}

impl MutexInner {
    /// Abandon the mutex on behalf of its terminating owner.
    ///
    /// No-op when the terminator no longer owns the mutex (it was released
    /// or re-acquired by someone else in the meantime).
    pub(crate) fn abandon(self: &Arc<Self>, owner: &Arc<ThreadInner>) {
        let mut core = self.core.lock();
        let owned_by_terminator = core
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|current_owner| Arc::ptr_eq(&current_owner, owner));
        if core.locked && owned_by_terminator {
            core.locked = false;
            core.abandoned = true;
            core.owner = None;
            self.lock_cv.notify_all();
            drop(core);
            emit(ThreadEvent::MutexAbandoned {
                owner: owner.id,
                timestamp: Instant::now(),
            });
            tracing::debug!(owner = %owner.id, "mutex abandoned by terminating owner");
        }
    }
}

/// An ownership-tracking, non-reentrant lock.
///
/// Cheaply clonable handle; all clones refer to the same mutex.
#[derive(Clone)]
pub struct Mutex {
    pub(crate) inner: Arc<MutexInner>,
}

impl Mutex {
    /// Create an unlocked, not-abandoned mutex.
    #[must_use]
    pub fn new(name: Option<Value>, tag: Option<Value>) -> Self {
        Self {
            inner: Arc::new(MutexInner {
                name,
                tag,
                core: NativeMutex::new(MutexCore::default()),
                lock_cv: Condvar::new(),
            }),
        }
    }

    /// The user-assigned name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&Value> {
        self.inner.name.as_ref()
    }

    /// The user-assigned tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&Value> {
        self.inner.tag.as_ref()
    }

    /// The current observable state.
    ///
    /// Observing a locked mutex whose owner has terminated upgrades it to
    /// unlocked-abandoned and wakes any blocked acquirers.
    #[must_use]
    pub fn state(&self) -> MutexState {
        let mut core = self.inner.core.lock();
        if !core.locked {
            return MutexState::Unlocked {
                abandoned: core.abandoned,
            };
        }
        match core.owner.as_ref().map(Weak::upgrade) {
            None => MutexState::LockedNotOwned,
            Some(Some(inner)) if !inner.state().is_terminal() => {
                MutexState::LockedOwned(EvalThread { inner })
            }
            Some(_) => {
                core.locked = false;
                core.abandoned = true;
                core.owner = None;
                self.inner.lock_cv.notify_all();
                MutexState::Unlocked { abandoned: true }
            }
        }
    }

    /// Acquire the mutex on behalf of `for_thread`.
    ///
    /// `for_thread` is usually the current thread; `None` acquires the
    /// mutex as locked-not-owned. Blocks up to `timeout` when contended
    /// and returns `false` if the timeout elapsed first. Acquiring an
    /// abandoned mutex succeeds but fails with *abandoned-mutex* after the
    /// handoff, signalling the hazard exactly once.
    pub fn lock(
        &self,
        timeout: Option<Duration>,
        for_thread: Option<&EvalThread>,
    ) -> Result<bool, Condition> {
        let current = ThreadRegistry::current_or("mutex-lock!")?;
        current.suspension_checkpoint()?;
        let deadline = deadline_after(timeout);
        let slice = current.context().config().suspend_slice;
        let mut core = self.inner.core.lock();
        loop {
            if core.locked && core.owner_terminated() {
                core.locked = false;
                core.abandoned = true;
                core.owner = None;
            }
            if !core.locked {
                let was_abandoned = core.abandoned;
                core.locked = true;
                core.abandoned = false;
                core.owner = for_thread.map(|thread| Arc::downgrade(&thread.inner));
                drop(core);
                if let Some(thread) = for_thread {
                    thread.note_acquired(&self.inner);
                }
                if was_abandoned {
                    tracing::debug!(thread = %current.id(), "acquired abandoned mutex");
                    return Err(ThreadError::AbandonedMutex.into());
                }
                return Ok(true);
            }
            current.check_abort()?;
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    remaining.min(slice)
                }
                None => slice,
            };
            self.inner.lock_cv.wait_for(&mut core, wait);
        }
    }

    /// Release the mutex and, when a condition variable is given, park on
    /// it until signalled, broadcast, or the timeout expires, then
    /// reacquire.
    ///
    /// The release happens after the caller is registered as a waiter, so
    /// no wakeup delivered after the handoff begins can be lost. Releases
    /// even when the caller is not the owner; ownership is advisory. When
    /// parking, returns `true` if signalled or broadcast and `false` on
    /// timeout; without a condition variable, always returns `true`.
    pub fn unlock(
        &self,
        condvar: Option<&ConditionVariable>,
        timeout: Option<Duration>,
    ) -> Result<bool, Condition> {
        let current = ThreadRegistry::current_or("mutex-unlock!")?;
        current.suspension_checkpoint()?;
        let Some(condvar) = condvar else {
            self.release();
            return Ok(true);
        };
        let deadline = deadline_after(timeout);
        let slice = current.context().config().suspend_slice;
        let signalled = condvar.park(|| self.release(), deadline, slice, &current)?;
        // Reacquire before returning; the handoff pattern and future
        // retrieval both read shared state under the mutex after waking.
        self.lock(None, Some(&current))?;
        Ok(signalled)
    }

    /// Release the mutex unconditionally and wake blocked acquirers.
    fn release(&self) {
        let mut core = self.inner.core.lock();
        let owner = core.owner.take().and_then(|weak| weak.upgrade());
        core.locked = false;
        core.abandoned = false;
        self.inner.lock_cv.notify_all();
        drop(core);
        if let Some(inner) = owner {
            EvalThread { inner }.note_released(&self.inner);
        }
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Mutex")
            .field("locked", &core.locked)
            .field("abandoned", &core.abandoned)
            .finish()
    }
}

impl NativeObject for Mutex {
    fn type_name(&self) -> &'static str {
        "mutex"
    }

    fn identity(&self) -> ObjectId {
        object_id(&self.inner)
    }

    fn trace(&self, marker: &mut Marker) {
        // The owner back-pointer is diagnostic and weak; it is deliberately
        // not traced.
        if let Some(name) = &self.inner.name {
            name.trace(marker);
        }
        if let Some(tag) = &self.inner.tag {
            tag.trace(marker);
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn test_new_mutex_state() {
        let mutex = Mutex::new(Some(Value::symbol("m")), None);
        assert_eq!(mutex.state(), MutexState::Unlocked { abandoned: false });
        assert_eq!(mutex.name(), Some(&Value::symbol("m")));
        assert!(mutex.tag().is_none());
    }

    #[test]
    fn test_lock_outside_evaluator_thread_fails() {
        let mutex = Mutex::new(None, None);
        assert_eq!(
            mutex.lock(None, None).unwrap_err(),
            ThreadError::UseInInvalidContext("mutex-lock!").into()
        );
        assert_eq!(
            mutex.unlock(None, None).unwrap_err(),
            ThreadError::UseInInvalidContext("mutex-unlock!").into()
        );
    }

    #[test]
    fn test_ownership_reporting() {
        let context = Context::new();
        let mutex = Mutex::new(None, None);
        let observed = context
            .run_main(Box::new({
                let mutex = mutex.clone();
                move || {
                    let current = ThreadRegistry::current().expect("current thread installed");
                    assert!(mutex.lock(None, Some(&current))?);
                    let owned = matches!(
                        mutex.state(),
                        MutexState::LockedOwned(owner) if owner.id() == current.id()
                    );
                    assert!(mutex.unlock(None, None)?);
                    Ok(Value::Bool(owned))
                }
            }))
            .unwrap();
        assert_eq!(observed, Value::Bool(true));
        assert_eq!(mutex.state(), MutexState::Unlocked { abandoned: false });
    }

    #[test]
    fn test_explicit_ownerless_lock() {
        let context = Context::new();
        let mutex = Mutex::new(None, None);
        context
            .run_main(Box::new({
                let mutex = mutex.clone();
                move || {
                    assert!(mutex.lock(None, None)?);
                    assert_eq!(mutex.state(), MutexState::LockedNotOwned);
                    assert!(mutex.unlock(None, None)?);
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }

    #[test]
    fn test_zero_timeout_polls_contended_lock() {
        let context = Context::new();
        let mutex = Mutex::new(None, None);
        context
            .run_main(Box::new({
                let context_for_thunk = Arc::clone(&context);
                let mutex = mutex.clone();
                move || {
                    let current = ThreadRegistry::current().expect("current thread installed");
                    assert!(mutex.lock(None, Some(&current))?);
                    // A second acquirer polling with a zero timeout fails
                    // immediately.
                    let holder = context_for_thunk.spawn(Box::new({
                        let mutex = mutex.clone();
                        move || {
                            let acquired = mutex.lock(Some(Duration::ZERO), None)?;
                            Ok(Value::Bool(acquired))
                        }
                    }))?;
                    let acquired = holder.join(None, None)?;
                    assert_eq!(acquired, Value::Bool(false));
                    mutex.unlock(None, None)?;
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }

    #[test]
    fn test_abandonment_signalled_exactly_once() {
        let context = Context::new();
        let mutex = Mutex::new(None, None);
        context
            .run_main(Box::new({
                let context_for_thunk = Arc::clone(&context);
                let mutex = mutex.clone();
                move || {
                    let holder = context_for_thunk.spawn(Box::new({
                        let mutex = mutex.clone();
                        move || {
                            let current =
                                ThreadRegistry::current().expect("current thread installed");
                            mutex.lock(None, Some(&current))?;
                            // Terminate without unlocking.
                            Ok(Value::Undef)
                        }
                    }))?;
                    holder.join(None, None)?;

                    assert_eq!(mutex.state(), MutexState::Unlocked { abandoned: true });

                    // The next acquisition succeeds but signals the hazard.
                    let current = ThreadRegistry::current().expect("current thread installed");
                    assert_eq!(
                        mutex.lock(None, Some(&current)).unwrap_err(),
                        ThreadError::AbandonedMutex.into()
                    );
                    assert!(matches!(mutex.state(), MutexState::LockedOwned(_)));

                    // The hazard is signalled exactly once.
                    mutex.unlock(None, None)?;
                    assert!(mutex.lock(None, Some(&current))?);
                    mutex.unlock(None, None)?;
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }
}
