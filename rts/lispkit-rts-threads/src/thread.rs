//! Scheme-level threads.
//!
//! An [`EvalThread`] wraps one OS thread and an embedded evaluator
//! instance. The thread object is created fresh, started at most once, and
//! publishes exactly one terminal result that every joiner observes:
//!
//! ```text
//! result slot:  empty --> value | raised-condition | terminated
//! ```
//!
//! The abort flag is a one-shot atomic; it is observed at suspension
//! points, where the thread unwinds with a *terminated* condition so
//! Scheme-level handlers can run on the way out.

use crate::mutex::MutexInner;
use crate::registry::ThreadRegistry;
use crate::{deadline_after, emit, Context, ThreadEvent};
use lispkit_rts_gc::{object_id, Marker, ObjectId, Trace};
use lispkit_value::{Condition, NativeObject, ThreadError, Value};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A zero-argument procedure run by an evaluator thread.
pub type Thunk = Box<dyn FnOnce() -> Result<Value, Condition> + Send + 'static>;

// ============================================================================
// Identity and State
// ============================================================================

/// Stable identity of an evaluator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Allocate a fresh identity.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identity value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// State of an evaluator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet started.
    Fresh,
    /// Started, OS thread not yet scheduled.
    Runnable,
    /// The OS thread is executing the thunk.
    Running,
    /// Terminal result being published, cleanup in progress.
    Terminating,
    /// Terminal state; no transitions out.
    Terminated,
}

impl ThreadState {
    /// Whether this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// Contents of the result slot once published.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ThreadResult {
    /// The thunk returned normally.
    Value(Value),
    /// A condition escaped the thunk.
    Raised(Condition),
    /// The thread observed its abort flag and unwound.
    Terminated,
}

/// State protected by the thread's slot lock.
pub(crate) struct ThreadSlot {
    state: ThreadState,
    result: Option<ThreadResult>,
    thunk: Option<Thunk>,
}

// ============================================================================
// EvalThread
// ============================================================================

pub(crate) struct ThreadInner {
    pub(crate) id: ThreadId,
    name: Option<Value>,
    tag: Option<Value>,
    context: Arc<Context>,
    /// Result slot, state, and the not-yet-run thunk.
    slot: Mutex<ThreadSlot>,
    /// Woken when the result slot is published or the abort flag is set.
    join_cv: Condvar,
    /// Write-once cooperative cancellation flag.
    abort: AtomicBool,
    /// OS thread handle, absent until started.
    os_handle: Mutex<Option<thread::JoinHandle<()>>>,
    /// Mutexes currently held by this thread, abandoned on termination.
    held: Mutex<Vec<Arc<MutexInner>>>,
    /// Values the embedding evaluator keeps reachable for this thread
    /// (stack, registers, thunk captures).
    pinned: Mutex<Vec<Value>>,
}

impl ThreadInner {
    pub(crate) fn state(&self) -> ThreadState {
        self.slot.lock().state
    }
}

/// A Scheme-level thread.
///
/// Cheaply clonable handle; all clones refer to the same thread.
#[derive(Clone)]
pub struct EvalThread {
    pub(crate) inner: Arc<ThreadInner>,
}

impl EvalThread {
    /// Create a fresh thread without an OS thread.
    #[must_use]
    pub fn new(
        context: &Arc<Context>,
        thunk: Thunk,
        name: Option<Value>,
        tag: Option<Value>,
    ) -> Self {
        let id = ThreadId::new();
        let thread = Self {
            inner: Arc::new(ThreadInner {
                id,
                name,
                tag,
                context: Arc::clone(context),
                slot: Mutex::new(ThreadSlot {
                    state: ThreadState::Fresh,
                    result: None,
                    thunk: Some(thunk),
                }),
                join_cv: Condvar::new(),
                abort: AtomicBool::new(false),
                os_handle: Mutex::new(None),
                held: Mutex::new(Vec::new()),
                pinned: Mutex::new(Vec::new()),
            }),
        };
        emit(ThreadEvent::Created {
            id,
            timestamp: Instant::now(),
        });
        thread
    }

    /// The thread's stable identity.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.inner.id
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

    /// The owning evaluator context.
    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    /// The thread's current state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.inner.state()
    }

    /// Whether the thread has reached its terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the abort flag has been set.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.inner.abort.load(Ordering::Acquire)
    }

    /// Fail with a *terminated* condition if the abort flag is set.
    ///
    /// Called on every wake at a suspension point.
    pub(crate) fn check_abort(&self) -> Result<(), Condition> {
        if self.aborted() {
            Err(ThreadError::TerminatedThread.into())
        } else {
            Ok(())
        }
    }

    /// Suspension-point entry: rendezvous with the collector if a pause is
    /// requested, then observe the abort flag.
    ///
    /// Callers must hold no runtime locks.
    pub(crate) fn suspension_checkpoint(&self) -> Result<(), Condition> {
        self.inner.context.barrier().safepoint();
        self.check_abort()
    }

    /// Keep a value reachable for the GC on behalf of this thread.
    ///
    /// The embedding evaluator pins whatever its stack and registers hold
    /// for the thread; pinned values are traced during root enumeration.
    pub fn pin(&self, value: Value) {
        self.inner.pinned.lock().push(value);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the thread: fresh → runnable, spawning the OS thread.
    ///
    /// Fails with *thread-already-started* if started before, and with
    /// *thread-already-terminated* if the thread already reached its
    /// terminal state.
    pub fn start(&self) -> Result<(), Condition> {
        let thunk = {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                ThreadState::Fresh => {}
                ThreadState::Terminated => {
                    return Err(ThreadError::ThreadAlreadyTerminated.into())
                }
                _ => return Err(ThreadError::ThreadAlreadyStarted.into()),
            }
            slot.state = ThreadState::Runnable;
            slot.thunk.take().expect("fresh thread has a thunk")
        };

        self.inner.context.registry().register(self);

        let config = self.inner.context.config();
        let body_thread = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", config.name_prefix, self.id().raw()))
            .stack_size(config.stack_size)
            .spawn(move || body_thread.run_body(thunk))
            .expect("failed to spawn evaluator thread");
        *self.inner.os_handle.lock() = Some(handle);

        emit(ThreadEvent::Started {
            id: self.id(),
            timestamp: Instant::now(),
        });
        tracing::debug!(thread = %self.id(), "thread started");
        Ok(())
    }

    /// Thread body protocol: install as current, run the thunk, publish
    /// the outcome, wake joiners, unregister.
    fn run_body(self, thunk: Thunk) {
        ThreadRegistry::install_current(&self);
        self.inner.slot.lock().state = ThreadState::Running;
        tracing::trace!(thread = %self.id(), "thread running");

        let outcome = panic::catch_unwind(AssertUnwindSafe(thunk));
        let result = match outcome {
            Ok(Ok(value)) => ThreadResult::Value(value),
            Ok(Err(Condition::Error(ThreadError::TerminatedThread))) => ThreadResult::Terminated,
            Ok(Err(condition)) => ThreadResult::Raised(condition),
            Err(payload) => ThreadResult::Raised(Condition::from_panic(payload)),
        };

        self.finish(result);
        self.inner.context.registry().unregister(self.id());
        ThreadRegistry::clear_current();
    }

    /// Run the thunk on the calling OS thread, as the main thread does.
    pub(crate) fn run_on_caller(&self) -> Result<Value, Condition> {
        let thunk = {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                ThreadState::Fresh => {}
                ThreadState::Terminated => {
                    return Err(ThreadError::ThreadAlreadyTerminated.into())
                }
                _ => return Err(ThreadError::ThreadAlreadyStarted.into()),
            }
            slot.state = ThreadState::Running;
            slot.thunk.take().expect("fresh thread has a thunk")
        };

        self.inner.context.registry().register(self);
        ThreadRegistry::install_current(self);

        let outcome = panic::catch_unwind(AssertUnwindSafe(thunk));
        let result = match &outcome {
            Ok(Ok(value)) => ThreadResult::Value(value.clone()),
            Ok(Err(Condition::Error(ThreadError::TerminatedThread))) => ThreadResult::Terminated,
            Ok(Err(condition)) => ThreadResult::Raised(condition.clone()),
            Err(_) => ThreadResult::Raised(Condition::raise(Value::string(
                "native procedure panicked",
            ))),
        };

        self.finish(result);
        self.inner.context.registry().unregister(self.id());
        ThreadRegistry::clear_current();

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(Condition::from_panic(payload)),
        }
    }

    /// Publish the terminal result: terminating → abandon held mutexes →
    /// terminated, waking every joiner.
    fn finish(&self, result: ThreadResult) {
        self.inner.slot.lock().state = ThreadState::Terminating;

        let held = std::mem::take(&mut *self.inner.held.lock());
        for mutex in held {
            mutex.abandon(&self.inner);
        }

        {
            let mut slot = self.inner.slot.lock();
            if slot.result.is_none() {
                slot.result = Some(result);
            }
            slot.state = ThreadState::Terminated;
            self.inner.join_cv.notify_all();
        }

        emit(ThreadEvent::Terminated {
            id: self.id(),
            timestamp: Instant::now(),
        });
        tracing::debug!(thread = %self.id(), "thread terminated");
    }

    /// Hint the OS to reschedule.
    pub fn yield_now() {
        thread::yield_now();
    }

    /// Suspend the current thread for at least the requested duration.
    ///
    /// Cancellable: an abort wakes the sleeper immediately and unwinds
    /// with a *terminated* condition.
    pub fn sleep(duration: Duration) -> Result<(), Condition> {
        let current = ThreadRegistry::current_or("thread-sleep!")?;
        current.suspension_checkpoint()?;
        let deadline = Instant::now().checked_add(duration);
        let mut slot = current.inner.slot.lock();
        loop {
            // Checked under the slot lock: an abort notifies this condvar
            // while holding the same lock, so the flag cannot be set
            // between this check and parking.
            current.check_abort()?;
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(());
                    }
                    remaining
                }
                None => Duration::MAX,
            };
            // An abort wakes this thread's own condvar, so the full
            // remaining duration can be waited in one slice.
            current.inner.join_cv.wait_for(&mut slot, remaining);
        }
    }

    /// Set the abort flag and wake the target if it is suspended.
    ///
    /// Returns the target's identity when the target is another thread (so
    /// the caller can wait for termination) and `None` when the target is
    /// the calling thread itself.
    pub fn abort(&self) -> Option<ThreadId> {
        self.inner.abort.store(true, Ordering::Release);
        {
            // Notify under the slot lock so a thread between its abort
            // check and parking cannot miss the wakeup.
            let _slot = self.inner.slot.lock();
            self.inner.join_cv.notify_all();
        }
        emit(ThreadEvent::Aborted {
            id: self.id(),
            timestamp: Instant::now(),
        });
        tracing::debug!(thread = %self.id(), "thread abort requested");
        match ThreadRegistry::current() {
            Some(current) if current.id() == self.id() => None,
            _ => Some(self.id()),
        }
    }

    /// Terminate the target thread.
    ///
    /// A fresh target publishes its `terminated` result immediately. For a
    /// running target the caller blocks until termination completes. When
    /// the target is the calling thread itself this fails with the
    /// *terminated* condition, which unwinds to the outermost evaluator
    /// frame.
    pub fn terminate(&self) -> Result<(), Condition> {
        {
            let mut slot = self.inner.slot.lock();
            if slot.state == ThreadState::Fresh {
                self.inner.abort.store(true, Ordering::Release);
                slot.thunk = None;
                slot.result = Some(ThreadResult::Terminated);
                slot.state = ThreadState::Terminated;
                self.inner.join_cv.notify_all();
                drop(slot);
                emit(ThreadEvent::Terminated {
                    id: self.id(),
                    timestamp: Instant::now(),
                });
                tracing::debug!(thread = %self.id(), "fresh thread terminated");
                return Ok(());
            }
        }

        match self.abort() {
            None => Err(ThreadError::TerminatedThread.into()),
            Some(_) => {
                self.wait_terminated(None)?;
                Ok(())
            }
        }
    }

    /// Block until the thread reaches its terminal state.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first. A suspension
    /// point for the waiting thread, when one exists.
    pub fn wait_terminated(&self, timeout: Option<Duration>) -> Result<bool, Condition> {
        let waiter = ThreadRegistry::current();
        if let Some(waiter) = &waiter {
            waiter.suspension_checkpoint()?;
        }
        let deadline = deadline_after(timeout);
        let slice = self.inner.context.config().suspend_slice;
        let mut slot = self.inner.slot.lock();
        loop {
            if slot.state.is_terminal() {
                return Ok(true);
            }
            if let Some(waiter) = &waiter {
                waiter.check_abort()?;
            }
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
            self.inner.join_cv.wait_for(&mut slot, wait);
        }
    }

    /// Wait for the result slot and surface its contents.
    ///
    /// - normal value → returned
    /// - raised condition → re-raised wrapped as *uncaught-exception*,
    ///   after consulting the evaluator's continuable-raise procedure
    /// - terminated → *terminated-thread* condition
    /// - timeout with default → the default
    /// - timeout without default → *join-timeout* condition
    pub fn join(
        &self,
        timeout: Option<Duration>,
        default: Option<Value>,
    ) -> Result<Value, Condition> {
        let joiner = ThreadRegistry::current().ok_or(ThreadError::JoinInInvalidContext)?;
        joiner.suspension_checkpoint()?;
        let deadline = deadline_after(timeout);
        let slice = joiner.context().config().suspend_slice;
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(result) = slot.result.clone() {
                drop(slot);
                return match result {
                    ThreadResult::Value(value) => Ok(value),
                    ThreadResult::Terminated => Err(ThreadError::TerminatedThread.into()),
                    ThreadResult::Raised(condition) => {
                        let wrapped: Condition =
                            ThreadError::UncaughtException(Box::new(condition)).into();
                        match self.inner.context.raise_continuable(&wrapped) {
                            Some(value) => Ok(value),
                            None => Err(wrapped),
                        }
                    }
                };
            }
            joiner.check_abort()?;
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        drop(slot);
                        return match default {
                            Some(value) => Ok(value),
                            None => Err(ThreadError::JoinTimeout.into()),
                        };
                    }
                    remaining.min(slice)
                }
                None => slice,
            };
            self.inner.join_cv.wait_for(&mut slot, wait);
        }
    }

    // ------------------------------------------------------------------
    // Held-mutex bookkeeping
    // ------------------------------------------------------------------

    /// Record a mutex acquired on behalf of this thread.
    pub(crate) fn note_acquired(&self, mutex: &Arc<MutexInner>) {
        let mut held = self.inner.held.lock();
        // A terminated owner has already abandoned its list; the lazy
        // owner-liveness check covers this mutex instead.
        if self.inner.state() == ThreadState::Terminated {
            return;
        }
        held.push(Arc::clone(mutex));
    }

    /// Record that a mutex held by this thread was released.
    pub(crate) fn note_released(&self, mutex: &Arc<MutexInner>) {
        let mut held = self.inner.held.lock();
        if let Some(position) = held.iter().position(|held| Arc::ptr_eq(held, mutex)) {
            held.swap_remove(position);
        }
    }
}

impl PartialEq for EvalThread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EvalThread {}

impl fmt::Debug for EvalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalThread")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("aborted", &self.aborted())
            .finish()
    }
}

impl NativeObject for EvalThread {
    fn type_name(&self) -> &'static str {
        "thread"
    }

    fn identity(&self) -> ObjectId {
        object_id(&self.inner)
    }

    fn trace(&self, marker: &mut Marker) {
        if let Some(name) = &self.inner.name {
            name.trace(marker);
        }
        if let Some(tag) = &self.inner.tag {
            tag.trace(marker);
        }
        for pinned in self.inner.pinned.lock().iter() {
            pinned.trace(marker);
        }
        let slot = self.inner.slot.lock();
        match &slot.result {
            Some(ThreadResult::Value(value)) => value.trace(marker),
            Some(ThreadResult::Raised(condition)) => condition.trace(marker),
            Some(ThreadResult::Terminated) | None => {}
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Trace for EvalThread {
    fn trace(&self, marker: &mut Marker) {
        if marker.mark_object(self.identity()) {
            NativeObject::trace(self, marker);
        }
    }
}
