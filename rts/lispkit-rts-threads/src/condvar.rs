//! Condition variables.
//!
//! A [`ConditionVariable`] is a wait queue with signal/broadcast, bound
//! transiently to a [`Mutex`](crate::Mutex) during a wait: the intended
//! usage is `mutex-unlock!` with a condition variable, which registers the
//! caller as a waiter before releasing the mutex so no wakeup delivered
//! after the handoff begins can be lost.
//!
//! Signals are lost when no waiter is parked; semaphore semantics are not
//! provided.

use crate::thread::EvalThread;
use lispkit_rts_gc::{object_id, Marker, ObjectId, Trace};
use lispkit_value::{Condition, NativeObject, ThreadError, Value};
use parking_lot::{Condvar, Mutex as NativeMutex};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wait-queue state protected by the condvar's native lock.
#[derive(Debug, Default)]
struct CvQueue {
    /// Number of threads currently parked.
    waiters: usize,
    /// Signal tokens granted but not yet consumed; never exceeds the
    /// number of parked waiters, so each signal wakes at most one.
    signals: usize,
    /// Bumped on broadcast; waiters compare against their entry epoch.
    broadcast_epoch: u64,
}

pub(crate) struct CondvarInner {
    name: Option<Value>,
    tag: Option<Value>,
    queue: NativeMutex<CvQueue>,
    cv: Condvar,
}

/// A signal/broadcast wait queue.
///
/// Cheaply clonable handle; all clones refer to the same condition
/// variable.
#[derive(Clone)]
pub struct ConditionVariable {
    inner: Arc<CondvarInner>,
}

impl ConditionVariable {
    /// Create a condition variable with no parked waiters.
    #[must_use]
    pub fn new(name: Option<Value>, tag: Option<Value>) -> Self {
        Self {
            inner: Arc::new(CondvarInner {
                name,
                tag,
                queue: NativeMutex::new(CvQueue::default()),
                cv: Condvar::new(),
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

    /// Number of threads currently parked on this condition variable.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.queue.lock().waiters
    }

    /// Wake at most one parked waiter.
    ///
    /// A signal with no waiter parked is lost.
    pub fn signal(&self) {
        let mut queue = self.inner.queue.lock();
        if queue.waiters > queue.signals {
            queue.signals += 1;
            self.inner.cv.notify_all();
        }
    }

    /// Wake all parked waiters.
    pub fn broadcast(&self) {
        let mut queue = self.inner.queue.lock();
        if queue.waiters > 0 {
            queue.broadcast_epoch = queue.broadcast_epoch.wrapping_add(1);
            queue.signals = 0;
            self.inner.cv.notify_all();
        }
    }

    /// Park the current thread on this condition variable.
    ///
    /// `release` runs after the caller is registered as a waiter and
    /// before parking, which is what makes the mutex unlock-and-wait
    /// handoff atomic. Returns `true` when woken by a signal or broadcast
    /// and `false` when the deadline expired. The wait is sliced so an
    /// abort of the parked thread is observed promptly and unwinds with a
    /// *terminated* condition.
    pub(crate) fn park(
        &self,
        release: impl FnOnce(),
        deadline: Option<Instant>,
        slice: Duration,
        current: &EvalThread,
    ) -> Result<bool, Condition> {
        let mut queue = self.inner.queue.lock();
        queue.waiters += 1;
        let epoch = queue.broadcast_epoch;
        release();
        let outcome = loop {
            if current.aborted() {
                break Err(Condition::from(ThreadError::TerminatedThread));
            }
            if queue.signals > 0 {
                queue.signals -= 1;
                break Ok(true);
            }
            if queue.broadcast_epoch != epoch {
                break Ok(true);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Ok(false);
                    }
                    remaining.min(slice)
                }
                None => slice,
            };
            self.inner.cv.wait_for(&mut queue, wait);
        };
        queue.waiters -= 1;
        if queue.waiters == 0 {
            // Tokens granted to waiters that left (timeout, abort) must not
            // wake a future waiter; signals are not stored.
            queue.signals = 0;
        }
        outcome
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

impl NativeObject for ConditionVariable {
    fn type_name(&self) -> &'static str {
        "condition-variable"
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
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
