//! Futures: single-assignment result cells.
//!
//! A [`Future`] packages "spawn a thread, capture its outcome in a result
//! cell, let any number of readers await it". The cell is built on a
//! [`Mutex`] and [`ConditionVariable`] pair and is written at most once:
//! a normal return stores `(value, is-error = false)`, a caught raise
//! stores the condition as a value with `is-error = true`. Every reader
//! observes the same result.

use crate::condvar::ConditionVariable;
use crate::mutex::Mutex;
use crate::registry::ThreadRegistry;
use crate::thread::{EvalThread, Thunk};
use crate::{deadline_after, Context};
use lispkit_rts_gc::{object_id, Marker, ObjectId, Trace};
use lispkit_value::{Condition, NativeObject, ThreadError, Value};
use parking_lot::Mutex as NativeMutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct FutureInner {
    mutex: Mutex,
    condvar: ConditionVariable,
    /// Written at most once, under the future's mutex.
    result: NativeMutex<Option<(Value, bool)>>,
}

/// A one-shot result cell with blocking retrieval.
///
/// Cheaply clonable handle; all clones refer to the same future.
#[derive(Clone)]
pub struct Future {
    inner: Arc<FutureInner>,
}

impl Future {
    /// Create a future with no result.
    #[must_use]
    pub fn new() -> Self {
        Self::with_result(None)
    }

    /// Create a future already fulfilled with a value.
    #[must_use]
    pub fn evaluated(value: Value) -> Self {
        Self::with_result(Some((value, false)))
    }

    /// Create a future already fulfilled with a raised condition value.
    #[must_use]
    pub fn failing(error: Value) -> Self {
        Self::with_result(Some((error, true)))
    }

    fn with_result(result: Option<(Value, bool)>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                mutex: Mutex::new(None, None),
                condvar: ConditionVariable::new(None, None),
                result: NativeMutex::new(result),
            }),
        }
    }

    /// Non-blocking: whether the result has been set.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.result.lock().is_some()
    }

    /// Write the result cell.
    ///
    /// Returns `false` when the result was already set; callers convert
    /// that to a *setting-future-value-twice* error. Broadcasts to all
    /// parked readers on success.
    pub fn set(&self, value: Value, is_error: bool) -> Result<bool, Condition> {
        ThreadRegistry::current_or("future-set!")?;
        self.inner.mutex.lock(None, None)?;
        let fresh = {
            let mut result = self.inner.result.lock();
            if result.is_some() {
                false
            } else {
                *result = Some((value, is_error));
                true
            }
        };
        if fresh {
            self.inner.condvar.broadcast();
            tracing::trace!(is_error, "future fulfilled");
        }
        self.inner.mutex.unlock(None, None)?;
        Ok(fresh)
    }

    /// Retrieve the result, blocking up to `timeout`.
    ///
    /// Returns `None` when the timeout expired with the result still
    /// absent. The wait is the mutex unlock-and-wait handoff, so a result
    /// set after retrieval begins is never missed.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Option<(Value, bool)>, Condition> {
        ThreadRegistry::current_or("future-get")?;
        let deadline = deadline_after(timeout);
        self.inner.mutex.lock(None, None)?;
        loop {
            if let Some(result) = self.inner.result.lock().clone() {
                self.inner.mutex.unlock(None, None)?;
                return Ok(Some(result));
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        self.inner.mutex.unlock(None, None)?;
                        return Ok(None);
                    }
                    Some(remaining)
                }
                None => None,
            };
            // Park until the producer broadcasts; reacquires the mutex, so
            // the loop re-reads the cell while holding it.
            self.inner.mutex.unlock(Some(&self.inner.condvar), remaining)?;
        }
    }

    /// Spawn a thread running `thunk`, funnelling its outcome into a fresh
    /// future.
    ///
    /// Normal returns fulfil the future with `is-error = false`; raised
    /// conditions are caught and stored with `is-error = true`, to be
    /// re-raised by every reader. An aborted producer leaves the future
    /// unfulfilled.
    pub fn spawn(context: &Arc<Context>, thunk: Thunk) -> Result<(Future, EvalThread), Condition> {
        let future = Self::new();
        let producer = future.clone();
        let body: Thunk = Box::new(move || {
            let fulfilled = match thunk() {
                Ok(value) => producer.set(value, false)?,
                Err(condition @ Condition::Error(ThreadError::TerminatedThread)) => {
                    // Termination is not a raised condition; propagate so
                    // the thread publishes its terminated result.
                    return Err(condition);
                }
                Err(condition) => producer.set(condition.into_value(), true)?,
            };
            if fulfilled {
                Ok(Value::Undef)
            } else {
                Err(ThreadError::SettingFutureValueTwice.into())
            }
        });
        let thread = context.spawn(body)?;
        Ok((future, thread))
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("done", &self.is_done())
            .finish()
    }
}

impl NativeObject for Future {
    fn type_name(&self) -> &'static str {
        "future"
    }

    fn identity(&self) -> ObjectId {
        object_id(&self.inner)
    }

    fn trace(&self, marker: &mut Marker) {
        if let Some((value, _)) = self.inner.result.lock().as_ref() {
            value.trace(marker);
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
