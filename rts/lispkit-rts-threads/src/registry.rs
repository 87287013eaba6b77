//! Process-wide catalog of live evaluator threads.
//!
//! The registry tracks every thread between `thread-start!` and
//! termination, provides current-thread lookup through OS thread-local
//! storage, and hands the garbage collector every live thread during root
//! enumeration.

use crate::thread::{EvalThread, ThreadId};
use lispkit_rts_gc::{Marker, RootProvider};
use lispkit_value::{Condition, ThreadError};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    /// The evaluator thread executing on this OS thread, if any.
    static CURRENT: RefCell<Option<EvalThread>> = const { RefCell::new(None) };
}

/// Process-wide catalog of all live evaluator threads.
///
/// Membership brackets the lifetime of a thread: a thread is registered
/// when started and unregistered after its result slot is published and
/// all joiners have been woken. The membership set is mutated only under
/// the registry's own lock.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<FxHashMap<ThreadId, EvalThread>>,
    allocated: AtomicU64,
}

impl ThreadRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a started thread to the membership set.
    pub(crate) fn register(&self, thread: &EvalThread) {
        self.threads.lock().insert(thread.id(), thread.clone());
        self.allocated.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(thread = %thread.id(), "thread registered");
    }

    /// Remove a terminated thread from the membership set.
    pub(crate) fn unregister(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
        tracing::debug!(thread = %id, "thread unregistered");
    }

    /// The evaluator thread executing on the calling OS thread.
    ///
    /// Returns `None` when the calling OS thread is not an evaluator
    /// thread.
    #[must_use]
    pub fn current() -> Option<EvalThread> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Like [`current`], but fails with *mutex-use-in-invalid-context*
    /// naming the operation when no current thread exists.
    ///
    /// [`current`]: ThreadRegistry::current
    pub fn current_or(operation: &'static str) -> Result<EvalThread, Condition> {
        Self::current().ok_or_else(|| ThreadError::UseInInvalidContext(operation).into())
    }

    /// Install the current thread for the calling OS thread.
    pub(crate) fn install_current(thread: &EvalThread) {
        CURRENT.with(|current| {
            *current.borrow_mut() = Some(thread.clone());
        });
    }

    /// Clear the current thread for the calling OS thread.
    pub(crate) fn clear_current() {
        CURRENT.with(|current| {
            *current.borrow_mut() = None;
        });
    }

    /// Number of threads currently registered.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Total number of threads ever registered.
    #[must_use]
    pub fn allocated_count(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Snapshot of the currently registered threads.
    #[must_use]
    pub fn live_threads(&self) -> Vec<EvalThread> {
        self.threads.lock().values().cloned().collect()
    }

    /// Block until the target thread reaches its terminal state.
    ///
    /// Used by the synchronous branch of `thread-terminate!`.
    pub fn wait_for_termination(&self, thread: &EvalThread) -> Result<(), Condition> {
        thread.wait_terminated(None).map(|_| ())
    }
}

impl RootProvider for ThreadRegistry {
    /// Hand the collector every live thread.
    ///
    /// Each thread traces its name, tag, pinned values, and result slot.
    /// Must only run while mutators are paused at safepoints; thread state
    /// locks are taken during the walk.
    fn enumerate_roots(&self, marker: &mut Marker) {
        for thread in self.live_threads() {
            marker.visit_root(&thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_none_outside_evaluator_threads() {
        assert!(ThreadRegistry::current().is_none());
        let error = ThreadRegistry::current_or("mutex-lock!").unwrap_err();
        assert_eq!(
            error,
            ThreadError::UseInInvalidContext("mutex-lock!").into()
        );
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = ThreadRegistry::new();
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.allocated_count(), 0);
        assert!(registry.live_threads().is_empty());
    }
}
