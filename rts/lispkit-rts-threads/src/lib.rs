//! Multi-threaded evaluator core for the LispKit runtime.
//!
//! This crate implements the concurrency core of the interpreter: the
//! lifecycle of Scheme-level threads, SRFI-18-style mutexes and condition
//! variables with ownership and abandonment semantics, and the future
//! abstraction built on top of them. Key pieces:
//!
//! - **[`EvalThread`]** - a Scheme-level thread wrapping one OS thread and
//!   an embedded evaluator instance; owns join-result propagation and abort
//!   signalling
//! - **[`Mutex`]** - an ownership-tracking lock with four observable states
//!   and an atomic unlock-and-wait handoff to a condition variable
//! - **[`ConditionVariable`]** - signal/broadcast primitive bound
//!   transiently to a mutex during a wait
//! - **[`Future`]** - a one-shot result cell distinguishing values from
//!   raised errors, with timed retrieval
//! - **[`ThreadRegistry`]** - process-wide catalog of live evaluator
//!   threads, current-thread lookup, and GC root enumeration
//!
//! # Thread Lifecycle
//!
//! ```text
//!             start                scheduled
//! +-------+          +----------+            +---------+
//! | Fresh | -------> | Runnable | ---------> | Running |
//! +-------+          +----------+            +---------+
//!                                                 |
//!                        abort / exception / normal return
//!                                                 v
//!                                         +-------------+
//!                                         | Terminating |
//!                                         +-------------+
//!                                                 |
//!                                                 v
//!                                         +------------+
//!                                         | Terminated |
//!                                         +------------+
//! ```
//!
//! The terminated state is final: the result slot transitions exactly once
//! from empty to one of (value, raised-condition, terminated), and every
//! joiner observes that same result.
//!
//! # Cancellation Model
//!
//! Cancellation is cooperative. `thread-terminate!` sets a one-shot abort
//! flag; the target observes it at its next suspension point (sleep, mutex
//! wait, condvar wait, join, future get) and unwinds with a *terminated*
//! condition, letting Scheme-level handlers run on the way out. A thread in
//! a tight loop with no suspension point is not forcibly preempted.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod condvar;
pub mod future;
pub mod mutex;
pub mod registry;
pub mod thread;

pub use condvar::ConditionVariable;
pub use future::Future;
pub use lispkit_value::{Condition, ThreadError};
pub use mutex::{Mutex, MutexState};
pub use registry::ThreadRegistry;
pub use thread::{EvalThread, ThreadId, ThreadState, Thunk};

use lispkit_rts_gc::SafepointBarrier;
use lispkit_value::Value;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Event Tracing
// ============================================================================

/// Thread lifecycle events delivered to a registered callback.
#[derive(Debug, Clone)]
pub enum ThreadEvent {
    /// A thread object was created (still fresh).
    Created {
        /// Thread identity.
        id: ThreadId,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A thread was started and its OS thread spawned.
    Started {
        /// Thread identity.
        id: ThreadId,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A thread's abort flag was set.
    Aborted {
        /// Thread identity.
        id: ThreadId,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A thread reached its terminal state.
    Terminated {
        /// Thread identity.
        id: ThreadId,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A mutex was abandoned by its terminating owner.
    MutexAbandoned {
        /// The owner that terminated while holding the mutex.
        owner: ThreadId,
        /// Timestamp.
        timestamp: Instant,
    },
}

/// Callback type for thread lifecycle events.
pub type EventCallback = Box<dyn Fn(ThreadEvent) + Send + Sync>;

/// Global event callback storage.
static EVENT_CALLBACK: RwLock<Option<EventCallback>> = RwLock::new(None);

/// Set the global event callback.
///
/// Events will be delivered to this callback as they occur.
pub fn set_event_callback(callback: EventCallback) {
    *EVENT_CALLBACK.write() = Some(callback);
}

/// Clear the global event callback.
pub fn clear_event_callback() {
    *EVENT_CALLBACK.write() = None;
}

/// Emit a lifecycle event.
pub(crate) fn emit(event: ThreadEvent) {
    if let Some(callback) = EVENT_CALLBACK.read().as_ref() {
        callback(event);
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for evaluator threads.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Stack size for evaluator OS threads.
    pub stack_size: usize,
    /// Name prefix for evaluator OS threads.
    pub name_prefix: String,
    /// Wait slice at suspension points; bounds how long an abort request
    /// can go unobserved by a thread blocked on a contended resource.
    pub suspend_slice: Duration,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            stack_size: 4 * 1024 * 1024, // 4 MB
            name_prefix: "lispkit-eval".to_string(),
            suspend_slice: Duration::from_millis(10),
        }
    }
}

/// Compute the instant a timeout expires, if any.
///
/// `None` means wait forever; a timeout too large to represent is treated
/// the same way.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

// ============================================================================
// Evaluator Context
// ============================================================================

/// Hook consulted when a stored thread error is surfaced at join.
///
/// Returning `Some(value)` continues the joining computation with that
/// value; returning `None` lets the condition escape to the caller.
pub type RaiseContinuable = Arc<dyn Fn(&Condition) -> Option<Value> + Send + Sync>;

/// The evaluator context owning the process-wide thread machinery.
///
/// Created explicitly when an evaluator is set up and torn down explicitly
/// when it goes away; nothing here relies on implicit static initialization
/// ordering. Every [`EvalThread`] holds a back-pointer to its context.
pub struct Context {
    registry: Arc<ThreadRegistry>,
    config: ThreadConfig,
    barrier: Arc<SafepointBarrier>,
    raise_continuable: RwLock<Option<RaiseContinuable>>,
}

impl Context {
    /// Create a context with the default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(ThreadConfig::default())
    }

    /// Create a context with the given configuration.
    #[must_use]
    pub fn with_config(config: ThreadConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(ThreadRegistry::new()),
            config,
            barrier: Arc::new(SafepointBarrier::new()),
            raise_continuable: RwLock::new(None),
        })
    }

    /// The process-wide thread registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// The thread configuration.
    #[must_use]
    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// The GC safepoint barrier consulted at every suspension point.
    #[must_use]
    pub fn barrier(&self) -> &Arc<SafepointBarrier> {
        &self.barrier
    }

    /// Install the evaluator's continuable-raise procedure.
    pub fn set_raise_continuable(&self, handler: RaiseContinuable) {
        *self.raise_continuable.write() = Some(handler);
    }

    /// Remove the continuable-raise procedure.
    pub fn clear_raise_continuable(&self) {
        *self.raise_continuable.write() = None;
    }

    /// Consult the continuable-raise procedure for a surfaced condition.
    pub(crate) fn raise_continuable(&self, condition: &Condition) -> Option<Value> {
        let handler = self.raise_continuable.read().as_ref().map(Arc::clone);
        handler.and_then(|handler| handler(condition))
    }

    /// Create a fresh evaluator thread in this context.
    #[must_use]
    pub fn make_thread(
        self: &Arc<Self>,
        thunk: Thunk,
        name: Option<Value>,
        tag: Option<Value>,
    ) -> EvalThread {
        EvalThread::new(self, thunk, name, tag)
    }

    /// Create and immediately start an evaluator thread.
    pub fn spawn(self: &Arc<Self>, thunk: Thunk) -> Result<EvalThread, Condition> {
        let thread = self.make_thread(thunk, None, None);
        thread.start()?;
        Ok(thread)
    }

    /// Run a thunk as the main evaluator thread on the calling OS thread.
    ///
    /// The calling thread is registered for the duration of the call, so
    /// all primitives requiring a current thread work inside the thunk.
    /// Conditions escaping the thunk propagate to the caller unchanged.
    pub fn run_main(self: &Arc<Self>, thunk: Thunk) -> Result<Value, Condition> {
        let thread = self.make_thread(thunk, Some(Value::symbol("main")), None);
        thread.run_on_caller()
    }

    /// Terminate every live evaluator thread and wait for each to finish.
    ///
    /// The termination barrier of evaluator teardown. May be called from a
    /// non-evaluator thread; the calling thread itself (if registered) is
    /// skipped.
    pub fn teardown(&self) {
        let current_id = ThreadRegistry::current().map(|t| t.id());
        let live = self.registry.live_threads();
        for thread in &live {
            if Some(thread.id()) != current_id {
                thread.abort();
            }
        }
        for thread in &live {
            if Some(thread.id()) != current_id {
                // Ignore abort of the waiter itself; teardown still drains.
                let _ = thread.wait_terminated(None);
            }
        }
        tracing::debug!(threads = live.len(), "evaluator context torn down");
    }
}
