//! Collector interface for the LispKit runtime.
//!
//! This crate defines the minimal surface the tracing garbage collector and
//! the rest of the runtime share:
//!
//! - **Tracing** - the [`Trace`] trait, implemented by every heap value and
//!   managed object so the collector can descend through it
//! - **Marking** - the [`Marker`] visitor, which records reachable object
//!   identities and makes traversal of cyclic structures terminate
//! - **Root enumeration** - the [`RootProvider`] trait, implemented by the
//!   thread registry to hand the collector every live evaluator thread
//! - **Safepoints** - the [`SafepointBarrier`] rendezvous, which suspends
//!   mutator threads while the collector walks their state
//!
//! # Marking Model
//!
//! Values are shared through reference-counted allocations. The collector
//! does not move objects; it computes reachability by walking the object
//! graph from the roots and recording the identity of every shared
//! allocation it reaches:
//!
//! ```text
//! roots --> Marker::mark_object --> newly marked? --> Trace::trace children
//!                    |                    |
//!                    |                    +-- already marked: stop (cycles)
//!                    +-- identity = shared-allocation address
//! ```
//!
//! Weak diagnostic references (such as a mutex's owner back-pointer) are
//! never traced; only logically held references keep an object reachable.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Tracing
// ============================================================================

/// A value the collector can descend through.
///
/// Implementations visit every logically held child reference. Shared
/// allocations must be registered with [`Marker::mark_object`] before their
/// children are traced, and traversal must stop when the object was already
/// marked.
pub trait Trace {
    /// Visit all reachable children of this value.
    fn trace(&self, marker: &mut Marker);
}

/// Identity of a shared allocation, used as the key of the mark set.
///
/// For an `Arc`-backed object this is the address of the shared allocation,
/// so every handle cloned from the same allocation has the same identity.
pub type ObjectId = usize;

/// Compute the [`ObjectId`] of a shared allocation.
#[must_use]
pub fn object_id<T: ?Sized>(arc: &Arc<T>) -> ObjectId {
    Arc::as_ptr(arc) as *const () as ObjectId
}

// ============================================================================
// Marking
// ============================================================================

/// Reachability-marking visitor handed to [`Trace::trace`].
///
/// The marker records every object identity it has seen, which both yields
/// the reachable set and guarantees termination on cyclic object graphs
/// (thread ↔ mutex ↔ condvar ↔ future cycles are expected and safe).
#[derive(Debug, Default)]
pub struct Marker {
    marked: FxHashSet<ObjectId>,
    roots_visited: usize,
}

impl Marker {
    /// Create an empty marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an object as reachable.
    ///
    /// Returns `true` if the object was newly marked; the caller must trace
    /// the object's children exactly when this returns `true`.
    pub fn mark_object(&mut self, id: ObjectId) -> bool {
        self.marked.insert(id)
    }

    /// Check whether an object has been marked in this cycle.
    #[must_use]
    pub fn is_marked(&self, id: ObjectId) -> bool {
        self.marked.contains(&id)
    }

    /// Number of distinct objects marked so far.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    /// Number of root sites visited so far.
    #[must_use]
    pub fn roots_visited(&self) -> usize {
        self.roots_visited
    }

    /// Record that a root site was visited and trace the value held there.
    pub fn visit_root(&mut self, root: &dyn Trace) {
        self.roots_visited += 1;
        root.trace(self);
    }
}

// ============================================================================
// Root Enumeration
// ============================================================================

/// A source of GC roots.
///
/// The thread registry implements this to hand the collector every live
/// evaluator thread, which in turn traces its result slot, pinned values,
/// name, and tag.
pub trait RootProvider: Send + Sync {
    /// Visit every root currently held by this provider.
    fn enumerate_roots(&self, marker: &mut Marker);
}

/// Run a full marking pass over the given root providers.
///
/// Returns the populated marker; callers query it with [`Marker::is_marked`]
/// to decide liveness.
#[must_use]
pub fn mark_reachable(providers: &[&dyn RootProvider]) -> Marker {
    let mut marker = Marker::new();
    for provider in providers {
        provider.enumerate_roots(&mut marker);
    }
    marker
}

// ============================================================================
// Safepoints
// ============================================================================

/// State shared between the collector and parked mutators.
#[derive(Debug, Default)]
struct BarrierState {
    /// Collector has requested a pause.
    pause_requested: bool,
    /// Number of mutator threads currently parked at the barrier.
    parked: usize,
    /// Incremented on every resume so parked threads know their pause ended.
    epoch: u64,
}

/// Stop-the-world rendezvous between the collector and mutator threads.
///
/// Mutators call [`SafepointBarrier::safepoint`] at every suspension point
/// while holding no runtime locks. When the collector has requested a pause
/// the mutator parks until [`SafepointBarrier::resume`] is called; otherwise
/// the call is a cheap flag check.
#[derive(Debug, Default)]
pub struct SafepointBarrier {
    state: Mutex<BarrierState>,
    /// Woken when a mutator parks (collector side).
    parked_cv: Condvar,
    /// Woken on resume (mutator side).
    resume_cv: Condvar,
}

impl SafepointBarrier {
    /// Create a new barrier with no pause requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a pause is currently requested.
    #[must_use]
    pub fn pause_requested(&self) -> bool {
        self.state.lock().pause_requested
    }

    /// Request that mutators park at their next safepoint.
    pub fn request_pause(&self) {
        self.state.lock().pause_requested = true;
    }

    /// Block until at least `expected` mutators are parked.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_parked(&self, expected: usize, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while state.parked < expected {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.parked_cv.wait_for(&mut state, remaining).timed_out() {
                return state.parked >= expected;
            }
        }
        true
    }

    /// Release all parked mutators and clear the pause request.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.pause_requested = false;
        state.epoch = state.epoch.wrapping_add(1);
        self.resume_cv.notify_all();
    }

    /// Mutator-side safepoint.
    ///
    /// If no pause is requested this returns immediately. Otherwise the
    /// calling thread parks until the collector resumes. Callers must not
    /// hold runtime locks across this call.
    pub fn safepoint(&self) {
        let mut state = self.state.lock();
        if !state.pause_requested {
            return;
        }
        let epoch = state.epoch;
        state.parked += 1;
        self.parked_cv.notify_all();
        while state.pause_requested && state.epoch == epoch {
            self.resume_cv.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Number of mutators currently parked.
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.state.lock().parked
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// A shared node that may point back into the graph, for cycle tests.
    #[derive(Debug)]
    struct Node {
        next: Mutex<Option<Arc<Node>>>,
    }

    impl Trace for Arc<Node> {
        fn trace(&self, marker: &mut Marker) {
            if marker.mark_object(object_id(self)) {
                if let Some(next) = self.next.lock().as_ref() {
                    next.trace(marker);
                }
            }
        }
    }

    #[test]
    fn test_mark_is_idempotent() {
        let node = Arc::new(Node {
            next: Mutex::new(None),
        });
        let mut marker = Marker::new();
        assert!(marker.mark_object(object_id(&node)));
        assert!(!marker.mark_object(object_id(&node)));
        assert!(marker.is_marked(object_id(&node)));
        assert_eq!(marker.marked_count(), 1);
    }

    #[test]
    fn test_cyclic_graph_terminates() {
        let a = Arc::new(Node {
            next: Mutex::new(None),
        });
        let b = Arc::new(Node {
            next: Mutex::new(Some(Arc::clone(&a))),
        });
        *a.next.lock() = Some(Arc::clone(&b));

        let mut marker = Marker::new();
        a.trace(&mut marker);
        assert_eq!(marker.marked_count(), 2);
        assert!(marker.is_marked(object_id(&b)));
    }

    #[test]
    fn test_clones_share_identity() {
        let node = Arc::new(Node {
            next: Mutex::new(None),
        });
        let clone = Arc::clone(&node);
        assert_eq!(object_id(&node), object_id(&clone));
    }

    #[test]
    fn test_root_provider_enumeration() {
        struct Roots(Vec<Arc<Node>>);
        impl RootProvider for Roots {
            fn enumerate_roots(&self, marker: &mut Marker) {
                for root in &self.0 {
                    marker.visit_root(root);
                }
            }
        }

        let roots = Roots(vec![
            Arc::new(Node {
                next: Mutex::new(None),
            }),
            Arc::new(Node {
                next: Mutex::new(None),
            }),
        ]);
        let marker = mark_reachable(&[&roots]);
        assert_eq!(marker.marked_count(), 2);
        assert_eq!(marker.roots_visited(), 2);
    }

    #[test]
    fn test_safepoint_without_pause_is_noop() {
        let barrier = SafepointBarrier::new();
        barrier.safepoint();
        assert_eq!(barrier.parked_count(), 0);
    }

    #[test]
    fn test_safepoint_rendezvous() {
        let barrier = Arc::new(SafepointBarrier::new());
        barrier.request_pause();

        let mut mutators = Vec::new();
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            mutators.push(thread::spawn(move || {
                barrier.safepoint();
            }));
        }

        assert!(barrier.wait_parked(3, Duration::from_secs(5)));
        assert_eq!(barrier.parked_count(), 3);

        barrier.resume();
        for mutator in mutators {
            mutator.join().unwrap();
        }
        assert_eq!(barrier.parked_count(), 0);
    }
}
