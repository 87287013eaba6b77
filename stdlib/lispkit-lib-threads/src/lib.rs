//! Scheme-visible procedures of the thread libraries.
//!
//! This crate declares the native procedures of `(lispkit thread)` and
//! `(lispkit thread future)` on top of the runtime's concurrency core.
//! Each procedure is a [`Primitive`]: a Scheme name, arity bounds, and a
//! native implementation. The evaluator's library loader turns these
//! declarations into bindings; the tests here drive them the same way,
//! through [`Primitive::invoke`].
//!
//! Argument coercion raises conditions, never panics: a wrong argument
//! type is a *type mismatch* condition and a wrong argument count an
//! *arity mismatch* condition, so Scheme-level handlers can observe both.

#![warn(missing_docs)]

pub mod futures;
pub mod threads;

pub use futures::FUTURE_SYNTAX;

use lispkit_rts_threads::{
    ConditionVariable, Context, EvalThread, Future, Mutex, ThreadRegistry,
};
use lispkit_value::{Condition, NativeProcedure, ThreadError, Value};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Primitive Declarations
// ============================================================================

/// Implementation type of a native procedure.
pub type NativeProc = fn(&Arc<Context>, &[Value]) -> Result<Value, Condition>;

/// A native procedure declaration: Scheme name, arity bounds, and
/// implementation.
pub struct Primitive {
    /// The procedure's Scheme name.
    pub name: &'static str,
    /// Minimum accepted argument count.
    pub min_args: usize,
    /// Maximum accepted argument count; `None` is variadic.
    pub max_args: Option<usize>,
    proc: NativeProc,
}

impl Primitive {
    /// Declare a primitive.
    #[must_use]
    pub const fn new(
        name: &'static str,
        min_args: usize,
        max_args: Option<usize>,
        proc: NativeProc,
    ) -> Self {
        Self {
            name,
            min_args,
            max_args,
            proc,
        }
    }

    /// Apply the primitive after checking the argument count.
    pub fn invoke(&self, context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
        if args.len() < self.min_args || self.max_args.is_some_and(|max| args.len() > max) {
            return Err(ThreadError::ArityMismatch {
                procedure: self.name.to_string(),
                min: self.min_args,
                max: self.max_args,
                found: args.len(),
            }
            .into());
        }
        (self.proc)(context, args)
    }
}

/// All declarations of both thread libraries.
#[must_use]
pub fn declarations() -> Vec<Primitive> {
    let mut primitives = threads::declarations();
    primitives.extend(futures::declarations());
    primitives
}

// ============================================================================
// Argument Coercion
// ============================================================================

pub(crate) fn type_mismatch(expected: &'static str, found: &Value) -> Condition {
    ThreadError::TypeMismatch {
        expected,
        found: found.type_name().to_string(),
    }
    .into()
}

pub(crate) fn expect_thread(value: &Value) -> Result<Arc<EvalThread>, Condition> {
    value
        .as_object::<EvalThread>()
        .ok_or_else(|| type_mismatch("thread", value))
}

pub(crate) fn expect_mutex(value: &Value) -> Result<Arc<Mutex>, Condition> {
    value
        .as_object::<Mutex>()
        .ok_or_else(|| type_mismatch("mutex", value))
}

pub(crate) fn expect_condvar(value: &Value) -> Result<Arc<ConditionVariable>, Condition> {
    value
        .as_object::<ConditionVariable>()
        .ok_or_else(|| type_mismatch("condition variable", value))
}

pub(crate) fn expect_future(value: &Value) -> Result<Arc<Future>, Condition> {
    value
        .as_object::<Future>()
        .ok_or_else(|| type_mismatch("future", value))
}

pub(crate) fn expect_procedure(
    value: &Value,
) -> Result<Arc<dyn NativeProcedure>, Condition> {
    value
        .as_procedure()
        .ok_or_else(|| type_mismatch("procedure", value))
}

/// Coerce a timeout argument: `#f` waits forever, a non-negative real is
/// seconds, zero polls.
pub(crate) fn expect_timeout(value: &Value) -> Result<Option<Duration>, Condition> {
    if value.is_false() {
        return Ok(None);
    }
    value
        .as_f64()
        .filter(|seconds| *seconds >= 0.0)
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
        .map(Some)
        .ok_or_else(|| type_mismatch("non-negative real or #f", value))
}

/// The current thread, or *mutex-use-in-invalid-context* naming the
/// primitive.
pub(crate) fn current_thread(operation: &'static str) -> Result<EvalThread, Condition> {
    ThreadRegistry::current_or(operation)
}
