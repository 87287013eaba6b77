//! Conditions and the concurrency-core error taxonomy.
//!
//! A thunk running on an evaluator thread can fail in two ways: the Scheme
//! program raises a datum, or the core itself signals one of the errors
//! below. Both are carried as a [`Condition`], which is what result slots,
//! futures, and exception handlers traffic in.

use crate::{NativeObject, Value};
use lispkit_rts_gc::{Marker, ObjectId, Trace};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors signalled by the concurrency core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThreadError {
    /// `thread-join!` timed out with no default.
    #[error("thread join timed out")]
    JoinTimeout,

    /// `future-get` timed out with no default.
    #[error("future timed out")]
    FutureTimeout,

    /// A mutex was acquired whose previous owner terminated while holding it.
    #[error("mutex was abandoned by a terminated thread")]
    AbandonedMutex,

    /// Observed by a thread at a suspension point after abort, and raised
    /// when joining a thread that was terminated.
    #[error("thread terminated")]
    TerminatedThread,

    /// A thunk raised a condition that was not handled; stored in the
    /// thread's result slot and re-raised at join.
    #[error("uncaught exception in thread: {0}")]
    UncaughtException(Box<Condition>),

    /// A future's result cell would have been written twice.
    #[error("future value was already set")]
    SettingFutureValueTwice,

    /// A thread or mutex operation was invoked where no current evaluator
    /// thread exists; names the offending operation.
    #[error("{0} called outside of an evaluator thread")]
    UseInInvalidContext(&'static str),

    /// `thread-join!` was called outside an evaluator thread.
    #[error("thread-join! called outside of an evaluator thread")]
    JoinInInvalidContext,

    /// `uncaught-exception-reason` was applied to a non-matching condition.
    #[error("expected an uncaught-exception condition")]
    ExpectedUncaughtException,

    /// `thread-start!` on a thread that is already runnable or running.
    #[error("thread has already been started")]
    ThreadAlreadyStarted,

    /// `thread-start!` on a thread that already terminated.
    #[error("thread has already terminated")]
    ThreadAlreadyTerminated,

    /// A primitive received an argument of the wrong type.
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        /// The expected Scheme type.
        expected: &'static str,
        /// The type actually supplied.
        found: String,
    },

    /// A primitive received the wrong number of arguments.
    #[error("{procedure}: expected at least {min} arguments, got {found}")]
    ArityMismatch {
        /// The procedure's Scheme name.
        procedure: String,
        /// Minimum accepted argument count.
        min: usize,
        /// Maximum accepted argument count, if bounded.
        max: Option<usize>,
        /// The argument count actually supplied.
        found: usize,
    },
}

/// What a thunk can raise: a Scheme datum passed to `raise`, or an error
/// originating in the core itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// A raised Scheme datum.
    Value(Value),
    /// A core error.
    Error(ThreadError),
}

impl Condition {
    /// Condition for a raised Scheme datum.
    #[must_use]
    pub fn raise(datum: Value) -> Self {
        Self::Value(datum)
    }

    /// Capture an escaped Rust panic as a raised condition.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "native procedure panicked".to_string()
        };
        Self::Value(Value::string(&message))
    }

    /// The core error behind this condition, if there is one.
    #[must_use]
    pub fn as_error(&self) -> Option<&ThreadError> {
        match self {
            Self::Error(error) => Some(error),
            Self::Value(_) => None,
        }
    }

    /// True for *join-timeout* conditions.
    #[must_use]
    pub fn is_join_timeout(&self) -> bool {
        matches!(self.as_error(), Some(ThreadError::JoinTimeout))
    }

    /// True for *abandoned-mutex* conditions.
    #[must_use]
    pub fn is_abandoned_mutex(&self) -> bool {
        matches!(self.as_error(), Some(ThreadError::AbandonedMutex))
    }

    /// True for *terminated-thread* conditions.
    #[must_use]
    pub fn is_terminated_thread(&self) -> bool {
        matches!(self.as_error(), Some(ThreadError::TerminatedThread))
    }

    /// True for *uncaught-exception* conditions.
    #[must_use]
    pub fn is_uncaught_exception(&self) -> bool {
        matches!(self.as_error(), Some(ThreadError::UncaughtException(_)))
    }

    /// The condition wrapped by an *uncaught-exception* condition.
    ///
    /// Fails with *expected-uncaught-exception* when applied to anything
    /// else.
    pub fn uncaught_exception_reason(&self) -> Result<Condition, Condition> {
        match self.as_error() {
            Some(ThreadError::UncaughtException(reason)) => Ok((**reason).clone()),
            _ => Err(ThreadError::ExpectedUncaughtException.into()),
        }
    }

    /// Surface this condition as a Scheme value.
    ///
    /// Raised data pass through unchanged; core errors are wrapped as
    /// condition objects so predicates can recover them.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(datum) => datum,
            Self::Error(error) => Value::object(Arc::new(ErrorCondition(error))),
        }
    }

    /// Recover a condition from a Scheme value produced by [`into_value`].
    ///
    /// [`into_value`]: Condition::into_value
    #[must_use]
    pub fn from_value(datum: Value) -> Self {
        match datum.as_object::<ErrorCondition>() {
            Some(condition) => Self::Error(condition.0.clone()),
            None => Self::Value(datum),
        }
    }
}

impl From<ThreadError> for Condition {
    fn from(error: ThreadError) -> Self {
        Self::Error(error)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(datum) => write!(f, "{datum}"),
            Self::Error(error) => write!(f, "{error}"),
        }
    }
}

impl Trace for Condition {
    fn trace(&self, marker: &mut Marker) {
        match self {
            Self::Value(datum) => datum.trace(marker),
            Self::Error(ThreadError::UncaughtException(reason)) => reason.trace(marker),
            Self::Error(_) => {}
        }
    }
}

/// A core error reified as a Scheme condition object.
#[derive(Debug)]
pub struct ErrorCondition(pub ThreadError);

impl NativeObject for ErrorCondition {
    fn type_name(&self) -> &'static str {
        "error"
    }

    fn identity(&self) -> ObjectId {
        self as *const Self as ObjectId
    }

    fn trace(&self, marker: &mut Marker) {
        // Wrapped uncaught-exception reasons may hold Scheme data.
        if let ThreadError::UncaughtException(reason) = &self.0 {
            reason.trace(marker);
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_round_trip_through_value() {
        let condition = Condition::from(ThreadError::AbandonedMutex);
        let datum = condition.clone().into_value();
        assert_eq!(Condition::from_value(datum), condition);
    }

    #[test]
    fn test_raised_datum_passes_through() {
        let condition = Condition::raise(Value::symbol("boom"));
        let datum = condition.clone().into_value();
        assert_eq!(datum, Value::symbol("boom"));
        assert_eq!(Condition::from_value(datum), condition);
    }

    #[test]
    fn test_uncaught_exception_reason() {
        let reason = Condition::raise(Value::symbol("boom"));
        let wrapped = Condition::from(ThreadError::UncaughtException(Box::new(reason.clone())));
        assert!(wrapped.is_uncaught_exception());
        assert_eq!(wrapped.uncaught_exception_reason().unwrap(), reason);

        let other = Condition::from(ThreadError::JoinTimeout);
        assert_eq!(
            other.uncaught_exception_reason().unwrap_err(),
            ThreadError::ExpectedUncaughtException.into()
        );
    }

    #[test]
    fn test_panic_payload_becomes_string_condition() {
        let payload: Box<dyn Any + Send> = Box::new("index out of bounds");
        let condition = Condition::from_panic(payload);
        assert_eq!(condition, Condition::raise(Value::string("index out of bounds")));
    }

    #[test]
    fn test_predicates_are_disjoint() {
        let timeout = Condition::from(ThreadError::JoinTimeout);
        assert!(timeout.is_join_timeout());
        assert!(!timeout.is_abandoned_mutex());
        assert!(!timeout.is_terminated_thread());
        assert!(!timeout.is_uncaught_exception());
        assert!(!Condition::raise(Value::Fixnum(1)).is_join_timeout());
    }
}
