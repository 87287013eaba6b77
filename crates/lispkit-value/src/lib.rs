//! First-class Scheme datum representation for the LispKit runtime.
//!
//! The concurrency core treats most Scheme values as opaque: thread names,
//! tags, join results, and future payloads are carried around but never
//! interpreted. This crate provides the concrete [`Value`] those opaque
//! slots hold, together with the two extension points the runtime needs:
//!
//! - [`NativeObject`] - managed runtime objects (threads, mutexes,
//!   condition variables, futures) surfaced to Scheme as values, with
//!   `Any`-based downcasting back to their concrete type
//! - [`NativeProcedure`] - callable values, used for the thunks handed to
//!   `make-thread` and `make-future`
//!
//! Equality follows R7RS `equal?` for compound data and identity for
//! managed objects. Every value implements the collector's [`Trace`] trait;
//! weak diagnostic references never appear inside a `Value`, so tracing a
//! value marks exactly the objects it logically holds.

#![warn(missing_docs)]

pub mod error;

pub use error::{Condition, ThreadError};

use lispkit_rts_gc::{object_id, Marker, ObjectId, Trace};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Symbols
// ============================================================================

/// An interned-style symbol name.
///
/// Interning proper is the reader's business and out of scope here; symbols
/// compare by name, which is all `eq?`-style comparisons in the concurrency
/// core require.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Symbol(Arc<str>);

impl Symbol {
    /// Create a symbol from a name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The symbol's name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Native Objects
// ============================================================================

/// A managed runtime object surfaced to Scheme as a value.
///
/// Threads, mutexes, condition variables, futures, and error conditions all
/// implement this. Identity is the shared allocation behind the object, so
/// re-wrapping the same runtime object yields an `eq?`-equal value.
pub trait NativeObject: Any + Send + Sync + fmt::Debug {
    /// Scheme-facing type name, used in error messages.
    fn type_name(&self) -> &'static str;

    /// Stable identity of the underlying runtime object.
    fn identity(&self) -> ObjectId;

    /// Visit the values this object logically holds.
    fn trace(&self, marker: &mut Marker);

    /// Upcast for `Any`-based downcasting.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A callable value.
///
/// Covers both evaluator closures (out of scope here) and native
/// procedures; the concurrency core only ever applies these to zero
/// arguments, as thunks.
pub trait NativeProcedure: Send + Sync {
    /// Procedure name for diagnostics, if any.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Apply the procedure.
    fn call(&self, args: &[Value]) -> Result<Value, Condition>;
}

struct ClosureProc<F>(F);

impl<F> NativeProcedure for ClosureProc<F>
where
    F: Fn(&[Value]) -> Result<Value, Condition> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> Result<Value, Condition> {
        (self.0)(args)
    }
}

// ============================================================================
// Values
// ============================================================================

/// A first-class Scheme datum.
#[derive(Clone)]
pub enum Value {
    /// The empty list.
    Null,
    /// The unspecified value returned by side-effecting procedures.
    Undef,
    /// Booleans; only `#f` is false.
    Bool(bool),
    /// Exact integers.
    Fixnum(i64),
    /// Inexact reals.
    Flonum(f64),
    /// Symbols.
    Sym(Symbol),
    /// Immutable strings.
    Str(Arc<str>),
    /// Pairs.
    Pair(Arc<(Value, Value)>),
    /// Vectors.
    Vector(Arc<Vec<Value>>),
    /// Managed runtime objects (threads, mutexes, futures, conditions).
    Object(Arc<dyn NativeObject>),
    /// Callable values.
    Procedure(Arc<dyn NativeProcedure>),
}

impl Value {
    /// Create a symbol value.
    #[must_use]
    pub fn symbol(name: &str) -> Self {
        Self::Sym(Symbol::new(name))
    }

    /// Create a string value.
    #[must_use]
    pub fn string(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// Create a pair.
    #[must_use]
    pub fn cons(car: Value, cdr: Value) -> Self {
        Self::Pair(Arc::new((car, cdr)))
    }

    /// Create a proper list from the given elements.
    #[must_use]
    pub fn list<I>(elements: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut tail = Self::Null;
        for element in elements.into_iter().rev() {
            tail = Self::cons(element, tail);
        }
        tail
    }

    /// Wrap a managed runtime object.
    #[must_use]
    pub fn object<T: NativeObject>(object: Arc<T>) -> Self {
        Self::Object(object)
    }

    /// Wrap a native procedure closure.
    #[must_use]
    pub fn closure<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, Condition> + Send + Sync + 'static,
    {
        Self::Procedure(Arc::new(ClosureProc(f)))
    }

    /// Wrap a zero-argument procedure.
    #[must_use]
    pub fn thunk<F>(f: F) -> Self
    where
        F: Fn() -> Result<Value, Condition> + Send + Sync + 'static,
    {
        Self::closure(move |_| f())
    }

    /// Scheme truth: everything except `#f` is true.
    #[must_use]
    pub fn is_true(&self) -> bool {
        !matches!(self, Self::Bool(false))
    }

    /// Scheme falsity: only `#f` is false.
    #[must_use]
    pub fn is_false(&self) -> bool {
        matches!(self, Self::Bool(false))
    }

    /// Downcast a wrapped runtime object to its concrete type.
    #[must_use]
    pub fn as_object<T: NativeObject>(&self) -> Option<Arc<T>> {
        match self {
            Self::Object(object) => Arc::clone(object).as_any_arc().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// The callable behind this value, if it is one.
    #[must_use]
    pub fn as_procedure(&self) -> Option<Arc<dyn NativeProcedure>> {
        match self {
            Self::Procedure(procedure) => Some(Arc::clone(procedure)),
            _ => None,
        }
    }

    /// Numeric coercion to a real, for timeouts and durations.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Fixnum(n) => Some(*n as f64),
            Self::Flonum(x) => Some(*x),
            _ => None,
        }
    }

    /// Scheme-facing type name, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Undef => "unspecified",
            Self::Bool(_) => "boolean",
            Self::Fixnum(_) => "fixnum",
            Self::Flonum(_) => "flonum",
            Self::Sym(_) => "symbol",
            Self::Str(_) => "string",
            Self::Pair(_) => "pair",
            Self::Vector(_) => "vector",
            Self::Object(object) => object.type_name(),
            Self::Procedure(_) => "procedure",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Fixnum(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Flonum(x)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::Undef, Self::Undef) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Fixnum(a), Self::Fixnum(b)) => a == b,
            (Self::Flonum(a), Self::Flonum(b)) => a == b,
            (Self::Sym(a), Self::Sym(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Pair(a), Self::Pair(b)) => a.0 == b.0 && a.1 == b.1,
            (Self::Vector(a), Self::Vector(b)) => a.as_slice() == b.as_slice(),
            (Self::Object(a), Self::Object(b)) => a.identity() == b.identity(),
            (Self::Procedure(a), Self::Procedure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => write!(f, "#<{} {:#x}>", object.type_name(), object.identity()),
            Self::Procedure(procedure) => {
                write!(f, "#<procedure {}>", procedure.name().unwrap_or("anonymous"))
            }
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("()"),
            Self::Undef => f.write_str("#<unspecified>"),
            Self::Bool(true) => f.write_str("#t"),
            Self::Bool(false) => f.write_str("#f"),
            Self::Fixnum(n) => write!(f, "{n}"),
            Self::Flonum(x) => write!(f, "{x}"),
            Self::Sym(sym) => write!(f, "{sym}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Pair(pair) => {
                write!(f, "({}", pair.0)?;
                let mut rest = &pair.1;
                loop {
                    match rest {
                        Self::Null => break,
                        Self::Pair(next) => {
                            write!(f, " {}", next.0)?;
                            rest = &next.1;
                        }
                        datum => {
                            write!(f, " . {datum}")?;
                            break;
                        }
                    }
                }
                f.write_str(")")
            }
            Self::Vector(elements) => {
                f.write_str("#(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
            Self::Object(object) => write!(f, "#<{}>", object.type_name()),
            Self::Procedure(procedure) => {
                write!(f, "#<procedure {}>", procedure.name().unwrap_or("anonymous"))
            }
        }
    }
}

impl Trace for Value {
    fn trace(&self, marker: &mut Marker) {
        match self {
            Self::Null
            | Self::Undef
            | Self::Bool(_)
            | Self::Fixnum(_)
            | Self::Flonum(_)
            | Self::Sym(_) => {}
            Self::Str(s) => {
                marker.mark_object(object_id(s));
            }
            Self::Pair(pair) => {
                if marker.mark_object(object_id(pair)) {
                    pair.0.trace(marker);
                    pair.1.trace(marker);
                }
            }
            Self::Vector(elements) => {
                if marker.mark_object(object_id(elements)) {
                    for element in elements.iter() {
                        element.trace(marker);
                    }
                }
            }
            Self::Object(object) => {
                if marker.mark_object(object.identity()) {
                    object.trace(marker);
                }
            }
            Self::Procedure(procedure) => {
                // Closure captures are reported through thread pin lists;
                // only the procedure object itself is marked here.
                marker.mark_object(object_id(procedure));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
