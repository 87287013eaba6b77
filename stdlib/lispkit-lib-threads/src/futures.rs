//! The `(lispkit thread future)` library.
//!
//! Futures package "spawn a thread, capture its outcome, let any number of
//! readers await it". The `future` macro itself expands in the Scheme
//! layer; its source ships with the library as [`FUTURE_SYNTAX`].

use crate::{expect_future, expect_procedure, expect_timeout, Primitive};
use lispkit_rts_threads::{Context, Future, Thunk};
use lispkit_value::{Condition, ThreadError, Value};
use std::sync::Arc;

/// Scheme source of the `future` macro, loaded with the library.
pub const FUTURE_SYNTAX: &str = r"
(define-syntax future
  (syntax-rules ()
    ((_ expr ...)
     (make-future (lambda () expr ...)))))
";

/// Declarations of the `(lispkit thread future)` library.
#[must_use]
pub fn declarations() -> Vec<Primitive> {
    vec![
        Primitive::new("future?", 1, Some(1), is_future),
        Primitive::new("make-future", 1, Some(1), make_future),
        Primitive::new("make-evaluated-future", 1, Some(1), make_evaluated_future),
        Primitive::new("make-failing-future", 1, Some(1), make_failing_future),
        Primitive::new("future-get", 1, Some(3), future_get),
        Primitive::new("future-done?", 1, Some(1), future_done),
        Primitive::new("touch", 1, Some(1), touch),
        // Internal primitives the future machinery is assembled from.
        Primitive::new("_make-future", 0, Some(0), raw_make_future),
        Primitive::new("_future-set!", 3, Some(3), raw_future_set),
    ]
}

fn is_future(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(args[0].as_object::<Future>().is_some()))
}

fn make_future(context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let procedure = expect_procedure(&args[0])?;
    let thunk: Thunk = Box::new(move || procedure.call(&[]));
    let (future, thread) = Future::spawn(context, thunk)?;
    tracing::debug!(producer = %thread.id(), "future spawned");
    Ok(Value::object(Arc::new(future)))
}

fn make_evaluated_future(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::object(Arc::new(Future::evaluated(args[0].clone()))))
}

fn make_failing_future(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::object(Arc::new(Future::failing(args[0].clone()))))
}

/// `future-get f [timeout [default]]`
///
/// Blocks forever without a timeout. On expiry, returns the default when
/// given and fails with *future-timeout* otherwise. An error outcome is
/// re-raised for every reader.
fn future_get(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let future = expect_future(&args[0])?;
    let timeout = match args.get(1) {
        Some(value) => expect_timeout(value)?,
        None => None,
    };
    let default = args.get(2).cloned();
    match future.get(timeout)? {
        Some((value, false)) => Ok(value),
        Some((error, true)) => Err(Condition::from_value(error)),
        None => match default {
            Some(value) => Ok(value),
            None => Err(ThreadError::FutureTimeout.into()),
        },
    }
}

fn future_done(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(expect_future(&args[0])?.is_done()))
}

/// `touch` is the blocking retrieval form.
fn touch(context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    future_get(context, &args[..1])
}

fn raw_make_future(_context: &Arc<Context>, _args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::object(Arc::new(Future::new())))
}

fn raw_future_set(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let future = expect_future(&args[0])?;
    if future.set(args[1].clone(), args[2].is_true())? {
        Ok(Value::Undef)
    } else {
        Err(ThreadError::SettingFutureValueTwice.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(name: &str) -> Primitive {
        declarations()
            .into_iter()
            .find(|primitive| primitive.name == name)
            .unwrap_or_else(|| panic!("primitive {name} is declared"))
    }

    #[test]
    fn test_evaluated_future_round_trip() {
        let context = Context::new();
        context
            .run_main(Box::new({
                let context = Arc::clone(&context);
                move || {
                    let future = find("make-evaluated-future")
                        .invoke(&context, &[Value::Fixnum(7)])?;
                    assert_eq!(
                        find("future-done?").invoke(&context, &[future.clone()])?,
                        Value::Bool(true)
                    );
                    assert_eq!(
                        find("future-get").invoke(&context, &[future.clone()])?,
                        Value::Fixnum(7)
                    );
                    assert_eq!(
                        find("touch").invoke(&context, &[future])?,
                        Value::Fixnum(7)
                    );
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }

    #[test]
    fn test_failing_future_re_raises() {
        let context = Context::new();
        context
            .run_main(Box::new({
                let context = Arc::clone(&context);
                move || {
                    let future = find("make-failing-future")
                        .invoke(&context, &[Value::symbol("boom")])?;
                    let error = find("future-get")
                        .invoke(&context, &[future])
                        .unwrap_err();
                    assert_eq!(error, Condition::raise(Value::symbol("boom")));
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }

    #[test]
    fn test_double_set_is_rejected() {
        let context = Context::new();
        context
            .run_main(Box::new({
                let context = Arc::clone(&context);
                move || {
                    let future = find("_make-future").invoke(&context, &[])?;
                    find("_future-set!").invoke(
                        &context,
                        &[future.clone(), Value::Fixnum(1), Value::Bool(false)],
                    )?;
                    let error = find("_future-set!")
                        .invoke(
                            &context,
                            &[future, Value::Fixnum(2), Value::Bool(false)],
                        )
                        .unwrap_err();
                    assert_eq!(error, ThreadError::SettingFutureValueTwice.into());
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }

    #[test]
    fn test_future_is_not_a_thread() {
        let context = Context::new();
        let future = find("_make-future").invoke(&context, &[]).unwrap();
        assert_eq!(
            find("future?").invoke(&context, &[future.clone()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            find("future?").invoke(&context, &[Value::Fixnum(1)]).unwrap(),
            Value::Bool(false)
        );
    }
}
