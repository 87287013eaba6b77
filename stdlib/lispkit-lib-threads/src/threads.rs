//! The `(lispkit thread)` library.
//!
//! Thread, mutex, and condition-variable procedures plus the exception
//! predicates, in SRFI-18 style.

use crate::{
    current_thread, expect_condvar, expect_mutex, expect_procedure, expect_thread,
    expect_timeout, type_mismatch, Primitive,
};
use lispkit_rts_threads::{
    ConditionVariable, Context, EvalThread, Mutex, MutexState, ThreadState, Thunk,
};
use lispkit_value::{Condition, Value};
use std::sync::Arc;

/// Declarations of the `(lispkit thread)` library.
#[must_use]
pub fn declarations() -> Vec<Primitive> {
    vec![
        // Threads
        Primitive::new("current-thread", 0, Some(0), current_thread_proc),
        Primitive::new("thread?", 1, Some(1), is_thread),
        Primitive::new("make-thread", 1, Some(3), make_thread),
        Primitive::new("thread-name", 1, Some(1), thread_name),
        Primitive::new("thread-tag", 1, Some(1), thread_tag),
        Primitive::new("thread-start!", 1, Some(1), thread_start),
        Primitive::new("thread-yield!", 0, Some(1), thread_yield),
        Primitive::new("thread-sleep!", 1, Some(1), thread_sleep),
        Primitive::new("thread-terminate!", 1, Some(1), thread_terminate),
        Primitive::new("thread-join!", 1, Some(3), thread_join),
        Primitive::new("thread-running?", 1, Some(1), thread_running),
        Primitive::new("thread-terminated?", 1, Some(1), thread_terminated),
        Primitive::new("processor-count", 0, Some(0), processor_count),
        Primitive::new("thread-max-stack-size", 0, Some(0), thread_max_stack_size),
        // Mutexes
        Primitive::new("mutex?", 1, Some(1), is_mutex),
        Primitive::new("make-mutex", 0, Some(2), make_mutex),
        Primitive::new("mutex-name", 1, Some(1), mutex_name),
        Primitive::new("mutex-tag", 1, Some(1), mutex_tag),
        Primitive::new("mutex-state", 1, Some(1), mutex_state),
        Primitive::new("mutex-lock!", 1, Some(3), mutex_lock),
        Primitive::new("mutex-unlock!", 1, Some(3), mutex_unlock),
        // Condition variables
        Primitive::new("condition-variable?", 1, Some(1), is_condvar),
        Primitive::new("make-condition-variable", 0, Some(2), make_condvar),
        Primitive::new("condition-variable-name", 1, Some(1), condvar_name),
        Primitive::new("condition-variable-tag", 1, Some(1), condvar_tag),
        Primitive::new("condition-variable-signal!", 1, Some(1), condvar_signal),
        Primitive::new(
            "condition-variable-broadcast!",
            1,
            Some(1),
            condvar_broadcast,
        ),
        // Exception predicates
        Primitive::new("join-timeout-exception?", 1, Some(1), is_join_timeout),
        Primitive::new(
            "abandoned-mutex-exception?",
            1,
            Some(1),
            is_abandoned_mutex,
        ),
        Primitive::new(
            "terminated-thread-exception?",
            1,
            Some(1),
            is_terminated_thread,
        ),
        Primitive::new("uncaught-exception?", 1, Some(1), is_uncaught_exception),
        Primitive::new(
            "uncaught-exception-reason",
            1,
            Some(1),
            uncaught_exception_reason,
        ),
    ]
}

// ============================================================================
// Threads
// ============================================================================

fn current_thread_proc(_context: &Arc<Context>, _args: &[Value]) -> Result<Value, Condition> {
    let current = current_thread("current-thread")?;
    Ok(Value::object(Arc::new(current)))
}

fn is_thread(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(args[0].as_object::<EvalThread>().is_some()))
}

fn make_thread(context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let procedure = expect_procedure(&args[0])?;
    let name = args.get(1).cloned();
    let tag = args.get(2).cloned();
    let thunk: Thunk = Box::new(move || procedure.call(&[]));
    let thread = context.make_thread(thunk, name, tag);
    Ok(Value::object(Arc::new(thread)))
}

fn thread_name(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    Ok(thread.name().cloned().unwrap_or(Value::Bool(false)))
}

fn thread_tag(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    Ok(thread.tag().cloned().unwrap_or(Value::Bool(false)))
}

fn thread_start(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    thread.start()?;
    Ok(args[0].clone())
}

/// The thread argument is accepted and ignored, matching the original
/// library's signature.
fn thread_yield(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    if let Some(value) = args.first() {
        expect_thread(value)?;
    }
    EvalThread::yield_now();
    Ok(Value::Undef)
}

fn thread_sleep(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let duration = expect_timeout(&args[0])?
        .ok_or_else(|| type_mismatch("non-negative real", &args[0]))?;
    EvalThread::sleep(duration)?;
    Ok(Value::Undef)
}

fn thread_terminate(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    thread.terminate()?;
    Ok(Value::Undef)
}

fn thread_join(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    let timeout = match args.get(1) {
        Some(value) => expect_timeout(value)?,
        None => None,
    };
    let default = args.get(2).cloned();
    thread.join(timeout, default)
}

fn thread_running(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    Ok(Value::Bool(matches!(
        thread.state(),
        ThreadState::Runnable | ThreadState::Running
    )))
}

fn thread_terminated(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let thread = expect_thread(&args[0])?;
    Ok(Value::Bool(thread.is_terminated()))
}

fn processor_count(_context: &Arc<Context>, _args: &[Value]) -> Result<Value, Condition> {
    let count = std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1);
    Ok(Value::Fixnum(count as i64))
}

fn thread_max_stack_size(context: &Arc<Context>, _args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Fixnum(context.config().stack_size as i64))
}

// ============================================================================
// Mutexes
// ============================================================================

fn is_mutex(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(args[0].as_object::<Mutex>().is_some()))
}

fn make_mutex(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let mutex = Mutex::new(args.first().cloned(), args.get(1).cloned());
    Ok(Value::object(Arc::new(mutex)))
}

fn mutex_name(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let mutex = expect_mutex(&args[0])?;
    Ok(mutex.name().cloned().unwrap_or(Value::Bool(false)))
}

fn mutex_tag(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let mutex = expect_mutex(&args[0])?;
    Ok(mutex.tag().cloned().unwrap_or(Value::Bool(false)))
}

fn mutex_state(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let mutex = expect_mutex(&args[0])?;
    Ok(match mutex.state() {
        MutexState::Unlocked { abandoned: false } => Value::symbol("not-abandoned"),
        MutexState::Unlocked { abandoned: true } => Value::symbol("abandoned"),
        MutexState::LockedNotOwned => Value::symbol("not-owned"),
        MutexState::LockedOwned(owner) => Value::object(Arc::new(owner)),
    })
}

fn mutex_lock(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let mutex = expect_mutex(&args[0])?;
    let timeout = match args.get(1) {
        Some(value) => expect_timeout(value)?,
        None => None,
    };
    // The third argument names the thread to acquire on behalf of; #f
    // acquires the mutex as locked-not-owned, absence means the current
    // thread.
    let for_thread = match args.get(2) {
        Some(value) if value.is_false() => None,
        Some(value) => Some((*expect_thread(value)?).clone()),
        None => Some(current_thread("mutex-lock!")?),
    };
    let acquired = mutex.lock(timeout, for_thread.as_ref())?;
    Ok(Value::Bool(acquired))
}

fn mutex_unlock(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let mutex = expect_mutex(&args[0])?;
    let condvar = match args.get(1) {
        Some(value) if value.is_false() => None,
        Some(value) => Some(expect_condvar(value)?),
        None => None,
    };
    let timeout = match args.get(2) {
        Some(value) => expect_timeout(value)?,
        None => None,
    };
    let signalled = mutex.unlock(condvar.as_deref(), timeout)?;
    Ok(Value::Bool(signalled))
}

// ============================================================================
// Condition Variables
// ============================================================================

fn is_condvar(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(
        args[0].as_object::<ConditionVariable>().is_some(),
    ))
}

fn make_condvar(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let condvar = ConditionVariable::new(args.first().cloned(), args.get(1).cloned());
    Ok(Value::object(Arc::new(condvar)))
}

fn condvar_name(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let condvar = expect_condvar(&args[0])?;
    Ok(condvar.name().cloned().unwrap_or(Value::Bool(false)))
}

fn condvar_tag(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    let condvar = expect_condvar(&args[0])?;
    Ok(condvar.tag().cloned().unwrap_or(Value::Bool(false)))
}

fn condvar_signal(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    expect_condvar(&args[0])?.signal();
    Ok(Value::Undef)
}

fn condvar_broadcast(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    expect_condvar(&args[0])?.broadcast();
    Ok(Value::Undef)
}

// ============================================================================
// Exception Predicates
// ============================================================================

fn is_join_timeout(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(
        Condition::from_value(args[0].clone()).is_join_timeout(),
    ))
}

fn is_abandoned_mutex(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(
        Condition::from_value(args[0].clone()).is_abandoned_mutex(),
    ))
}

fn is_terminated_thread(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(
        Condition::from_value(args[0].clone()).is_terminated_thread(),
    ))
}

fn is_uncaught_exception(_context: &Arc<Context>, args: &[Value]) -> Result<Value, Condition> {
    Ok(Value::Bool(
        Condition::from_value(args[0].clone()).is_uncaught_exception(),
    ))
}

fn uncaught_exception_reason(
    _context: &Arc<Context>,
    args: &[Value],
) -> Result<Value, Condition> {
    let reason = Condition::from_value(args[0].clone()).uncaught_exception_reason()?;
    Ok(reason.into_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lispkit_value::ThreadError;

    fn find(name: &str) -> Primitive {
        declarations()
            .into_iter()
            .find(|primitive| primitive.name == name)
            .unwrap_or_else(|| panic!("primitive {name} is declared"))
    }

    #[test]
    fn test_type_predicates() {
        let context = Context::new();
        let mutex = find("make-mutex").invoke(&context, &[]).unwrap();
        let condvar = find("make-condition-variable")
            .invoke(&context, &[])
            .unwrap();

        assert_eq!(
            find("mutex?").invoke(&context, &[mutex.clone()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            find("mutex?").invoke(&context, &[condvar.clone()]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            find("condition-variable?")
                .invoke(&context, &[condvar])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            find("thread?").invoke(&context, &[mutex]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_make_thread_requires_a_procedure() {
        let context = Context::new();
        let error = find("make-thread")
            .invoke(&context, &[Value::Fixnum(1)])
            .unwrap_err();
        assert!(matches!(
            error,
            Condition::Error(ThreadError::TypeMismatch { expected: "procedure", .. })
        ));
    }

    #[test]
    fn test_names_and_tags_default_to_false() {
        let context = Context::new();
        let thread = find("make-thread")
            .invoke(&context, &[Value::thunk(|| Ok(Value::Undef))])
            .unwrap();
        assert_eq!(
            find("thread-name").invoke(&context, &[thread.clone()]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            find("thread-tag").invoke(&context, &[thread]).unwrap(),
            Value::Bool(false)
        );

        let named = find("make-thread")
            .invoke(
                &context,
                &[
                    Value::thunk(|| Ok(Value::Undef)),
                    Value::symbol("worker"),
                    Value::Fixnum(9),
                ],
            )
            .unwrap();
        assert_eq!(
            find("thread-name").invoke(&context, &[named.clone()]).unwrap(),
            Value::symbol("worker")
        );
        assert_eq!(
            find("thread-tag").invoke(&context, &[named]).unwrap(),
            Value::Fixnum(9)
        );
    }

    #[test]
    fn test_mutex_state_symbols() {
        let context = Context::new();
        let mutex = find("make-mutex").invoke(&context, &[]).unwrap();
        assert_eq!(
            find("mutex-state").invoke(&context, &[mutex.clone()]).unwrap(),
            Value::symbol("not-abandoned")
        );

        let observed = context
            .run_main(Box::new({
                let context = Arc::clone(&context);
                let mutex = mutex.clone();
                move || {
                    // Ownerless acquisition reports not-owned.
                    find("mutex-lock!").invoke(
                        &context,
                        &[mutex.clone(), Value::Bool(false), Value::Bool(false)],
                    )?;
                    let not_owned = find("mutex-state").invoke(&context, &[mutex.clone()])?;
                    find("mutex-unlock!").invoke(&context, &[mutex.clone()])?;

                    // Owned acquisition reports the owning thread.
                    find("mutex-lock!").invoke(&context, &[mutex.clone()])?;
                    let owned = find("mutex-state").invoke(&context, &[mutex.clone()])?;
                    let current = find("current-thread").invoke(&context, &[])?;
                    find("mutex-unlock!").invoke(&context, &[mutex.clone()])?;
                    Ok(Value::list([
                        not_owned,
                        Value::Bool(owned == current),
                    ]))
                }
            }))
            .unwrap();
        assert_eq!(
            observed,
            Value::list([Value::symbol("not-owned"), Value::Bool(true)])
        );
    }

    #[test]
    fn test_sleep_rejects_forever_timeout() {
        let context = Context::new();
        context
            .run_main(Box::new({
                let context = Arc::clone(&context);
                move || {
                    let error = find("thread-sleep!")
                        .invoke(&context, &[Value::Bool(false)])
                        .unwrap_err();
                    assert!(matches!(
                        error,
                        Condition::Error(ThreadError::TypeMismatch { .. })
                    ));
                    Ok(Value::Undef)
                }
            }))
            .unwrap();
    }

    #[test]
    fn test_exception_predicates_dispatch_on_kind() {
        let context = Context::new();
        let join_timeout = Condition::from(ThreadError::JoinTimeout).into_value();
        let abandoned = Condition::from(ThreadError::AbandonedMutex).into_value();
        let plain = Value::symbol("boom");

        assert_eq!(
            find("join-timeout-exception?")
                .invoke(&context, &[join_timeout.clone()])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            find("join-timeout-exception?")
                .invoke(&context, &[abandoned.clone()])
                .unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            find("abandoned-mutex-exception?")
                .invoke(&context, &[abandoned])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            find("uncaught-exception?")
                .invoke(&context, &[plain.clone()])
                .unwrap(),
            Value::Bool(false)
        );

        let error = find("uncaught-exception-reason")
            .invoke(&context, &[plain])
            .unwrap_err();
        assert_eq!(error, ThreadError::ExpectedUncaughtException.into());
    }

    #[test]
    fn test_uncaught_exception_reason_recovers_datum() {
        let context = Context::new();
        let wrapped = Condition::from(ThreadError::UncaughtException(Box::new(
            Condition::raise(Value::symbol("boom")),
        )))
        .into_value();

        assert_eq!(
            find("uncaught-exception?")
                .invoke(&context, &[wrapped.clone()])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            find("uncaught-exception-reason")
                .invoke(&context, &[wrapped])
                .unwrap(),
            Value::symbol("boom")
        );
    }

    #[test]
    fn test_processor_count_is_positive() {
        let context = Context::new();
        let count = find("processor-count").invoke(&context, &[]).unwrap();
        assert!(matches!(count, Value::Fixnum(n) if n >= 1));
    }

    #[test]
    fn test_yield_accepts_and_ignores_a_thread() {
        let context = Context::new();
        assert_eq!(
            find("thread-yield!").invoke(&context, &[]).unwrap(),
            Value::Undef
        );
        let thread = find("make-thread")
            .invoke(&context, &[Value::thunk(|| Ok(Value::Undef))])
            .unwrap();
        assert_eq!(
            find("thread-yield!").invoke(&context, &[thread]).unwrap(),
            Value::Undef
        );
    }
}
