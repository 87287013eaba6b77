//! Root enumeration and reachability through the concurrency core.
//!
//! The collector must reach every value a suspended thread or unfulfilled
//! future still holds, while a mutex's owner back-pointer must never keep
//! a thread alive.

use lispkit_rts_gc::{mark_reachable, Marker, RootProvider, Trace};
use lispkit_rts_threads::{Condition, Context, EvalThread, Future, Mutex, ThreadRegistry, Thunk};
use lispkit_value::{NativeObject, Value};
use std::sync::Arc;
use std::time::Duration;

fn thunk<F>(f: F) -> Thunk
where
    F: FnOnce() -> Result<Value, Condition> + Send + 'static,
{
    Box::new(f)
}

#[test]
fn test_pinned_values_are_reachable_through_the_registry() {
    let context = Context::new();
    let pinned = Value::string("held by the evaluator stack");
    let pinned_id = match &pinned {
        Value::Str(s) => lispkit_rts_gc::object_id(s),
        _ => unreachable!(),
    };

    context
        .run_main(thunk({
            let context = Arc::clone(&context);
            let pinned = pinned.clone();
            move || {
                let sleeper = context.spawn(thunk(|| {
                    EvalThread::sleep(Duration::from_secs(30))?;
                    Ok(Value::Undef)
                }))?;
                sleeper.pin(pinned);

                let marker = mark_reachable(&[&**context.registry() as &dyn RootProvider]);
                assert!(marker.is_marked(pinned_id));

                sleeper.terminate()?;
                Ok(Value::Undef)
            }
        }))
        .unwrap();
}

#[test]
fn test_result_slot_is_reachable_until_unregistered() {
    let context = Context::new();
    let name = Value::string("worker-name");
    let name_id = match &name {
        Value::Str(s) => lispkit_rts_gc::object_id(s),
        _ => unreachable!(),
    };

    context
        .run_main(thunk({
            let context = Arc::clone(&context);
            let name = name.clone();
            move || {
                let worker = context.make_thread(
                    thunk(|| {
                        EvalThread::sleep(Duration::from_secs(30))?;
                        Ok(Value::Undef)
                    }),
                    Some(name),
                    None,
                );
                worker.start()?;

                // While registered, the thread's name is a root.
                let marker = mark_reachable(&[&**context.registry() as &dyn RootProvider]);
                assert!(marker.is_marked(name_id));

                worker.terminate()?;

                // Unregistration trails the terminal state by a moment;
                // wait for the membership set to shrink back to the main
                // thread.
                for _ in 0..200 {
                    if context.registry().live_count() == 1 {
                        break;
                    }
                    EvalThread::sleep(Duration::from_millis(5))?;
                }

                // After termination the registry no longer roots it.
                let marker = mark_reachable(&[&**context.registry() as &dyn RootProvider]);
                assert!(!marker.is_marked(name_id));
                Ok(Value::Undef)
            }
        }))
        .unwrap();
}

#[test]
fn test_mutex_owner_is_not_traced() {
    let context = Context::new();
    context
        .run_main(thunk({
            let context = Arc::clone(&context);
            move || {
                let mutex = Mutex::new(Some(Value::symbol("m")), None);
                let holder = context.spawn(thunk({
                    let mutex = mutex.clone();
                    move || {
                        let current = ThreadRegistry::current().expect("evaluator thread");
                        mutex.lock(None, Some(&current))?;
                        EvalThread::sleep(Duration::from_secs(30))?;
                        Ok(Value::Undef)
                    }
                }))?;

                // Give the holder time to take the lock.
                EvalThread::sleep(Duration::from_millis(50))?;

                // Tracing the mutex as a value reaches its name but not
                // its owner: the back-pointer is diagnostic and weak.
                let handle = Value::object(Arc::new(mutex.clone()));
                let mut marker = Marker::new();
                handle.trace(&mut marker);
                assert!(!marker.is_marked(NativeObject::identity(&holder)));

                holder.terminate()?;
                Ok(Value::Undef)
            }
        }))
        .unwrap();
}

#[test]
fn test_future_value_is_reachable_through_the_future() {
    let context = Context::new();
    context
        .run_main(thunk(|| {
            let payload = Value::string("future payload");
            let payload_id = match &payload {
                Value::Str(s) => lispkit_rts_gc::object_id(s),
                _ => unreachable!(),
            };
            let future = Future::evaluated(payload);

            let handle = Value::object(Arc::new(future));
            let mut marker = Marker::new();
            handle.trace(&mut marker);
            assert!(marker.is_marked(payload_id));
            Ok(Value::Undef)
        }))
        .unwrap();
}

#[test]
fn test_unfulfilled_future_traces_nothing_but_itself() {
    let future = Future::new();
    let handle = Value::object(Arc::new(future));
    let mut marker = Marker::new();
    handle.trace(&mut marker);
    assert_eq!(marker.marked_count(), 1);
}

#[test]
fn test_safepoint_pause_suspends_mutators() {
    let context = Context::new();
    context
        .run_main(thunk({
            let context = Arc::clone(&context);
            move || {
                let worker = context.spawn(thunk(|| {
                    loop {
                        EvalThread::sleep(Duration::from_millis(5))?;
                    }
                }))?;

                let barrier = Arc::clone(context.barrier());
                barrier.request_pause();
                // The looping sleeper reaches a suspension point and parks.
                assert!(barrier.wait_parked(1, Duration::from_secs(10)));

                // Roots can be walked while the mutator is parked.
                let marker = mark_reachable(&[&**context.registry() as &dyn RootProvider]);
                assert!(marker.marked_count() >= 1);

                barrier.resume();
                worker.terminate()?;
                Ok(Value::Undef)
            }
        }))
        .unwrap();
}
