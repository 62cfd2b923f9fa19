//! End-to-end scenarios exercising the scheduler, coroutine, and future
//! components together, through the crate's public API only.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_coro::future::FutureOutcome;
use async_coro::{self as rt, Scheduler, SchedulerConfig};

#[test]
fn empty_run_returns_entry_coroutines_value() {
    let result = Scheduler::run(SchedulerConfig::default(), || 1337);
    assert_eq!(result, 1337);
}

#[test]
fn single_yield_resumes_in_order() {
    let trace = Rc::new(RefCell::new(Vec::new()));
    let trace_in = trace.clone();
    Scheduler::run(SchedulerConfig::default(), move || {
        trace_in.borrow_mut().push('A');
        rt::yield_now();
        trace_in.borrow_mut().push('B');
    });
    assert_eq!(*trace.borrow(), vec!['A', 'B']);
}

#[test]
fn two_eager_futures_all_combinator_preserves_order() {
    let result = Scheduler::run(SchedulerConfig::default(), || {
        let scheduler = Scheduler::current();
        let f1 = scheduler.spawn_future(|| 99);
        let f2 = scheduler.spawn_future(|| 42);

        let outcomes = rt::all(&[f1.clone(), f2.clone()]);
        assert!(f1.is_ready());
        assert!(f2.is_ready());

        outcomes
            .into_iter()
            .map(|o| match o {
                FutureOutcome::Resolved(v) => v,
                FutureOutcome::Rejected(_) => panic!("unexpected rejection"),
            })
            .collect::<Vec<_>>()
    });
    assert_eq!(result, vec![99, 42]);
}

#[test]
fn dispatched_worker_resolves_across_threads() {
    let result = Scheduler::run(SchedulerConfig::default(), || {
        let future = rt::dispatch(|| {
            std::thread::sleep(Duration::from_millis(20));
            "X"
        })
        .unwrap();
        match rt::await_future(&future) {
            FutureOutcome::Resolved(v) => v,
            FutureOutcome::Rejected(_) => panic!("unexpected rejection"),
        }
    });
    assert_eq!(result, "X");
}

#[test]
fn dispatched_worker_rejection_surfaces_as_rejected_outcome() {
    let result = Scheduler::run(SchedulerConfig::default(), || {
        let future: async_coro::Future<i32> = rt::dispatch(|| panic!("worker failed")).unwrap();
        match rt::await_future(&future) {
            FutureOutcome::Resolved(_) => panic!("expected a rejection"),
            FutureOutcome::Rejected(err) => err.message(),
        }
    });
    assert_eq!(result, "worker failed");
}

#[test]
fn lazy_future_never_awaited_is_freed_without_running() {
    let ran = Rc::new(RefCell::new(false));
    let ran_in = ran.clone();
    Scheduler::run(SchedulerConfig::default(), move || {
        let scheduler = Scheduler::current();
        let _unused: async_coro::Future<()> = scheduler.create_future(false, move || {
            *ran_in.borrow_mut() = true;
        });
    });
    assert!(!*ran.borrow());
}
