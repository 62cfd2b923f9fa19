//! Component F: bridging a plain OS thread's result into a [`Future`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::thread;

use log::error;

use crate::error::RuntimeError;
use crate::future::Future;
use crate::scheduler::Scheduler;

/// Runs `producer` on a detached worker thread and returns a future that
/// resolves with its result, or is rejected with its panic payload.
///
/// The worker thread is plain `std::thread::spawn` machinery: the
/// returned [`thread::JoinHandle`] is dropped immediately, which detaches
/// it rather than joining it (the future, not the handle, is how the
/// caller observes completion). The only failure path is the thread
/// spawn itself; once a thread is running, it cannot fail to eventually
/// resolve or reject the future it was handed.
pub fn dispatch<F, T>(producer: F) -> Result<Future<T>, RuntimeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let scheduler = Scheduler::current();
    let future = Future::pending(scheduler.wakeup_write_fd());
    let future_for_thread = future.clone();
    let inflight = scheduler.inflight_counter();

    inflight.fetch_add(1, Ordering::SeqCst);

    let spawned = thread::Builder::new().name("async-coro-worker".into()).spawn(move || {
        match panic::catch_unwind(AssertUnwindSafe(producer)) {
            Ok(value) => future_for_thread.resolve(value),
            Err(payload) => future_for_thread.reject(payload),
        }
        inflight.fetch_sub(1, Ordering::SeqCst);
    });

    match spawned {
        Ok(handle) => {
            // Dropping the handle detaches the thread; we only ever learn
            // its outcome through `future`.
            drop(handle);
            Ok(future)
        }
        Err(err) => {
            error!("failed to spawn worker thread: {}", err);
            scheduler.inflight_counter().fetch_sub(1, Ordering::SeqCst);
            Err(RuntimeError::ThreadSpawn(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::future::FutureOutcome;
    use crate::scheduler::{self, Scheduler as Sched};

    #[test]
    fn dispatched_thread_resolves_future_and_wakes_scheduler() {
        let result = Sched::run(SchedulerConfig::default(), || {
            let future = dispatch(|| {
                thread::sleep(std::time::Duration::from_millis(10));
                1 + 1
            })
            .unwrap();
            match scheduler::await_future(&future) {
                FutureOutcome::Resolved(v) => v,
                FutureOutcome::Rejected(_) => panic!("unexpected rejection"),
            }
        });
        assert_eq!(result, 2);
    }

    #[test]
    fn dispatched_thread_panic_rejects_future() {
        let result = Sched::run(SchedulerConfig::default(), || {
            let future: Future<i32> = dispatch(|| panic!("worker exploded")).unwrap();
            match scheduler::await_future(&future) {
                FutureOutcome::Resolved(_) => panic!("expected a rejection"),
                FutureOutcome::Rejected(err) => err.message(),
            }
        });
        assert_eq!(result, "worker exploded");
    }
}
