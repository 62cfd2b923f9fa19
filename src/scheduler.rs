// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Component E: the single-threaded run loop. One `Scheduler` owns every
//! coroutine it creates and the one OS thread it runs on; nothing about it
//! is `Send` or `Sync`, which is exactly what lets the rest of the crate
//! use plain `Rc`/`RefCell` instead of atomics for everything coroutine-side.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::config::SchedulerConfig;
use crate::coroutine::{self, Awaitable, CoroutineHandle, CoroutineState};
use crate::error::RuntimeError;
use crate::future::{Future, FutureOutcome};
use crate::wakeup::{self, WakeupChannel};

struct WatchedFd {
    fd: RawFd,
    events: libc::c_short,
    coroutine: CoroutineHandle,
}

struct Inner {
    config: SchedulerConfig,
    wakeup: WakeupChannel,
    /// Every coroutine this scheduler has created and not yet destroyed.
    /// There is no separate ready/not-ready split: a coroutine's own
    /// `is_ready()` decides whether it can run, and this list's order is
    /// the scheduling order among ready coroutines (`next_ready` pops the
    /// first ready one out; `resume` re-appends it at the tail if it's
    /// still alive, giving a best-effort round-robin).
    coroutines: Vec<CoroutineHandle>,
    watched: Vec<WatchedFd>,
    /// Count of THREADED futures whose worker thread has not yet resolved
    /// or rejected them. Checked so the run loop keeps blocking in the
    /// multiplexer even when nothing is locally ready or watched: a
    /// worker thread out there will eventually signal the wakeup channel.
    inflight: Arc<AtomicUsize>,
}

/// The cooperative run loop. Cheaply `Clone`: every clone shares the same
/// underlying state, the way a coroutine handle does.
#[derive(Clone)]
pub struct Scheduler(Rc<RefCell<Inner>>);

thread_local! {
    static CURRENT: RefCell<Option<Scheduler>> = RefCell::new(None);
}

impl Scheduler {
    fn new(config: SchedulerConfig) -> Result<Self, RuntimeError> {
        let wakeup = WakeupChannel::create().map_err(RuntimeError::WakeupChannelInit)?;
        let watched = Vec::with_capacity(config.watched_fd_capacity);
        let inner = Inner {
            config,
            wakeup,
            coroutines: Vec::new(),
            watched,
            inflight: Arc::new(AtomicUsize::new(0)),
        };
        Ok(Scheduler(Rc::new(RefCell::new(inner))))
    }

    /// Returns the scheduler driving the current thread.
    ///
    /// # Panics
    /// Panics if called from a thread with no running scheduler, matching
    /// the spec's treatment of scheduler operations invoked outside a
    /// scheduling context as a programmer error.
    pub fn current() -> Scheduler {
        CURRENT
            .with(|c| c.borrow().clone())
            .expect("no scheduler is running on this thread")
    }

    fn set_current(scheduler: Option<Scheduler>) -> Option<Scheduler> {
        CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), scheduler))
    }

    pub(crate) fn wakeup_write_fd(&self) -> RawFd {
        self.0.borrow().wakeup.write
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.0.borrow().config.stack_size
    }

    pub(crate) fn inflight_counter(&self) -> Arc<AtomicUsize> {
        self.0.borrow().inflight.clone()
    }

    pub(crate) fn track(&self, handle: CoroutineHandle) {
        self.0.borrow_mut().coroutines.push(handle);
    }

    pub(crate) fn watch_fd(&self, fd: RawFd, events: libc::c_short, coroutine: CoroutineHandle) {
        coroutine.add_waiting(Awaitable::Fd(fd));
        self.0.borrow_mut().watched.push(WatchedFd { fd, events, coroutine });
    }

    /// Spawns a detached coroutine running `f`. The coroutine runs
    /// whenever the scheduler gets to it; nothing observes its return
    /// value directly (use [`spawn_future`] if the caller needs the
    /// result).
    pub fn spawn<F>(&self, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + 'static,
    {
        let handle = CoroutineHandle::create(self.stack_size(), None, true, f)?;
        self.track(handle);
        Ok(())
    }

    /// Runs `f` to completion in a coroutine, resolving the returned
    /// future with its result (or rejecting it, if `f` panics) rather
    /// than blocking anything. The backing coroutine is enqueued
    /// immediately (the EAGER option in the spec's terms).
    pub fn spawn_future<F, T>(&self, f: F) -> Future<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        self.create_future(true, f)
    }

    /// Like [`spawn_future`](Self::spawn_future), but when `eager` is
    /// `false` the backing coroutine is not enqueued until the future is
    /// first awaited ([`await_future`]) — the lazy path from the spec's
    /// Options table. A lazy future that is dropped without ever being
    /// awaited frees its never-run backing coroutine instead of running
    /// it.
    pub fn create_future<F, T>(&self, eager: bool, f: F) -> Future<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let wakeup_fd = self.wakeup_write_fd();
        let future = Future::pending(wakeup_fd);
        let future_in = future.clone();
        let body = move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => future_in.resolve(value),
            Err(payload) => future_in.reject(payload),
        };
        let handle = CoroutineHandle::create(self.stack_size(), None, true, body)
            .expect("failed to allocate a coroutine stack for a spawned future");

        if eager {
            self.track(handle);
        } else {
            future.set_backing(handle);
        }
        future
    }

    /// Drives the scheduler's run loop with `f` as the first coroutine.
    /// Returns once `f`, and everything it transitively spawned or
    /// dispatched, has either finished or can make no further progress.
    pub fn run<F, R>(config: SchedulerConfig, f: F) -> R
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        let scheduler = Scheduler::new(config).expect("failed to set up the scheduler's wakeup channel");
        let previous = Scheduler::set_current(Some(scheduler.clone()));
        assert!(previous.is_none(), "a scheduler is already running on this thread");

        let main = CoroutineHandle::create(scheduler.stack_size(), Some("main".into()), true, f)
            .expect("failed to allocate the main coroutine's stack");
        scheduler.track(main.clone());

        scheduler.main_loop();

        let result = main.take_return_value::<R>();

        scheduler.shutdown();
        Scheduler::set_current(None);

        result.expect("main coroutine did not finish normally (it panicked or was left suspended)")
    }

    fn main_loop(&self) {
        loop {
            if let Some(work) = self.next_ready() {
                self.resume(work);
                continue;
            }
            if !self.should_keep_waiting() {
                break;
            }
            self.poll_once();
        }
    }

    fn should_keep_waiting(&self) -> bool {
        let inner = self.0.borrow();
        !inner.watched.is_empty() || inner.inflight.load(Ordering::SeqCst) > 0
    }

    /// Picks the first ready coroutine and pops it out of the list, the
    /// way `_async_next_coroutine` pulls its pick out of the queue rather
    /// than just peeking it. `resume` re-appends it at the tail if it's
    /// still alive afterward, giving a best-effort round-robin instead of
    /// always re-picking whatever sits at the lowest index.
    fn next_ready(&self) -> Option<CoroutineHandle> {
        let mut inner = self.0.borrow_mut();
        let pos = inner.coroutines.iter().position(|c| c.is_ready())?;
        Some(inner.coroutines.remove(pos))
    }

    fn resume(&self, work: CoroutineHandle) {
        trace!("resuming coroutine {:?}", work.name());
        work.run();

        match work.state() {
            CoroutineState::Suspended => {
                debug!("coroutine {:?} suspended", work.name());
                self.0.borrow_mut().coroutines.push(work);
            }
            CoroutineState::Finished => {
                debug!("coroutine {:?} finished", work.name());
                self.retire(work);
            }
            CoroutineState::Failed => {
                warn!("coroutine {:?} failed", work.name());
                self.retire(work);
            }
            CoroutineState::New | CoroutineState::Running => {
                unreachable!("coroutine left in {:?} after run()", work.state())
            }
        }
    }

    /// `work` has already been popped out of the coroutine list by
    /// `next_ready` and is not coming back; release its stack.
    fn retire(&self, work: CoroutineHandle) {
        if work.is_owned() {
            work.destroy();
        }
    }

    fn poll_once(&self) {
        let (mut fds, timeout) = {
            let inner = self.0.borrow();
            let mut fds = Vec::with_capacity(inner.watched.len() + 1);
            fds.push(libc::pollfd { fd: inner.wakeup.read, events: libc::POLLIN, revents: 0 });
            for w in &inner.watched {
                fds.push(libc::pollfd { fd: w.fd, events: w.events, revents: 0 });
            }
            (fds, inner.config.poll_timeout_ms)
        };

        // SAFETY: `fds` is a valid, uniquely-owned array of `pollfd`
        // entries sized exactly to `fds.len()`.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                error!("poll failed: {}", err);
            }
            return;
        }
        if n == 0 {
            trace!("poll timed out with nothing ready");
            return;
        }

        if fds[0].revents != 0 {
            wakeup::drain(fds[0].fd);
        }

        let ready_fds: Vec<RawFd> = fds.iter().skip(1).filter(|pfd| pfd.revents != 0).map(|pfd| pfd.fd).collect();
        if ready_fds.is_empty() {
            return;
        }

        let mut inner = self.0.borrow_mut();
        let mut i = 0;
        while i < inner.watched.len() {
            if ready_fds.contains(&inner.watched[i].fd) {
                let entry = inner.watched.remove(i);
                entry.coroutine.remove_waiting(Awaitable::Fd(entry.fd));
            } else {
                i += 1;
            }
        }
    }

    fn shutdown(&self) {
        let mut inner = self.0.borrow_mut();
        for handle in inner.coroutines.drain(..) {
            if !matches!(handle.state(), CoroutineState::Finished | CoroutineState::Failed) {
                warn!("coroutine {:?} still alive at shutdown, destroying", handle.name());
            }
            handle.destroy();
        }
    }
}

/// Suspends the calling coroutine, letting the scheduler run anything
/// else ready. Resumes once the scheduler gets back to it, with no
/// awaited condition attached (it is immediately ready again).
pub fn yield_now() {
    coroutine::suspend();
}

/// Suspends the calling coroutine until `fd` becomes ready for `events`.
pub fn await_fd(fd: RawFd, events: libc::c_short) {
    let scheduler = Scheduler::current();
    let coro = coroutine::current().expect("await_fd called outside a running coroutine");
    scheduler.watch_fd(fd, events, coro);
    coroutine::suspend();
}

/// Suspends the calling coroutine until `future` is decided, then returns
/// its outcome without consuming it. If `future` has a backing coroutine
/// that has not been enqueued yet (the lazy path), this is what enqueues
/// it.
///
/// Registration and the pending check happen under the future's own lock
/// in one step ([`Future::try_add_waiting`]): a future decided by another
/// thread between "check" and "register" would otherwise strand the
/// calling coroutine on a waiter list nothing will ever clear.
pub fn await_future<T: Clone + 'static>(future: &Future<T>) -> FutureOutcome<T> {
    let scheduler = Scheduler::current();
    future.start(|handle| scheduler.track(handle));
    loop {
        let coro = coroutine::current().expect("await_future called outside a running coroutine");
        if !future.try_add_waiting(coro) {
            break;
        }
        coroutine::suspend();
    }
    future.peek().expect("future ready but carries no outcome")
}

/// Yields once, then calls `f`. Used to give the scheduler a chance to
/// run other ready coroutines before a synchronous call that would
/// otherwise monopolize the thread.
pub fn await_function<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    coroutine::suspend();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn runs_main_coroutine_to_completion() {
        let result = Scheduler::run(SchedulerConfig::default(), || 1 + 1);
        assert_eq!(result, 2);
    }

    #[test]
    fn yields_are_resumed_in_order() {
        let trace = StdRc::new(StdRefCell::new(Vec::new()));
        let trace_in = trace.clone();
        Scheduler::run(SchedulerConfig::default(), move || {
            trace_in.borrow_mut().push("a");
            yield_now();
            trace_in.borrow_mut().push("b");
        });
        assert_eq!(*trace.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn spawned_coroutine_runs_before_main_exits() {
        let trace = StdRc::new(StdRefCell::new(Vec::new()));
        let trace_in = trace.clone();
        Scheduler::run(SchedulerConfig::default(), move || {
            let scheduler = Scheduler::current();
            let trace_child = trace_in.clone();
            scheduler.spawn(move || trace_child.borrow_mut().push("child")).unwrap();
            trace_in.borrow_mut().push("main");
            yield_now();
        });
        assert_eq!(*trace.borrow(), vec!["main", "child"]);
    }

    #[test]
    fn spawn_future_resolves_from_a_coroutine() {
        let result = Scheduler::run(SchedulerConfig::default(), || {
            let scheduler = Scheduler::current();
            let future = scheduler.spawn_future(|| 21 * 2);
            match await_future(&future) {
                FutureOutcome::Resolved(v) => v,
                FutureOutcome::Rejected(_) => panic!("unexpected rejection"),
            }
        });
        assert_eq!(result, 42);
    }

    #[test]
    fn repeated_yields_do_not_starve_a_later_spawned_coroutine() {
        let trace = StdRc::new(StdRefCell::new(Vec::new()));
        let trace_in = trace.clone();
        Scheduler::run(SchedulerConfig::default(), move || {
            let scheduler = Scheduler::current();
            let trace_child = trace_in.clone();
            scheduler.spawn(move || trace_child.borrow_mut().push("child")).unwrap();
            for _ in 0..5 {
                trace_in.borrow_mut().push("main");
                yield_now();
            }
        });
        // A coroutine stuck at the head of the ready list that keeps
        // yielding must not permanently starve one behind it: the child
        // has to get a turn somewhere in the middle, not just after main
        // is entirely done.
        assert!(trace.borrow().contains(&"child"));
        assert_ne!(trace.borrow().last(), Some(&"child"), "child ran only after main exhausted all its yields");
    }

    #[test]
    fn lazy_future_never_awaited_never_runs_its_backing_coroutine() {
        let ran = StdRc::new(StdRefCell::new(false));
        let ran_in = ran.clone();
        let result = Scheduler::run(SchedulerConfig::default(), move || {
            let scheduler = Scheduler::current();
            let _never_awaited: Future<i32> = scheduler.create_future(false, move || {
                *ran_in.borrow_mut() = true;
                7
            });
            "done"
        });
        assert_eq!(result, "done");
        assert!(!*ran.borrow(), "a lazy future's backing coroutine must not run unless awaited");
    }

    #[test]
    fn lazy_future_starts_its_backing_coroutine_on_first_await() {
        let result = Scheduler::run(SchedulerConfig::default(), || {
            let scheduler = Scheduler::current();
            let future = scheduler.create_future(false, || 99);
            match await_future(&future) {
                FutureOutcome::Resolved(v) => v,
                FutureOutcome::Rejected(_) => panic!("unexpected rejection"),
            }
        });
        assert_eq!(result, 99);
    }
}
