// Copyright 2013 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Component B: a unit of suspendable work with its own stack.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use context::Context;
use log::{debug, warn};

use crate::context as ctxswitch;
use crate::error::RuntimeError;

/// Lifecycle state of a [`CoroutineHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    New,
    Running,
    Suspended,
    Finished,
    Failed,
}

/// A tagged reference to something a coroutine can be blocked on.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Awaitable {
    /// Identifies a future by the address of its shared control block.
    Future(usize),
    Fd(RawFd),
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Awaitable::Future(addr) => write!(f, "Awaitable::Future({:#x})", addr),
            Awaitable::Fd(fd) => write!(f, "Awaitable::Fd({})", fd),
        }
    }
}

struct RawCoroutine {
    name: Option<String>,
    state: Cell<CoroutineState>,
    waiting_on: RefCell<Vec<Awaitable>>,
    context: Cell<Option<Context>>,
    // Dropped on `destroy`, releasing the guarded stack.
    stack: RefCell<Option<ctxswitch::Stack>>,
    return_value: RefCell<Option<Box<dyn Any>>>,
    owned: Cell<bool>,
}

/// A handle to a coroutine.
///
/// Cloning a handle does not clone the coroutine; it shares the same
/// underlying control block, the way the teacher crate's `Handle` wraps a
/// unique pointer to its `Coroutine`. Every clone is confined to the
/// scheduler thread except in one narrow, documented case: a THREADED
/// future's `resolve`/`reject`, running on a worker thread, walks the
/// wait-list it captured under its own mutex to mark waiters ready (see
/// `future.rs`).
#[derive(Clone)]
pub struct CoroutineHandle(Rc<RawCoroutine>);

// SAFETY: a `CoroutineHandle` is dereferenced from a worker thread only
// while the scheduler thread is parked in the multiplexer wait (that wait
// is exactly what the wakeup channel's signal/drain handshake guards), so
// the two threads never touch a given coroutine's fields at the same
// instant even though nothing in the type system expresses that. See
// `future::FutureData::resolve_or_reject`.
unsafe impl Send for CoroutineHandle {}

extern "C" fn trampoline(transfer: context::Transfer) -> ! {
    ctxswitch::remember_resume_point(transfer.context);
    let body = ctxswitch::take_start_payload();

    let handle = current().expect("coroutine trampoline entered with no current coroutine set");

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => {
            *handle.0.return_value.borrow_mut() = Some(result);
            handle.0.state.set(CoroutineState::Finished);
        }
        Err(payload) => {
            warn!("coroutine {:?} panicked", handle.name());
            *handle.0.return_value.borrow_mut() = Some(payload);
            handle.0.state.set(CoroutineState::Failed);
        }
    }

    ctxswitch::switch_back(0);
    unreachable!("a finished coroutine was resumed again");
}

thread_local! {
    static CURRENT: RefCell<Option<CoroutineHandle>> = RefCell::new(None);

    // Entry closures staged between `create` and the first `run`, keyed by
    // the coroutine's identity. A coroutine may be created long before it
    // is ever run (a lazy future's backing coroutine), so this cannot
    // live in the one-shot slot `context` uses for the trampoline hand-off.
    static STAGED: RefCell<HashMap<usize, ctxswitch::BoxedEntry>> = RefCell::new(HashMap::new());
}

impl CoroutineHandle {
    /// Allocates a coroutine's stack and prepares its initial context. The
    /// coroutine does not run until the scheduler calls [`run`](Self::run).
    pub(crate) fn create<F, R>(stack_size: usize, name: Option<String>, owned: bool, f: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        let stack = ctxswitch::allocate_stack(stack_size)?;
        let context = ctxswitch::prepare(&stack, trampoline);

        let boxed: ctxswitch::BoxedEntry = Box::new(move || -> Box<dyn Any> { Box::new(f()) });

        let raw = RawCoroutine {
            name,
            state: Cell::new(CoroutineState::New),
            waiting_on: RefCell::new(Vec::new()),
            context: Cell::new(Some(context)),
            stack: RefCell::new(Some(stack)),
            return_value: RefCell::new(None),
            owned: Cell::new(owned),
        };
        let handle = CoroutineHandle(Rc::new(raw));
        STAGED.with(|s| s.borrow_mut().insert(handle.identity(), boxed));
        Ok(handle)
    }

    /// Switches into this coroutine, suspending the caller until it yields
    /// or finishes. Must only be called from the scheduler thread.
    pub(crate) fn run(&self) {
        if self.state() == CoroutineState::New {
            let body = STAGED
                .with(|s| s.borrow_mut().remove(&self.identity()))
                .expect("coroutine resumed without a staged entry closure");
            ctxswitch::stage_start_payload(body);
        }

        let previous_current = CURRENT.with(|c| c.borrow_mut().replace(self.clone()));
        self.0.state.set(CoroutineState::Running);

        let ctx = self.0.context.take().expect("coroutine resumed while already running");
        let transfer = unsafe { ctx.resume(0) };
        self.0.context.set(Some(transfer.context));

        CURRENT.with(|c| *c.borrow_mut() = previous_current);
    }

    pub(crate) fn add_waiting(&self, awaitable: Awaitable) {
        self.0.waiting_on.borrow_mut().push(awaitable);
    }

    pub(crate) fn remove_waiting(&self, awaitable: Awaitable) {
        let mut waiting = self.0.waiting_on.borrow_mut();
        if let Some(pos) = waiting.iter().position(|a| *a == awaitable) {
            waiting.remove(pos);
        }
    }

    /// True if the coroutine has never run, or is suspended with nothing
    /// left in its wait list.
    pub fn is_ready(&self) -> bool {
        match self.0.state.get() {
            CoroutineState::New => true,
            CoroutineState::Suspended => self.0.waiting_on.borrow().is_empty(),
            _ => false,
        }
    }

    pub fn state(&self) -> CoroutineState {
        self.0.state.get()
    }

    pub(crate) fn set_state(&self, state: CoroutineState) {
        self.0.state.set(state);
    }

    pub fn is_owned(&self) -> bool {
        self.0.owned.get()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Takes the coroutine's return value (or panic payload), downcast to
    /// `R`. Returns `None` if the coroutine has not finished, or `R` does
    /// not match what it actually produced.
    pub(crate) fn take_return_value<R: 'static>(&self) -> Option<R> {
        let boxed = self.0.return_value.borrow_mut().take()?;
        match boxed.downcast::<R>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                *self.0.return_value.borrow_mut() = Some(boxed);
                None
            }
        }
    }

    /// Releases the coroutine's stack. Only valid once it can never be
    /// resumed again (finished, failed, or never started).
    pub(crate) fn destroy(self) {
        debug!("destroying coroutine {:?}", self.name());
        self.0.stack.borrow_mut().take();
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Returns the coroutine currently running on this thread, if any.
pub(crate) fn current() -> Option<CoroutineHandle> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Suspends the calling coroutine until the scheduler resumes it. Panics
/// if called outside a running coroutine.
pub(crate) fn suspend() {
    let handle = current().expect("yield or await outside of a running coroutine");
    handle.set_state(CoroutineState::Suspended);
    ctxswitch::switch_back(0);
    handle.set_state(CoroutineState::Running);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn runs_to_completion_and_yields_return_value() {
        let co = CoroutineHandle::create(64 * 1024, Some("t".into()), true, || 7_i32).unwrap();
        assert_eq!(co.state(), CoroutineState::New);
        co.run();
        assert_eq!(co.state(), CoroutineState::Finished);
        assert_eq!(co.take_return_value::<i32>(), Some(7));
    }

    #[test]
    fn yields_once_then_finishes() {
        let trace = StdRc::new(StdRefCell::new(Vec::new()));
        let trace_in = trace.clone();
        let co = CoroutineHandle::create(64 * 1024, None, true, move || {
            trace_in.borrow_mut().push(1);
            suspend();
            trace_in.borrow_mut().push(2);
            "done"
        })
        .unwrap();

        co.run();
        assert_eq!(co.state(), CoroutineState::Suspended);
        assert_eq!(*trace.borrow(), vec![1]);

        co.run();
        assert_eq!(co.state(), CoroutineState::Finished);
        assert_eq!(*trace.borrow(), vec![1, 2]);
        assert_eq!(co.take_return_value::<&'static str>(), Some("done"));
    }

    #[test]
    fn panic_in_body_yields_failed_state() {
        let co = CoroutineHandle::create(64 * 1024, None, true, || -> i32 { panic!("boom") }).unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| co.run()));
        assert!(result.is_ok(), "running the coroutine itself must not panic the caller");
        assert_eq!(co.state(), CoroutineState::Failed);
    }

    #[test]
    fn is_ready_reflects_wait_list() {
        let co = CoroutineHandle::create(64 * 1024, None, true, || ()).unwrap();
        assert!(co.is_ready());
        co.set_state(CoroutineState::Suspended);
        co.add_waiting(Awaitable::Fd(3));
        assert!(!co.is_ready());
        co.remove_waiting(Awaitable::Fd(3));
        assert!(co.is_ready());
    }
}
