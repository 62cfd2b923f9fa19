// Copyright 2013-2014 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The register-only context switch, component A.
//!
//! This module does not hand-roll the assembly that saves and restores a
//! register set; the `context` crate already is that abstract contract,
//! implemented for every architecture this crate would otherwise have to
//! special-case. What lives here is the bit the spec actually cares about:
//! a single thread-local slot holding "the context to resume in order to
//! hand control back to whoever resumed us", updated on every switch in
//! either direction, plus a second slot used exactly once per coroutine to
//! smuggle its boxed entry closure across the very first switch (a plain
//! `extern "C" fn` pointer has nowhere else to carry it).

use std::any::Any;
use std::cell::RefCell;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

pub(crate) use context::stack::StackError;

/// A coroutine's private, guarded stack.
pub(crate) type Stack = ProtectedFixedSizeStack;

/// The function a freshly-prepared context "returns into" on its first
/// resumption. See `coroutine::trampoline`.
pub(crate) type EntryFn = extern "C" fn(Transfer) -> !;

/// The boxed body of a coroutine, type-erased the same way
/// `std::thread::JoinHandle` type-erases a panic payload: the concrete
/// return type is recovered by the caller via `downcast`.
pub(crate) type BoxedEntry = Box<dyn FnOnce() -> Box<dyn Any>>;

thread_local! {
    /// The context that switches control back to the scheduler. Populated
    /// by whoever is resumed (the trampoline on first entry, or the
    /// resumption point of a previous yield) from the `Transfer` they were
    /// handed, and consumed by the next yield/finish on this thread.
    static RESUME: RefCell<Option<Context>> = RefCell::new(None);

    /// The entry closure for a coroutine about to make its first switch.
    /// Set by the scheduler immediately before the first `resume`, taken by
    /// the trampoline as its first act.
    static START_PAYLOAD: RefCell<Option<BoxedEntry>> = RefCell::new(None);
}

pub(crate) fn allocate_stack(size: usize) -> Result<Stack, StackError> {
    ProtectedFixedSizeStack::new(size)
}

pub(crate) fn prepare(stack: &Stack, entry: EntryFn) -> Context {
    unsafe { Context::new(stack, entry) }
}

/// Stashes the entry closure for the next first-resume on this thread.
pub(crate) fn stage_start_payload(entry: BoxedEntry) {
    START_PAYLOAD.with(|slot| {
        let previous = slot.borrow_mut().replace(entry);
        debug_assert!(previous.is_none(), "leftover start payload from a previous coroutine");
    });
}

/// Takes the entry closure staged for this coroutine's trampoline. Must be
/// called at most once, from the trampoline, on first entry.
pub(crate) fn take_start_payload() -> BoxedEntry {
    START_PAYLOAD
        .with(|slot| slot.borrow_mut().take())
        .expect("coroutine trampoline entered without a staged entry closure")
}

/// Records the context that a switch handed us, so a later yield on this
/// same coroutine knows where to switch back to.
pub(crate) fn remember_resume_point(ctx: Context) {
    RESUME.with(|slot| *slot.borrow_mut() = Some(ctx));
}

/// Switches back to whichever context this coroutine last remembered,
/// passing `data` along, and remembers the new resume point handed back.
///
/// Panics if called outside a running coroutine (no resume point has ever
/// been recorded on this thread), matching the spec's "yielding outside a
/// running coroutine ... is fatal".
pub(crate) fn switch_back(data: usize) {
    let ctx = RESUME
        .with(|slot| slot.borrow_mut().take())
        .expect("yield or await outside of a running coroutine");
    let transfer = unsafe { ctx.resume(data) };
    remember_resume_point(transfer.context);
}
