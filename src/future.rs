//! Component C: a single-assignment value bridging a producer (a coroutine
//! or a worker thread) and any number of consumers.

use std::any::Any;
use std::fmt;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::coroutine::{self, Awaitable, CoroutineHandle};
use crate::wakeup;

/// The panic payload (or explicit rejection value) a future was rejected
/// with. Wraps the same `Box<dyn Any + Send>` shape `std::thread::Result`
/// uses, so a dispatched worker's panic payload needs no translation.
pub struct FutureError(Box<dyn Any + Send>);

impl FutureError {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        FutureError(payload)
    }

    /// Downcasts the rejection payload to a concrete type.
    pub fn downcast<E: 'static>(self) -> Result<E, Self> {
        match self.0.downcast::<E>() {
            Ok(value) => Ok(*value),
            Err(payload) => Err(FutureError(payload)),
        }
    }

    /// Renders the payload as a string when it is one, the common case for
    /// both an explicit `reject(String)` and a `panic!("...")` payload.
    pub fn message(&self) -> String {
        if let Some(s) = self.0.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string rejection payload".to_string()
        }
    }
}

impl fmt::Debug for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FutureError").field(&self.message()).finish()
    }
}

/// What a [`Future`] produced, once it stopped being pending.
#[derive(Debug)]
pub enum FutureOutcome<T> {
    Resolved(T),
    Rejected(FutureError),
}

enum FutureValue<T> {
    Pending,
    Resolved(Option<T>),
    Rejected(Option<FutureError>),
}

impl<T> FutureValue<T> {
    fn is_pending(&self) -> bool {
        matches!(self, FutureValue::Pending)
    }
}

struct FutureData<T> {
    value: FutureValue<T>,
    waiters: Vec<CoroutineHandle>,
    /// Write end of the scheduler's wakeup channel. Signalled whenever a
    /// resolve/reject happens from a worker thread, so the scheduler's
    /// blocking multiplexer wait returns promptly. A no-op cost from a
    /// coroutine-thread resolve (the scheduler isn't blocked yet) beyond an
    /// extra write the next poll drains away.
    wakeup_fd: RawFd,
    /// A lazily-started backing coroutine: present from construction until
    /// the future's first `start()`, at which point it is handed to the
    /// scheduler and this goes back to `None`. A future dropped while this
    /// is still `Some` (never awaited) frees the unscheduled coroutine
    /// instead of leaking its stack.
    backing: Option<CoroutineHandle>,
}

impl<T> Drop for FutureData<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.backing.take() {
            handle.destroy();
        }
    }
}

/// A single-assignment value, shared by an [`Arc`].
///
/// Cloning a `Future` shares the same control block; every clone observes
/// the same resolution. A future is `Send` whenever `T: Send`, so it can be
/// captured by a worker thread's closure ([`crate::dispatch`]) as well as
/// awaited from a coroutine.
pub struct Future<T>(Arc<Mutex<FutureData<T>>>);

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future(self.0.clone())
    }
}

impl<T> Future<T> {
    /// Creates a future with nothing yet decided. `wakeup_fd` must be the
    /// scheduler's wakeup channel write end.
    pub(crate) fn pending(wakeup_fd: RawFd) -> Self {
        Future(Arc::new(Mutex::new(FutureData {
            value: FutureValue::Pending,
            waiters: Vec::new(),
            wakeup_fd,
            backing: None,
        })))
    }

    /// Attaches a backing coroutine that has not yet been handed to the
    /// scheduler. [`start`](Self::start) must be called before the
    /// coroutine will ever run (the scheduler's `await_future` does this
    /// automatically on first await); dropping the future before that
    /// frees the coroutine unrun instead of leaking its stack.
    pub(crate) fn set_backing(&self, backing: CoroutineHandle) {
        self.0.lock().unwrap().backing = Some(backing);
    }

    /// Hands the backing coroutine, if one is still waiting to be
    /// started, to `track`. A no-op on a bare future or one already
    /// started.
    pub(crate) fn start(&self, track: impl FnOnce(CoroutineHandle)) {
        let handle = self.0.lock().unwrap().backing.take();
        if let Some(handle) = handle {
            track(handle);
        }
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// True once the future has been resolved or rejected.
    pub fn is_ready(&self) -> bool {
        !self.0.lock().unwrap().value.is_pending()
    }

    /// Atomically checks whether the future is still pending and, if so,
    /// registers `handle` to be woken when it is decided. Returns `false`,
    /// without registering anything, if the future was already decided by
    /// the time the lock was taken — the caller must treat that as "ready
    /// now" and read the outcome directly instead of suspending, since a
    /// waiter registered against an already-decided future would never be
    /// cleared by anything.
    pub(crate) fn try_add_waiting(&self, handle: CoroutineHandle) -> bool {
        let mut data = self.0.lock().unwrap();
        if !data.value.is_pending() {
            return false;
        }
        handle.add_waiting(Awaitable::Future(self.identity()));
        data.waiters.push(handle);
        true
    }

    pub(crate) fn remove_waiting(&self, handle: &CoroutineHandle) {
        let mut data = self.0.lock().unwrap();
        data.waiters.retain(|w| w.identity() != handle.identity());
    }

    fn resolve_or_reject(&self, value: FutureValue<T>) {
        let (waiters, wakeup_fd) = {
            let mut data = self.0.lock().unwrap();
            if !data.value.is_pending() {
                trace!("future already decided, ignoring duplicate resolve/reject");
                return;
            }
            data.value = value;
            (mem::take(&mut data.waiters), data.wakeup_fd)
            // lock released here: waiters are notified after unlock, so a
            // waiter whose own remove_waiting runs concurrently never
            // deadlocks against this future's mutex.
        };

        let identity = self.identity();
        for waiter in &waiters {
            waiter.remove_waiting(Awaitable::Future(identity));
        }
        wakeup::signal(wakeup_fd);
    }

    /// Resolves the future with a value. A future can only be decided
    /// once; later calls are ignored.
    pub fn resolve(&self, value: T) {
        self.resolve_or_reject(FutureValue::Resolved(Some(value)));
    }

    /// Rejects the future with an arbitrary payload (typically a panic
    /// payload forwarded from a dispatched producer).
    pub fn reject(&self, payload: Box<dyn Any + Send>) {
        self.resolve_or_reject(FutureValue::Rejected(Some(FutureError::new(payload))));
    }

    /// Claims the decided value, consuming it. Returns `None` if the
    /// future is still pending, or if the value was already taken.
    pub fn take(&self) -> Option<FutureOutcome<T>> {
        let mut data = self.0.lock().unwrap();
        match &mut data.value {
            FutureValue::Pending => None,
            FutureValue::Resolved(slot) => slot.take().map(FutureOutcome::Resolved),
            FutureValue::Rejected(slot) => slot.take().map(FutureOutcome::Rejected),
        }
    }

    /// Reads the decided value without consuming it. Requires `T: Clone`
    /// since the original stays behind for other readers (including a
    /// later `take`).
    pub fn peek(&self) -> Option<FutureOutcome<T>>
    where
        T: Clone,
    {
        let data = self.0.lock().unwrap();
        match &data.value {
            FutureValue::Pending => None,
            FutureValue::Resolved(slot) => slot.clone().map(FutureOutcome::Resolved),
            FutureValue::Rejected(slot) => slot.as_ref().map(|e| FutureOutcome::Rejected(FutureError::new(dyn_clone_message(e)))),
        }
    }
}

// `FutureError`'s payload is an opaque `Box<dyn Any + Send>`; peeking a
// rejection can't clone the original payload, so it is re-boxed as its
// rendered message instead. A `take()` on the same future still yields the
// original, un-degraded payload.
fn dyn_clone_message(e: &FutureError) -> Box<dyn Any + Send> {
    Box::new(e.message())
}

// SAFETY: the only non-`Send` field reachable through `FutureData<T>` is
// `Vec<CoroutineHandle>`, and `CoroutineHandle` is itself `unsafe impl
// Send` (see `coroutine.rs`) for the same documented reason: a worker
// thread only touches a waiter's handle while the scheduler thread is
// parked in the multiplexer wait.
unsafe impl<T: Send> Send for Future<T> {}
unsafe impl<T: Send> Sync for Future<T> {}

/// Suspends the calling coroutine until every future in `futures` is
/// decided, then returns each one's outcome in order, without consuming
/// any of them (so a caller can still `take()` afterward).
///
/// Mirrors the C original's "awaitable multiset": the calling coroutine is
/// registered against every future still pending at once and is resumed
/// (possibly spuriously, if more than one of them was awaited together)
/// until none remain.
pub fn all<T: Clone + 'static>(futures: &[Future<T>]) -> Vec<FutureOutcome<T>> {
    let coro = coroutine::current().expect("future::all called outside a running coroutine");

    loop {
        let still_pending: Vec<&Future<T>> = futures.iter().filter(|f| !f.is_ready()).collect();
        if still_pending.is_empty() {
            break;
        }

        // Register against every still-pending future under each one's own
        // lock in turn. If any of them decided in the window between the
        // `is_ready` filter above and its own `try_add_waiting`, unregister
        // everything registered so far and re-scan instead of suspending —
        // a registration against an already-decided future would wait
        // forever.
        let mut registered: Vec<&Future<T>> = Vec::with_capacity(still_pending.len());
        let mut raced = false;
        for f in &still_pending {
            if f.try_add_waiting(coro.clone()) {
                registered.push(f);
            } else {
                raced = true;
                break;
            }
        }
        if raced {
            for f in &registered {
                f.remove_waiting(&coro);
            }
            continue;
        }

        coroutine::suspend();
        for f in &registered {
            f.remove_waiting(&coro);
        }
    }

    futures.iter().map(|f| f.peek().expect("future ready but has no outcome")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_then_take_yields_value_once() {
        let fut: Future<i32> = Future::pending(-1);
        assert!(!fut.is_ready());
        fut.resolve(42);
        assert!(fut.is_ready());
        match fut.take() {
            Some(FutureOutcome::Resolved(v)) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {:?}", other.is_some()),
        }
        assert!(fut.take().is_none(), "a value can only be taken once");
    }

    #[test]
    fn reject_carries_message() {
        let fut: Future<i32> = Future::pending(-1);
        fut.reject(Box::new("boom"));
        match fut.take() {
            Some(FutureOutcome::Rejected(err)) => assert_eq!(err.message(), "boom"),
            other => panic!("unexpected outcome: {:?}", other.is_some()),
        }
    }

    #[test]
    fn second_resolve_is_ignored() {
        let fut: Future<i32> = Future::pending(-1);
        fut.resolve(1);
        fut.resolve(2);
        match fut.take() {
            Some(FutureOutcome::Resolved(v)) => assert_eq!(v, 1),
            other => panic!("unexpected outcome: {:?}", other.is_some()),
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let fut: Future<i32> = Future::pending(-1);
        fut.resolve(9);
        assert!(matches!(fut.peek(), Some(FutureOutcome::Resolved(9))));
        assert!(matches!(fut.peek(), Some(FutureOutcome::Resolved(9))));
        assert!(matches!(fut.take(), Some(FutureOutcome::Resolved(9))));
    }
}
