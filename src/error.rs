//! Error types that cross the public API boundary.
//!
//! Per the error-handling design, almost nothing in this crate propagates an
//! error asynchronously: producer failure is a future state (`Rejected`),
//! protocol violations are either logged-and-ignored or fatal aborts, and
//! transient I/O hiccups on the multiplexer or the wakeup pipe are logged and
//! swallowed. The only thing that actually returns `Result` is resource
//! exhaustion at the point an allocation or a thread spawn was attempted.

use context::stack::StackError;
use thiserror::Error;

/// Failure at a point where the runtime tried to allocate a resource.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A coroutine's guarded stack could not be allocated.
    #[error("failed to allocate a coroutine stack")]
    StackAlloc(#[from] StackError),

    /// A worker thread for a dispatched future could not be spawned.
    #[error("failed to spawn a worker thread")]
    ThreadSpawn(#[source] std::io::Error),

    /// The scheduler's wakeup channel (a self-pipe) could not be created.
    #[error("failed to set up the scheduler's wakeup channel")]
    WakeupChannelInit(#[source] std::io::Error),
}
