// Copyright 2013 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A cooperative, single-threaded async runtime built on stackful
//! coroutines.
//!
//! A [`scheduler::Scheduler`] drives one OS thread, switching between
//! plain-stack coroutines the way an OS switches between processes, and
//! blocking in a `poll()`-based multiplexer whenever nothing is runnable.
//! Values that a coroutine or a dispatched worker thread produces flow
//! back through a [`future::Future`], the crate's single-assignment
//! bridge between producer and consumer.
//!
//! ```no_run
//! use async_coro::config::SchedulerConfig;
//! use async_coro::scheduler::{self, Scheduler};
//!
//! let greeting = Scheduler::run(SchedulerConfig::default(), || {
//!     let scheduler = Scheduler::current();
//!     let future = scheduler.spawn_future(|| "hello from a coroutine");
//!     match scheduler::await_future(&future) {
//!         async_coro::future::FutureOutcome::Resolved(v) => v,
//!         async_coro::future::FutureOutcome::Rejected(_) => "rejected",
//!     }
//! });
//! assert_eq!(greeting, "hello from a coroutine");
//! ```

pub mod config;
mod context;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod scheduler;
mod wakeup;

pub use config::SchedulerConfig;
pub use coroutine::{CoroutineHandle, CoroutineState};
pub use dispatch::dispatch;
pub use error::RuntimeError;
pub use future::{all, Future, FutureError, FutureOutcome};
pub use scheduler::{await_fd, await_function, await_future, yield_now, Scheduler};
