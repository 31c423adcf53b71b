//! A small cooperative async core
//!
//! This crate provides the concurrency primitives `micro-server` is built on:
//! a single-timeline event loop, single-assignment promises with cooperative
//! cancellation, a cancellable timeout combinator and an adapter that turns
//! push-style callbacks into pull-style streams.
//!
//! # Features
//!
//! - Deterministic virtual-time event loop for tests
//! - Timers ordered by deadline with FIFO tie-break
//! - Promises that settle exactly once, whatever races against them
//! - Timeouts that cancel the losing side and never resume twice
//! - Offloading blocking work to a worker pool without blocking the loop
//!
//! # Example
//!
//! ```
//! use micro_async::{timeout::with_timeout, EventLoop};
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::virtual_time();
//! let el = event_loop.clone();
//! let answer = with_timeout(&event_loop, Duration::from_secs(1), "answer", async move {
//!     el.sleep(Duration::from_millis(10)).await?;
//!     Ok(42)
//! });
//!
//! assert_eq!(event_loop.block_on(answer).unwrap(), 42);
//! ```
//!
//! # Architecture
//!
//! - [`EventLoop`]: timers, tasks and the run loop
//! - [`promise`]: [`Promise`] and [`Deferred`]
//! - [`timeout`]: [`with_timeout`](timeout::with_timeout) and [`Deadline`](timeout::Deadline)
//! - [`generator`]: [`AsyncGenerator`](generator::AsyncGenerator) and [`Emitter`](generator::Emitter)
//!
//! # Limitations
//!
//! - Everything attached to one loop lives on one thread; handles are `!Send`
//! - Cancellation is cooperative: a cancelled task is dropped at its next
//!   suspension point, synchronous code already running is never interrupted

mod error;
mod event_loop;
mod worker;

pub mod generator;
pub mod promise;
pub mod timeout;

pub use error::AsyncError;
pub use event_loop::{EventLoop, EventLoopBuilder, TimerHandle};
pub use promise::{Deferred, Promise, PromiseState, Settlement};
