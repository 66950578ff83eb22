//! Single-threaded cooperative fiber runtime.
//!
//! `strand` multiplexes many logical tasks onto one OS thread over
//! non-blocking I/O. Application code is written in straight-line `async`
//! style and suspends only at designated points: channel operations,
//! wait-group waits, sleeps, I/O-readiness waits, explicit yields and
//! preemption checks. Between two suspension points code runs to completion
//! without observable interleaving, so no locks are needed for in-process
//! state.
//!
//! The crate contains:
//!
//! - [Fibers: spawning, joining, sleeping, deferred cleanup](fiber)
//! - [The event loop and contexts](runtime)
//! - [Channels](fiber::channel): buffered/unbuffered FIFO rendezvous
//! - [Publishers](fiber::publisher): one-to-many broadcast with backpressure
//! - [WaitGroups](fiber::wait_group) and [select](fiber::select)
//!
//! Structured concurrency is the core guarantee: [`run`] drives a context
//! until *every* fiber spawned within it has finished, and a panic escaping
//! a fiber nobody awaited is re-raised to the caller of `run`.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use strand::fiber;
//!
//! strand::run(async {
//!     let (tx, rx) = fiber::channel::<String>(2);
//!     fiber::spawn(async move {
//!         for i in 0..5 {
//!             tx.send(format!("Task {i}")).await.unwrap();
//!         }
//!     });
//!     fiber::spawn(async move {
//!         while let Some(task) = rx.recv().await {
//!             fiber::sleep(Duration::from_millis(10)).await;
//!             println!("{task}");
//!         }
//!     });
//! })
//! .unwrap();
//! ```

pub mod error;
pub mod fiber;
pub mod runtime;
pub mod time;

pub use error::{Error, Result};
pub use runtime::run;
