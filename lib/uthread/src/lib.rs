//! Cooperative user-level threading with timer-driven preemption.
//!
//! `uthread` multiplexes many logical threads of control onto a single OS
//! thread. Each user-level thread gets its own `mmap`-backed stack
//! ([`uthread_ctx`]) and is switched in and out with a raw machine-context
//! switch; a [`Scheduler`] owns a ready queue and a zombie queue and decides
//! which thread runs next; a periodic virtual-time timer
//! ([`uthread_preempt`]) forces a yield roughly every 10 ms so a thread that
//! never calls `yield_now` doesn't starve the rest.
//!
//! ```
//! use std::any::Any;
//!
//! fn entry(_arg: Box<dyn Any>) {
//!     print!("A ");
//!     uthread::yield_now();
//!     println!("C");
//! }
//!
//! uthread::run(false, entry, Box::new(())).unwrap();
//! ```
//!
//! # Layout
//!
//! - [`scheduler`] owns the ready/zombie queues, the "current thread" cell,
//!   and the `create`/`yield_now`/`exit`/`block`/`unblock`/`current`/`run`
//!   operations.
//! - [`sem`] provides [`Semaphore`], a counting semaphore with a FIFO
//!   blocked-waiter queue, built entirely on the scheduler's `block`/
//!   `unblock`.
//! - [`error`] is the small fixed error enum every fallible entry point in
//!   this crate reports.
//! - `ffi` (behind the `ffi` feature) is a C-ABI-compatible shim over the
//!   above, for callers migrating from the C library this crate's design
//!   descends from.
//!
//! None of the types here implement `Send`/`Sync`: there is exactly one OS
//! thread running any given [`Scheduler`], and moving a `TcbHandle` or
//! `Semaphore` to another OS thread would be meaningless (the scheduler
//! that could ever switch into it lives elsewhere). This is enforced at
//! compile time by every core type being built on `Rc`/`RefCell`/`Cell`
//! rather than their `Arc`/`Mutex` counterparts.

#![warn(missing_docs)]

pub mod error;
pub mod scheduler;
pub mod sem;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use error::Error;
pub use scheduler::{block, create, current, exit, run, unblock, yield_now, EntryFn, TcbHandle};
pub use sem::Semaphore;
