#![allow(clippy::let_and_return)]
//! A user-space M:N fiber runtime.
//!
//! Many cooperative fibers (lightweight tasks, each with its own stack) are
//! multiplexed onto a small pool of OS worker threads. A non-blocking I/O
//! reactor is wired into every blocking primitive, so a socket read that
//! would block only ever suspends the calling fiber, never the worker
//! thread underneath it.
//!
//! - [Scheduler](scheduler) and [Worker](worker): the thread pool, run
//!   queues, sleep/wake protocol and termination detection.
//! - [Fiber](fiber): stack + context + join state.
//! - [Synchronization primitives](sync): the waiter handshake, the
//!   intrusive lock, and mutex/condition/semaphore built on top of it.
//! - [Timers](timers): per-bucket deadline tracking integrated with the
//!   poller, exposed to callers through [`time::sleep_for`]/[`time::sleep_until`].
//! - [Reactor](reactor) and [Socket](socket): the non-blocking I/O side.
//!
//! ### Prerequisites
//!
//! - rustc 1.71 or newer
//! - Linux or macOS (x86_64 or aarch64)
//!
//! > **Caution!** This crate performs its own stack switching via raw
//! > assembly and `mmap`. Misuse of the low-level [`fiber`] APIs (joining
//! > across schedulers, using a socket from more than one fiber per
//! > direction, etc.) is undefined behavior; the high-level APIs guard
//! > against this where practical.
pub(crate) mod context;
pub mod error;
pub mod fiber;
pub(crate) mod queue;
pub(crate) mod reactor;
pub mod scheduler;
pub mod socket;
pub mod stack;
pub mod sync;
pub mod time;
pub(crate) mod timers;
pub(crate) mod worker;

pub use error::{Error, Result};
pub use fiber::{spawn, this_fiber, Fiber, FiberAttr, JoinHandle};
pub use scheduler::{Scheduler, SchedulerAttr};
pub use sync::{Cond, Mutex, MutexGuard, Semaphore};
pub use time::{sleep_for, sleep_until};

/// A specialized alias matching [`std::result::Result`], exported for
/// symmetry with [`Result`] in contexts that need to spell out the `std`
/// one explicitly.
pub type StdResult<T, E> = std::result::Result<T, E>;
