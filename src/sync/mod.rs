//! Synchronization primitives: the waiter handshake and intrusive lock that
//! everything else is built from, the ordered waiters queue, and the three
//! public primitives (mutex/condition/semaphore) layered on top of it (spec
//! sections 4.5-4.8).

pub(crate) mod ilock;
mod mutex;
mod cond;
mod semaphore;
pub(crate) mod os_lock;
pub(crate) mod qsbr;
pub(crate) mod waiter;
pub(crate) mod waiters_queue;

pub use cond::Cond;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
