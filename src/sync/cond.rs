//! A condition variable built on [`crate::sync::waiters_queue`] (spec 4.8).
//! `wait`'s `recheck` callback is just "unlock the mutex" — the atomicity
//! the waiters queue provides is what guarantees the mutex is released
//! exactly once the fiber is durably enqueued, closing the classic
//! lost-wakeup gap between unlocking and parking.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::sync::waiters_queue::{self, WaitersQueue};
use crate::time::deadline_from;

pub struct Cond {
    queue: WaitersQueue,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    pub fn new() -> Self {
        Self {
            queue: WaitersQueue::new(),
        }
    }

    /// Releases `mutex`, parks until notified, then reacquires it — spec
    /// invariant 4. May return having missed the actual notification
    /// ("spurious"); callers must re-check their condition in a loop, the
    /// same contract `std::sync::Condvar` has.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex: &'a Mutex<T> = guard.mutex();
        std::mem::forget(guard);
        waiters_queue::wait(&self.queue, None, || {
            mutex.unlock_for_cond();
            true
        })
        .expect("untimed cond wait is infallible");
        mutex.lock()
    }

    /// As [`wait`](Self::wait), but gives up after `timeout` and reacquires
    /// the mutex regardless of the outcome, matching `wait`'s "reacquire
    /// before returning" invariant even on timeout.
    pub fn wait_for<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<MutexGuard<'a, T>> {
        let deadline = deadline_from(timeout)?;
        self.wait_until(guard, deadline)
    }

    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, T>> {
        let mutex: &'a Mutex<T> = guard.mutex();
        std::mem::forget(guard);
        let result = waiters_queue::wait(&self.queue, Some(deadline), || {
            mutex.unlock_for_cond();
            true
        });
        let relocked = mutex.lock();
        result.map(|()| relocked)
    }

    /// Wakes at most one waiting fiber.
    pub fn notify_one(&self) {
        waiters_queue::wake(&self.queue, 1, |_, _| {});
    }

    /// Wakes every waiting fiber.
    pub fn notify_all(&self) {
        waiters_queue::wake(&self.queue, usize::MAX, |_, _| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_and_notify_with_no_waiters_is_a_no_op() {
        let cond = Cond::new();
        cond.notify_one();
        cond.notify_all();
    }
}
