//! A counting semaphore built on [`crate::sync::waiters_queue`] (spec 4.8).

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::sync::waiters_queue::{self, WaitersQueue};
use crate::time::deadline_from;

pub struct Semaphore {
    value: AtomicI32,
    queue: WaitersQueue,
}

impl Semaphore {
    pub fn new(initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
            queue: WaitersQueue::new(),
        }
    }

    /// Decrements `value` inline if positive, otherwise parks.
    fn try_take(&self) -> bool {
        loop {
            let current = self.value.load(Ordering::Acquire);
            if current <= 0 {
                return false;
            }
            if self
                .value
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn wait(&self) {
        if self.try_take() {
            return;
        }
        waiters_queue::wait(&self.queue, None, || !self.try_take())
            .expect("untimed semaphore wait is infallible");
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        self.wait_until(deadline_from(timeout)?)
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<()> {
        if self.try_take() {
            return Ok(());
        }
        waiters_queue::wait(&self.queue, Some(deadline), || !self.try_take())
    }

    /// Wakes one waiter. If nobody was parked, credits `value` instead —
    /// spec 4.8's "if nobody was woken the callback increments value".
    pub fn post(&self) {
        waiters_queue::wake(&self.queue, 1, |num_woken, _now_empty| {
            if num_woken == 0 {
                self.value.fetch_add(1, Ordering::AcqRel);
            }
        });
    }

    pub fn value(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_wait_round_trips_value() {
        let sem = Semaphore::new(0);
        sem.post();
        assert_eq!(sem.value(), 1);
        sem.wait();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn wait_until_with_an_available_permit_never_parks() {
        // Exercises the fast path only: a fiberless unit test cannot park
        // (that needs a running scheduler), but an available permit must
        // short-circuit before `waiters_queue::wait` ever calls
        // `this_fiber()`. The blocking/timeout path is covered by the
        // scheduler-level integration tests.
        let sem = Semaphore::new(1);
        assert!(sem.wait_until(Instant::now()).is_ok());
        assert_eq!(sem.value(), 0);
    }
}
