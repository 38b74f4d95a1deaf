//! The intrusive lock: a short, fiber-aware lock that yields the contending
//! fiber to the scheduler instead of spinning, and hands the lock off
//! directly to the next owner on unlock (no re-acquisition race, no
//! spurious wakeups).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;

use crate::fiber::FiberRef;

use super::os_lock::OsLock;

const UNLOCKED: u8 = 0;
const LOCKED_NO_WAITERS: u8 = 1;
const LOCKED_WITH_WAITERS: u8 = 2;

pub(crate) struct Ilock {
    state: AtomicU8,
    os_lock: OsLock,
    queue: StdMutex<VecDeque<FiberRef>>,
}

impl Ilock {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
            os_lock: OsLock::new(),
            queue: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED_NO_WAITERS, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    fn lock_slow(&self) {
        // The OS lock here is the short mutex/spinlock guarding the ilock's
        // own waiter queue, not a second copy of `state`; it is held only
        // long enough to flip `state` and, if contended, enqueue.
        let guard = self.os_lock.lock();
        let previous = self.state.swap(LOCKED_WITH_WAITERS, Ordering::AcqRel);
        if previous == UNLOCKED {
            self.state.store(LOCKED_NO_WAITERS, Ordering::Release);
            drop(guard);
            return;
        }

        let me = crate::fiber::this_fiber();
        self.queue.lock().unwrap().push_back(me);
        // Release the OS lock only after the context switch has committed,
        // so no other worker can observe this fiber as both "about to park"
        // and "running" at once.
        crate::worker::park_current_and_then(move || drop(guard));
        // Resumes here already owning the lock: whoever called `unlock` and
        // popped us off the queue transferred ownership directly.
    }

    /// Releases the lock. If another fiber was waiting, returns it so the
    /// caller can push it onto a run queue — the returned fiber already
    /// owns the lock (no further `state` manipulation needed on its part).
    pub fn unlock(&self) -> Option<FiberRef> {
        if self
            .state
            .compare_exchange(LOCKED_NO_WAITERS, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return None;
        }
        self.unlock_slow()
    }

    fn unlock_slow(&self) -> Option<FiberRef> {
        let _guard = self.os_lock.lock();
        let mut queue = self.queue.lock().unwrap();
        match queue.pop_front() {
            None => {
                self.state.store(UNLOCKED, Ordering::Release);
                None
            }
            Some(fiber) => {
                if queue.is_empty() {
                    self.state.store(LOCKED_NO_WAITERS, Ordering::Release);
                } else {
                    self.state.store(LOCKED_WITH_WAITERS, Ordering::Release);
                }
                Some(fiber)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_round_trip_leaves_state_unlocked() {
        let lock = Ilock::new();
        lock.lock();
        assert_eq!(lock.unlock(), None);
        assert_eq!(lock.state.load(Ordering::Relaxed), UNLOCKED);
    }
}
