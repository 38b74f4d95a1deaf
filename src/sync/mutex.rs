//! A fair, handoff-based mutex built on [`crate::sync::waiters_queue`] (spec
//! 4.8). `lock`/`unlock` hand the lock directly to the next waiter in FIFO
//! order rather than letting a freshly woken fiber race a new arrival for
//! it — the same handoff discipline as [`crate::sync::ilock::Ilock`], one
//! layer up.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::sync::waiters_queue::{self, WaitersQueue};
use crate::time::deadline_from;

const UNLOCKED: u8 = 0;
const LOCKED_NO_WAITERS: u8 = 1;
const LOCKED_WITH_WAITERS: u8 = 2;

/// A mutex that suspends contending fibers instead of spinning them, with
/// fair FIFO handoff on unlock.
pub struct Mutex<T> {
    state: AtomicU8,
    queue: WaitersQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
            queue: WaitersQueue::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// `recheck` for the waiters-queue protocol: claims the lock inline if
    /// it was free, otherwise marks it contended and tells the caller to
    /// park. Shared by `lock`/`try_lock_for`/`try_lock_until`.
    fn recheck_and_mark_contended(&self) -> bool {
        let previous = self.state.swap(LOCKED_WITH_WAITERS, Ordering::AcqRel);
        if previous == UNLOCKED {
            self.state.store(LOCKED_NO_WAITERS, Ordering::Release);
            false
        } else {
            true
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.state
            .compare_exchange(
                UNLOCKED,
                LOCKED_NO_WAITERS,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
            .then(|| MutexGuard { mutex: self })
    }

    /// Blocks until the lock is acquired. Always succeeds — an untimed
    /// waiters-queue wait never returns an error.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }
        waiters_queue::wait(&self.queue, None, || self.recheck_and_mark_contended())
            .expect("untimed mutex wait is infallible");
        MutexGuard { mutex: self }
    }

    /// May fail with [`crate::Error::TimedOut`] spuriously close to the
    /// deadline even if the lock became available moments later — callers
    /// that must not give up are expected to loop (spec 4.8's contract).
    pub fn try_lock_for(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        self.try_lock_until(deadline_from(timeout)?)
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Result<MutexGuard<'_, T>> {
        if let Some(guard) = self.try_lock() {
            return Ok(guard);
        }
        waiters_queue::wait(&self.queue, Some(deadline), || {
            self.recheck_and_mark_contended()
        })?;
        Ok(MutexGuard { mutex: self })
    }

    /// Releases the lock, handing it directly to the next waiter if any.
    pub(crate) fn unlock(&self) {
        if self
            .state
            .compare_exchange(
                LOCKED_NO_WAITERS,
                UNLOCKED,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }
        waiters_queue::wake(&self.queue, 1, |num_woken, now_empty| {
            let next = if num_woken == 0 {
                UNLOCKED
            } else if now_empty {
                LOCKED_NO_WAITERS
            } else {
                LOCKED_WITH_WAITERS
            };
            self.state.store(next, Ordering::Release);
        });
    }

    /// Used by [`crate::sync::Cond::wait`] to drop the lock atomically with
    /// enqueueing on the condition's own waiters queue.
    pub(crate) fn unlock_for_cond(&self) {
        self.unlock();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// RAII guard returned by [`Mutex::lock`] and friends; releasing the lock
/// happens on drop.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_round_trip_leaves_state_unlocked() {
        let mutex = Mutex::new(0);
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(mutex.state.load(Ordering::Relaxed), UNLOCKED);
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(());
        let _guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
    }
}
