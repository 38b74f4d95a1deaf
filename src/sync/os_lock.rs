//! The short OS-level lock `ilock` uses to protect its waiter queue while
//! contended. Selected at compile time by the `os_lock_mutex` /
//! `os_lock_spin` Cargo features.

#[cfg(feature = "os_lock_mutex")]
mod imp {
    use std::sync::{Mutex, MutexGuard};

    pub(crate) struct OsLock(Mutex<()>);

    pub(crate) struct OsLockGuard<'a>(MutexGuard<'a, ()>);

    impl OsLock {
        pub fn new() -> Self {
            Self(Mutex::new(()))
        }

        pub fn lock(&self) -> OsLockGuard<'_> {
            OsLockGuard(self.0.lock().unwrap())
        }
    }
}

#[cfg(feature = "os_lock_spin")]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct OsLock(AtomicBool);

    pub(crate) struct OsLockGuard<'a>(&'a AtomicBool);

    impl OsLock {
        pub fn new() -> Self {
            Self(AtomicBool::new(false))
        }

        pub fn lock(&self) -> OsLockGuard<'_> {
            while self
                .0
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
            OsLockGuard(&self.0)
        }
    }

    impl Drop for OsLockGuard<'_> {
        fn drop(&mut self) {
            self.0.store(false, Ordering::Release);
        }
    }
}

pub(crate) use imp::{OsLock, OsLockGuard};
