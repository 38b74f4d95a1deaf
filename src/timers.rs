//! Per-bucket timer set integrated with the poller (spec 4.9).
//!
//! A waiter with a deadline hashes to one of a fixed number of buckets.
//! Each bucket owns a binary min-heap (with lazy deletion — a cancelled
//! timer is flagged `removed` rather than removed from the heap in place)
//! protected by a short lock, plus a separately locked "shadow min" pointer
//! the poller may read without ever blocking on the bucket's main lock, and
//! one `timerfd` carrying exactly the bucket's next deadline.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fiber::FiberRef;
use crate::sync::os_lock::OsLock;
use crate::sync::waiter::{WakeReason, WakeResult, Waiter};

/// Fixed shard count the spec's default calls for.
pub(crate) const N_BUCKETS: usize = 64;

fn bucket_index(waiter: &Waiter) -> usize {
    let addr = waiter as *const Waiter as usize;
    // Fibonacci hashing: pointers are at least 8-byte aligned, so a plain
    // `% N_BUCKETS` would only ever see the low 3 bits vary.
    let mixed = addr.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 58) as usize % N_BUCKETS
}

struct TimerNode {
    abs_time: Instant,
    seq: u64,
    waiter: *const Waiter,
    removed: AtomicBool,
}

// Safety: `waiter` points into the stack of the fiber that registered this
// timer; it is only ever dereferenced while that fiber is still parked
// (guaranteed by the waiter handshake protocol — see module docs on
// `crate::sync::waiter`), and only from worker threads that this crate's
// scheduler already serializes through the bucket's lock or min lock.
unsafe impl Send for TimerNode {}
unsafe impl Sync for TimerNode {}

type NodeRef = Arc<TimerNode>;

struct HeapKey(NodeRef);

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.abs_time == other.0.abs_time && self.0.seq == other.0.seq
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.abs_time, self.0.seq).cmp(&(other.0.abs_time, other.0.seq))
    }
}

struct BucketInner {
    heap: BinaryHeap<Reverse<HeapKey>>,
    next_seq: u64,
}

struct Bucket {
    lock: OsLock,
    inner: std::cell::UnsafeCell<BucketInner>,
    min: Mutex<Option<NodeRef>>,
    fd: RawFd,
}

unsafe impl Sync for Bucket {}

fn zero_timespec() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as i64,
        tv_nsec: d.subsec_nanos() as i64,
    }
}

impl Bucket {
    fn new() -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            lock: OsLock::new(),
            inner: std::cell::UnsafeCell::new(BucketInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            min: Mutex::new(None),
            fd,
        })
    }

    fn rearm(&self, deadline: Option<Instant>) {
        let it_value = match deadline {
            None => zero_timespec(),
            Some(t) => {
                let now = Instant::now();
                let dur = if t > now {
                    t - now
                } else {
                    Duration::from_nanos(1)
                };
                duration_to_timespec(dur)
            }
        };
        let spec = libc::itimerspec {
            it_interval: zero_timespec(),
            it_value,
        };
        unsafe {
            libc::timerfd_settime(self.fd, 0, &spec, ptr::null_mut());
        }
    }

    /// Must be called with the bucket lock held. Drops any heap-top entries
    /// already marked `removed`, then publishes whatever remains on top (or
    /// `None`) as the new shadow min and reprograms the timerfd.
    fn publish_new_min_locked(&self, inner: &mut BucketInner) {
        while let Some(Reverse(top)) = inner.heap.peek() {
            if top.0.removed.load(Ordering::Acquire) {
                inner.heap.pop();
                continue;
            }
            break;
        }
        let new_min = inner.heap.peek().map(|Reverse(k)| k.0.clone());
        *self.min.lock().unwrap() = new_min.clone();
        self.rearm(new_min.as_ref().map(|n| n.abs_time));
    }

    fn add(&self, abs_time: Instant, waiter: *const Waiter) -> NodeRef {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let node = Arc::new(TimerNode {
            abs_time,
            seq,
            waiter,
            removed: AtomicBool::new(false),
        });
        inner.heap.push(Reverse(HeapKey(node.clone())));
        let became_min = matches!(
            inner.heap.peek(),
            Some(Reverse(HeapKey(top))) if Arc::ptr_eq(top, &node)
        );
        if became_min {
            self.publish_new_min_locked(inner);
        }
        node
    }

    /// Cancels a timer that is being abandoned for a reason other than
    /// firing (the owning wait was satisfied some other way). Returns
    /// whether the timer was still live (had not already fired).
    fn cancel(&self, node: &NodeRef) -> bool {
        let _guard = self.lock.lock();
        if node.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let inner = unsafe { &mut *self.inner.get() };
        let was_min = matches!(&*self.min.lock().unwrap(), Some(m) if Arc::ptr_eq(m, node));
        if was_min {
            self.publish_new_min_locked(inner);
        }
        true
    }

    /// Called by the reactor (never from a fiber) when this bucket's
    /// `timerfd` becomes readable: reads the shadow min under the min lock
    /// only — never the bucket lock, so this never blocks — and wakes
    /// exactly that one waiter with `TimedOutCheck` (spec 4.10).
    fn wake_min_for_poller(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        }
        let node = self.min.lock().unwrap().clone();
        if let Some(node) = node {
            let waiter = unsafe { &*node.waiter };
            if let WakeResult::SetAndWakeUp = waiter.wake(WakeReason::TimedOutCheck) {
                crate::worker::schedule_fiber(waiter.fiber().clone());
            }
        }
    }

    /// Called by the fiber that was woken with `TimedOutCheck`: expires
    /// every now-due timer in the bucket, waking their owners with
    /// `TimedOutNoCheck`, then republishes the new minimum. Returns the
    /// fibers that need pushing onto a run queue and whether `self_waiter`
    /// was among the ones expired here.
    fn process_expired(&self, now: Instant, self_waiter: *const Waiter) -> (Vec<FiberRef>, bool) {
        let _guard = self.lock.lock();
        // Clear the shadow min *before* scanning: otherwise a poller
        // running concurrently on another bucket event could still read
        // and dereference a node this loop is about to drop.
        *self.min.lock().unwrap() = None;

        let inner = unsafe { &mut *self.inner.get() };
        let mut woken = Vec::new();
        let mut self_expired = false;
        loop {
            let top_removed =
                matches!(inner.heap.peek(), Some(Reverse(HeapKey(top))) if top.removed.load(Ordering::Acquire));
            if top_removed {
                inner.heap.pop();
                continue;
            }
            let top_due =
                matches!(inner.heap.peek(), Some(Reverse(HeapKey(top))) if top.abs_time <= now);
            if !top_due {
                break;
            }
            let Reverse(HeapKey(node)) = inner.heap.pop().expect("checked Some above");
            node.removed.store(true, Ordering::Release);
            if node.waiter == self_waiter {
                self_expired = true;
            }
            let waiter = unsafe { &*node.waiter };
            if let WakeResult::SetAndWakeUp = waiter.wake(WakeReason::TimedOutNoCheck) {
                woken.push(waiter.fiber().clone());
            }
        }
        self.publish_new_min_locked(inner);
        (woken, self_expired)
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// The scheduler-wide timer set: `N_BUCKETS` independently locked shards.
pub(crate) struct Timers {
    buckets: Vec<Bucket>,
}

impl Timers {
    pub fn new() -> Self {
        let buckets = (0..N_BUCKETS)
            .map(|_| Bucket::new().unwrap_or_else(|e| crate::error::fatal(&format!("timerfd_create failed: {e}"))))
            .collect();
        Self { buckets }
    }

    pub(crate) fn bucket_fds(&self) -> impl Iterator<Item = (usize, RawFd)> + '_ {
        self.buckets.iter().enumerate().map(|(i, b)| (i, b.fd))
    }

    /// Dispatches a readiness event observed on bucket `idx`'s `timerfd`.
    /// Called only from the reactor, never from a fiber.
    pub(crate) fn on_bucket_fd_event(&self, idx: usize) {
        self.buckets[idx].wake_min_for_poller();
    }

    fn timed_wait_inner(&self, waiter: &Waiter, deadline: Instant) -> Result<()> {
        let bucket = &self.buckets[bucket_index(waiter)];
        let node = bucket.add(deadline, waiter as *const Waiter);

        loop {
            let waiter_ptr = waiter as *const Waiter as *mut c_void;
            let reason = crate::sync::waiter::park(
                waiter,
                || crate::worker::park_current_with_waiter(waiter_ptr),
                || crate::fiber::yield_now(),
            );
            match reason {
                WakeReason::Ready => {
                    bucket.cancel(&node);
                    return Ok(());
                }
                WakeReason::TimedOutNoCheck => {
                    // Already fully dequeued by a bucket processor.
                    return Err(Error::TimedOut);
                }
                WakeReason::TimedOutCheck => {
                    let now = Instant::now();
                    let (to_wake, self_expired) =
                        bucket.process_expired(now, waiter as *const Waiter);
                    for fiber in to_wake {
                        crate::worker::schedule_fiber(fiber);
                    }
                    if self_expired {
                        return Err(Error::TimedOut);
                    }
                    // Spurious: the bucket's single OS timeout fired for a
                    // sibling timer that shared the same granularity window;
                    // ours is still live in the heap. Reset and park again.
                    waiter.reset();
                }
                WakeReason::None => {
                    crate::error::fatal("waiter_wait returned WakeReason::None")
                }
            }
        }
    }
}

/// Parks the calling fiber until either `deadline` passes or some other
/// party wakes its waiter with `Ready` — the public entry point every timed
/// primitive in the crate funnels through (spec 4.9's `timed_wait`).
pub(crate) fn timed_wait(waiter: &Waiter, deadline: Instant) -> Result<()> {
    crate::worker::current_scheduler()
        .timers()
        .timed_wait_inner(waiter, deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_min_tracks_true_minimum_across_insert_and_cancel() {
        let bucket = Bucket::new().unwrap();
        let base = Instant::now();
        let w1 = crate::fiber::test_support::dummy_fiber_ref();
        let waiter1 = Waiter::new(w1);
        let w2 = crate::fiber::test_support::dummy_fiber_ref();
        let waiter2 = Waiter::new(w2);

        let n1 = bucket.add(base + Duration::from_secs(10), &waiter1 as *const _);
        assert!(Arc::ptr_eq(bucket.min.lock().unwrap().as_ref().unwrap(), &n1));

        let n2 = bucket.add(base + Duration::from_secs(5), &waiter2 as *const _);
        assert!(Arc::ptr_eq(bucket.min.lock().unwrap().as_ref().unwrap(), &n2));

        // Cancelling the current min restores n1 as the published min.
        assert!(bucket.cancel(&n2));
        assert!(Arc::ptr_eq(bucket.min.lock().unwrap().as_ref().unwrap(), &n1));

        // Cancelling an already-cancelled timer reports false.
        assert!(!bucket.cancel(&n2));
    }

    #[test]
    fn bucket_index_spreads_aligned_pointers() {
        // Regression guard: without the fibonacci mix, 8-byte aligned
        // pointers would all land in the same handful of buckets.
        let fiber = crate::fiber::test_support::dummy_fiber_ref();
        let waiters: Vec<Waiter> = (0..16).map(|_| Waiter::new(fiber.clone())).collect();
        let indices: std::collections::HashSet<usize> =
            waiters.iter().map(bucket_index).collect();
        assert!(indices.len() > 1, "expected hashed indices to spread out");
    }
}
