//! Ordered FIFO of parked fibers shared by mutex/condition/semaphore (spec
//! 4.7). An [`Ilock`] guards the list itself; each primitive supplies a
//! `recheck` predicate that runs *while the ilock is held*, so "is the
//! condition already satisfied" and "enqueue if not" happen atomically with
//! respect to a concurrent [`wake`].

use std::collections::VecDeque;
use std::os::raw::c_void;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::fiber::FiberRef;
use crate::sync::ilock::Ilock;
use crate::sync::waiter::{WakeReason, Waiter};

struct Node {
    waiter: Waiter,
}

/// A FIFO of parked fibers. The list itself lives behind an [`Ilock`]
/// rather than a plain mutex: contention here always comes from a fiber
/// (never a bare OS thread), so losing the lock should park the loser
/// instead of spinning it.
pub(crate) struct WaitersQueue {
    ilock: Ilock,
    nodes: std::cell::UnsafeCell<VecDeque<Arc<Node>>>,
}

// Safety: `nodes` is only ever touched while `ilock` is held.
unsafe impl Sync for WaitersQueue {}
unsafe impl Send for WaitersQueue {}

impl WaitersQueue {
    pub fn new() -> Self {
        Self {
            ilock: Ilock::new(),
            nodes: std::cell::UnsafeCell::new(VecDeque::new()),
        }
    }

    fn unlock_and_wake_handoff(&self) {
        if let Some(fiber) = self.ilock.unlock() {
            crate::worker::schedule_fiber(fiber);
        }
    }
}

/// Parks the calling fiber on `queue` unless `recheck()` (run under the
/// ilock) reports the condition is already satisfied, in which case this
/// returns immediately without parking — spec 4.7's "recheck returns false,
/// release the ilock and return without parking" path.
///
/// `deadline` selects between an untimed park ([`crate::sync::waiter::park`])
/// and a timed one ([`crate::timers::timed_wait`]).
pub(crate) fn wait(
    queue: &WaitersQueue,
    deadline: Option<Instant>,
    recheck: impl FnOnce() -> bool,
) -> Result<()> {
    queue.ilock.lock();
    if !recheck() {
        queue.unlock_and_wake_handoff();
        return Ok(());
    }

    let fiber: FiberRef = crate::fiber::this_fiber();
    let node = Arc::new(Node {
        waiter: Waiter::new(fiber),
    });
    unsafe { (*queue.nodes.get()).push_back(node.clone()) };
    queue.unlock_and_wake_handoff();

    let timed_out = match deadline {
        None => {
            let waiter_ptr = &node.waiter as *const Waiter as *mut c_void;
            let reason = crate::sync::waiter::park(
                &node.waiter,
                || crate::worker::park_current_with_waiter(waiter_ptr),
                || crate::fiber::yield_now(),
            );
            debug_assert_ne!(reason, WakeReason::None);
            false
        }
        Some(deadline) => match crate::timers::timed_wait(&node.waiter, deadline) {
            Ok(()) => false,
            Err(Error::TimedOut) => true,
            Err(e) => return Err(e),
        },
    };

    if !timed_out {
        return Ok(());
    }

    // Either genuinely timed out, or raced with a concurrent `wake` that
    // popped this node just as the deadline fired. Distinguish by whether
    // the node is still linked.
    queue.ilock.lock();
    let list = unsafe { &mut *queue.nodes.get() };
    let was_linked = if let Some(pos) = list.iter().position(|n| Arc::ptr_eq(n, &node)) {
        list.remove(pos);
        true
    } else {
        false
    };
    queue.unlock_and_wake_handoff();

    if was_linked {
        Err(Error::TimedOut)
    } else {
        Ok(())
    }
}

/// Wakes up to `max_waiters` fibers parked on `queue`, FIFO order. `callback`
/// runs while still holding the ilock, letting the caller (mutex/semaphore)
/// adjust its own state atomically with the wake — spec 4.7's "this is how
/// mutex/semaphore adjust their internal state coherently".
pub(crate) fn wake(queue: &WaitersQueue, max_waiters: usize, callback: impl FnOnce(usize, bool)) {
    queue.ilock.lock();
    let mut to_push = Vec::new();
    let mut num_woken = 0usize;
    {
        let list = unsafe { &mut *queue.nodes.get() };
        for _ in 0..max_waiters {
            let node = match list.pop_front() {
                Some(n) => n,
                None => break,
            };
            match node.waiter.wake(WakeReason::Ready) {
                crate::sync::waiter::WakeResult::SetAndWakeUp => {
                    to_push.push(node.waiter.fiber().clone());
                    num_woken += 1;
                }
                crate::sync::waiter::WakeResult::SetOnly => {
                    num_woken += 1;
                }
                crate::sync::waiter::WakeResult::Failed => {
                    // A timeout already claimed this waiter's reason; it is
                    // still correctly removed from the queue.
                }
            }
        }
    }
    let now_empty = unsafe { (*queue.nodes.get()).is_empty() };
    callback(num_woken, now_empty);
    queue.unlock_and_wake_handoff();

    for fiber in to_push {
        crate::worker::schedule_fiber(fiber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recheck_false_returns_without_enqueuing() {
        // A standalone queue with no fiber runtime active: recheck must run
        // and, if it returns false, `wait` must return before touching
        // `this_fiber()` (which would panic outside a scheduler).
        let queue = WaitersQueue::new();
        let result = wait(&queue, None, || false);
        assert!(result.is_ok());
        assert!(unsafe { (*queue.nodes.get()).is_empty() });
    }
}
