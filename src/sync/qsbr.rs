//! Quiescent-state-based reclamation for socket teardown (spec 4.4).
//!
//! Two generations of a deferred free list: entries pushed during the
//! current epoch go to `to_free1`, entries pushed after the epoch has
//! already rolled over once go to `to_free2`. Each worker periodically
//! calls [`quiescent`], declaring "I am not holding a pointer into any
//! epoll event array right now"; once every worker has done so since the
//! epoch last advanced, `to_free2` rotates into `to_free1` (starting a new
//! generation) and the old `to_free1` is handed back for physical free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// An object whose physical free must wait for every worker to pass through
/// a quiescent point. Boxed trait object so the reclaimer doesn't need to
/// know about [`crate::socket::Socket`] specifically.
pub(crate) type Reclaimable = Box<dyn Send>;

struct Generation {
    epoch: AtomicUsize,
    num_remaining: AtomicUsize,
    to_free1: Mutex<Vec<Reclaimable>>,
    to_free2: Mutex<Vec<Reclaimable>>,
}

/// Process-wide QSBR state, one instance per scheduler.
pub(crate) struct Qsbr {
    num_threads: usize,
    generation: Generation,
}

impl Qsbr {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            generation: Generation {
                epoch: AtomicUsize::new(0),
                num_remaining: AtomicUsize::new(0),
                to_free1: Mutex::new(Vec::new()),
                to_free2: Mutex::new(Vec::new()),
            },
        }
    }

    pub fn global_epoch(&self) -> usize {
        self.generation.epoch.load(Ordering::Acquire)
    }

    /// Defers `entry`'s physical free until every worker has been observed
    /// quiescent at least once since it was queued. With a single worker
    /// there is nobody else who could be holding a stale pointer, so the
    /// caller is expected to check that case itself and free immediately
    /// (spec 4.4's "special case").
    pub fn free(&self, entry: Reclaimable) {
        let mut gen1 = self.generation.to_free1.lock().unwrap();
        if gen1.is_empty() {
            // Starting a new generation: every *other* worker still owes a
            // quiescent-state observation before this batch may be freed.
            self.generation
                .num_remaining
                .store(self.num_threads.saturating_sub(1), Ordering::Release);
            self.generation.epoch.fetch_add(1, Ordering::AcqRel);
            gen1.push(entry);
        } else {
            drop(gen1);
            self.generation.to_free2.lock().unwrap().push(entry);
        }
    }

    /// Called by a worker to declare it holds no pointers into structures
    /// that might be concurrently reclaimed. `local_epoch` is the worker's
    /// last-observed epoch, passed by reference so the caller's cached copy
    /// is updated in place. Returns a batch of entries ready for physical
    /// free when this call is the one that drains the generation to zero.
    pub fn quiescent(&self, local_epoch: &mut usize) -> Vec<Reclaimable> {
        let global = self.global_epoch();
        if *local_epoch == global {
            return Vec::new();
        }
        *local_epoch = global;

        if self.generation.num_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Vec::new();
        }

        // We are the worker that drove `num_remaining` to zero: rotate
        // `to_free2` into `to_free1` (starting the next generation) and
        // hand back the old `to_free1` for physical free.
        let mut gen1 = self.generation.to_free1.lock().unwrap();
        let mut gen2 = self.generation.to_free2.lock().unwrap();
        let ready = std::mem::take(&mut *gen1);
        *gen1 = std::mem::take(&mut *gen2);
        if !gen1.is_empty() {
            self.generation
                .num_remaining
                .store(self.num_threads.saturating_sub(1), Ordering::Release);
            self.generation.epoch.fetch_add(1, Ordering::AcqRel);
        }
        ready
    }

    /// True when reclamation can bypass the generation protocol entirely
    /// because there is nobody else who could be racing the free.
    pub fn single_threaded(&self) -> bool {
        self.num_threads <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct Flag(Arc<AtomicBool>);
    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn single_threaded_bypass_is_flagged() {
        let qsbr = Qsbr::new(1);
        assert!(qsbr.single_threaded());
    }

    #[test]
    fn two_threads_needs_one_quiescent_pass_to_free() {
        let qsbr = Qsbr::new(2);
        let freed = Arc::new(AtomicBool::new(false));
        qsbr.free(Box::new(Flag(freed.clone())));
        assert!(!freed.load(Ordering::SeqCst));

        let mut local_epoch = 0;
        let batch = qsbr.quiescent(&mut local_epoch);
        assert_eq!(batch.len(), 1);
        drop(batch);
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn entries_freed_during_active_generation_wait_for_the_next_one() {
        let qsbr = Qsbr::new(3);
        let a = Arc::new(AtomicBool::new(false));
        let b = Arc::new(AtomicBool::new(false));
        qsbr.free(Box::new(Flag(a.clone())));
        qsbr.free(Box::new(Flag(b.clone())));

        let mut local = 0;
        assert!(qsbr.quiescent(&mut local).is_empty());
        let ready = qsbr.quiescent(&mut local);
        assert_eq!(ready.len(), 2);
    }
}
