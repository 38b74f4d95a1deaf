//! Vyukov bounded MPMC queue: a power-of-two ring of `(sequence, data)`
//! cells, each cache-line padded so producers and consumers on different
//! cells never false-share.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Cell<T> {
    sequence: AtomicUsize,
    data: UnsafeCell<Option<T>>,
}

pub(crate) struct BoundedMpmc<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// Safety: access to `data` is gated by the sequence-number protocol below,
// exactly as in the original Vyukov queue.
unsafe impl<T: Send> Send for BoundedMpmc<T> {}
unsafe impl<T: Send> Sync for BoundedMpmc<T> {}

impl<T> BoundedMpmc<T> {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer: Box<[Cell<T>]> = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                data: UnsafeCell::new(None),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { *cell.data.get() = Some(value) };
                    cell.sequence.store(pos + 1, Ordering::Release);
                    return Ok(());
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;
            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*cell.data.get()).take() };
                    cell.sequence
                        .store(pos + self.mask + 1, Ordering::Release);
                    return value;
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Pushes a prefix of `values`, stopping at the first full cell.
    /// Returns the number actually pushed so the caller can spill the rest
    /// into the fallback queue, per spec 4.3's `push_stq` contract.
    pub fn push_stq(&self, values: &mut Vec<T>) -> usize {
        let mut pushed = 0;
        while let Some(v) = values.pop() {
            match self.push(v) {
                Ok(()) => pushed += 1,
                Err(v) => {
                    values.push(v);
                    break;
                }
            }
        }
        pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_capacity_to_power_of_two() {
        let q: BoundedMpmc<i32> = BoundedMpmc::new(5);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn fifo_and_full_detection() {
        let q: BoundedMpmc<i32> = BoundedMpmc::new(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn concurrent_mpmc_preserves_all_items() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(BoundedMpmc::new(1024));
        let mut producers = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                let mut i = 0;
                while i < 500 {
                    if q.push(t * 500 + i).is_ok() {
                        i += 1;
                    }
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 2000 {
            if let Some(v) = q.pop() {
                seen.push(v);
            }
        }
        seen.sort_unstable();
        let expected: Vec<_> = (0..2000).collect();
        assert_eq!(seen, expected);
    }
}
