//! Bounded single-producer multi-consumer ring, used by the "stealing
//! bounded-SPMC" run-queue variant: the owning worker is the sole producer,
//! other workers steal by CASing `head`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub(crate) struct BoundedSpmc<T> {
    buffer: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for BoundedSpmc<T> {}
unsafe impl<T: Send> Sync for BoundedSpmc<T> {}

impl<T> BoundedSpmc<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn len(&self, head: usize, tail: usize) -> usize {
        tail.wrapping_sub(head)
    }

    /// Only the owning worker may call this.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if self.len(head, tail) >= self.buffer.len() {
            return Err(value);
        }
        unsafe { *self.buffer[tail & self.mask].get() = Some(value) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Only the owning worker may call this.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            if self.len(head, tail) == 0 {
                return None;
            }
            let value = unsafe { (*self.buffer[head & self.mask].get()).take() };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return value;
            }
            // A thief won the race for this slot; put the value back
            // (nobody else can see it until `head` advances) and retry.
            unsafe { *self.buffer[head & self.mask].get() = value };
        }
    }

    /// Called by any other worker to steal up to `max` items from the
    /// front of this queue.
    pub fn steal(&self, max: usize) -> Vec<T> {
        let mut stolen = Vec::new();
        for _ in 0..max {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if self.len(head, tail) == 0 {
                break;
            }
            let value = unsafe { (*self.buffer[head & self.mask].get()).take() };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                if let Some(v) = value {
                    stolen.push(v);
                }
            } else {
                unsafe { *self.buffer[head & self.mask].get() = value };
            }
        }
        stolen
    }

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
    fn owner_push_pop_fifo() {
        let q: BoundedSpmc<i32> = BoundedSpmc::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn steal_takes_from_the_front() {
        let q: BoundedSpmc<i32> = BoundedSpmc::new(8);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        let stolen = q.steal(2);
        assert_eq!(stolen, vec![0, 1]);
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn concurrent_steal_and_pop_preserve_all_items() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(BoundedSpmc::new(1024));
        for i in 0..900 {
            q.push(i).unwrap();
        }

        let stealer_q = q.clone();
        let stealer = thread::spawn(move || {
            let mut got = Vec::new();
            while got.len() < 400 {
                got.extend(stealer_q.steal(16));
            }
            got
        });

        let mut local = Vec::new();
        while local.len() < 500 {
            if let Some(v) = q.pop() {
                local.push(v);
            }
        }

        let mut stolen = stealer.join().unwrap();
        stolen.truncate(400);
        local.truncate(500);
        let mut all = stolen;
        all.extend(local);
        all.sort_unstable();
        let expected: Vec<_> = (0..900).collect();
        assert_eq!(all, expected);
    }
}
