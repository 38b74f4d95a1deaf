//! Michael-Scott unbounded lock-free MPMC queue.
//!
//! Nodes are drawn from and returned to a [`NodePool`] rather than the
//! global allocator on every push/pop, per spec 4.3's "Node pools" design
//! note: the pool is not an optimization layered on top, it is how this
//! queue variant is specified.

use std::sync::atomic::Ordering;

use super::node_pool::{LocalNodeCache, NodePool};
use super::tagged::TaggedAtomicPtr;

pub(crate) struct Node<T> {
    value: Option<T>,
    next: TaggedAtomicPtr<Node<T>>,
}

/// Per-thread node cache for a [`MsQueue<T>`]; opaque alias so callers don't
/// need to name [`Node`] themselves.
pub(crate) type Cache<T> = LocalNodeCache<Node<T>>;

pub(crate) fn new_cache<T>() -> Cache<T> {
    LocalNodeCache::new()
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            value: None,
            next: TaggedAtomicPtr::null(),
        }
    }
}

pub(crate) struct MsQueue<T> {
    head: TaggedAtomicPtr<Node<T>>,
    tail: TaggedAtomicPtr<Node<T>>,
    pool: NodePool<Node<T>>,
}

// A queue always holds at least the dummy node, allocated from the pool at
// construction time and never released back to it.
impl<T> MsQueue<T> {
    pub fn new() -> Self {
        let pool = NodePool::new();
        let dummy = Box::into_raw(pool.acquire());
        Self {
            head: TaggedAtomicPtr::new(dummy, 0),
            tail: TaggedAtomicPtr::new(dummy, 0),
            pool,
        }
    }

    fn new_node(&self, cache: &LocalNodeCache<Node<T>>, value: T) -> *mut Node<T> {
        let mut node = cache.acquire(&self.pool);
        node.value = Some(value);
        node.next = TaggedAtomicPtr::null();
        Box::into_raw(node)
    }

    pub fn push(&self, cache: &LocalNodeCache<Node<T>>, value: T) {
        let node = self.new_node(cache, value);
        loop {
            let (tail, tail_tag) = self.tail.load(Ordering::Acquire);
            let (next, next_tag) = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                if unsafe { (*tail).next.compare_exchange_weak(
                    (next, next_tag),
                    (node, next_tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                ) }
                .is_ok()
                {
                    let _ = self.tail.compare_exchange_weak(
                        (tail, tail_tag),
                        (node, tail_tag.wrapping_add(1)),
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                let _ = self.tail.compare_exchange_weak(
                    (tail, tail_tag),
                    (next, tail_tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Pushes as many of `values` as the queue accepts (always all of them,
    /// since this queue is unbounded), returning the number pushed. Present
    /// for API parity with the bounded variants' `push_stq`.
    pub fn push_stq(&self, cache: &LocalNodeCache<Node<T>>, values: Vec<T>) -> usize {
        let n = values.len();
        for v in values {
            self.push(cache, v);
        }
        n
    }

    pub fn pop(&self, cache: &LocalNodeCache<Node<T>>) -> Option<T> {
        loop {
            let (head, head_tag) = self.head.load(Ordering::Acquire);
            let (tail, tail_tag) = self.tail.load(Ordering::Acquire);
            let (next, next_tag) = unsafe { (*head).next.load(Ordering::Acquire) };
            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail has fallen behind; help it along.
                let _ = self.tail.compare_exchange_weak(
                    (tail, tail_tag),
                    (next, tail_tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }
            let value = unsafe { (*next).value.take() };
            if self
                .head
                .compare_exchange_weak(
                    (head, head_tag),
                    (next, next_tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let old_head = unsafe { Box::from_raw(head) };
                cache.release(&self.pool, old_head);
                return value;
            }
            // Lost the race; put the value we took back so the winner sees it.
            unsafe { (*next).value = value };
        }
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        let (mut cur, _) = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            let (next, _) = node.next.load(Ordering::Relaxed);
            drop(node);
            cur = next;
        }
    }
}

unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_single_threaded() {
        let q: MsQueue<i32> = MsQueue::new();
        let cache = LocalNodeCache::new();
        q.push(&cache, 1);
        q.push(&cache, 2);
        q.push(&cache, 3);
        assert_eq!(q.pop(&cache), Some(1));
        assert_eq!(q.pop(&cache), Some(2));
        assert_eq!(q.pop(&cache), Some(3));
        assert_eq!(q.pop(&cache), None);
    }

    #[test]
    fn push_stq_reports_count() {
        let q: MsQueue<i32> = MsQueue::new();
        let cache = LocalNodeCache::new();
        let n = q.push_stq(&cache, vec![1, 2, 3, 4]);
        assert_eq!(n, 4);
    }

    #[test]
    fn concurrent_producers_consumers_preserve_all_items() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(MsQueue::new());
        let mut producers = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                let cache = LocalNodeCache::new();
                for i in 0..2000 {
                    q.push(&cache, t * 2000 + i);
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        let cache = LocalNodeCache::new();
        let mut seen = Vec::new();
        while let Some(v) = q.pop(&cache) {
            seen.push(v);
        }
        seen.sort_unstable();
        let expected: Vec<_> = (0..8000).collect();
        assert_eq!(seen, expected);
    }
}
