//! Plain mutex-protected FIFO. Backs the `shared_mutex`/`stealing_mutex`
//! run-queue variants directly, and backs the fallback overflow list used
//! by every bounded variant.

use std::collections::VecDeque;
use std::sync::Mutex;

pub(crate) struct MutexQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> MutexQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().unwrap().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes every item in `values`, returning the count (always all of
    /// them — the mutex-backed queue has no capacity limit). Present for
    /// API parity with the bounded variants' `push_stq`.
    pub fn push_stq(&self, values: &mut Vec<T>) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let n = values.len();
        guard.extend(values.drain(..));
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q: MutexQueue<i32> = MutexQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }
}
