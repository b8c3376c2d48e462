//! Bounded hand-off queue between protocol engines.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Queue connecting an enqueueing engine to a dequeueing engine thread.
///
/// `pop` blocks with a timeout so the consumer can observe its stop flag at a
/// bounded latency. When the queue is full new work is dropped, never old:
/// established flows keep making progress under overload.
pub struct PktQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> PktQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item. Returns false (dropping the item) when full.
    pub fn push(&self, item: T) -> bool {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return false;
        }
        q.push_back(item);
        self.cond.notify_one();
        true
    }

    /// Dequeue one item, waiting up to `timeout`. Ownership transfers to the
    /// caller.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut q = self.inner.lock();
        if q.is_empty() {
            self.cond.wait_for(&mut q, timeout);
        }
        q.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_order() {
        let q = PktQueue::new(4);
        assert!(q.push(1));
        assert!(q.push(2));
        assert_eq!(q.pop(Duration::from_millis(1)), Some(1));
        assert_eq!(q.pop(Duration::from_millis(1)), Some(2));
        assert_eq!(q.pop(Duration::from_millis(1)), None);
    }

    #[test]
    fn full_queue_drops_new_work() {
        let q = PktQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.pop(Duration::from_millis(1)), Some(1));
    }
}
