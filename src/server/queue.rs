//! Blocking FIFO shared by connection readers and worker threads

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer multi-consumer queue with blocking pop
///
/// Producers are async connection readers, which only ever take the mutex
/// briefly. Consumers are worker OS threads parked on the condition
/// variable until an item arrives or the queue is closed.
#[derive(Debug)]
pub struct RequestQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestQueue<T> {
    /// Creates an empty, open queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends an item and wakes one waiting consumer
    ///
    /// # Errors
    ///
    /// Returns the item back when the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Takes the oldest item, blocking while the queue is open and empty
    ///
    /// Items queued before [`RequestQueue::close`] are still handed out;
    /// `None` means the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Rejects further pushes and wakes every consumer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Whether [`RequestQueue::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no items are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = RequestQueue::new();
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = RequestQueue::new();
        queue.push("queued").unwrap();
        queue.close();

        assert_eq!(queue.push("late"), Err("late"));
        assert_eq!(queue.pop(), Some("queued"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(RequestQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());
        queue.push(42).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_close_wakes_every_consumer() {
        let queue: Arc<RequestQueue<u32>> = Arc::new(RequestQueue::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
        assert!(queue.is_closed());
    }
}
