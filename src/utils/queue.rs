//! # Queues
//!
//! [`Queue`] is a plain growable ring used by a single owner.
//! [`ThreadQueue`] wraps one behind a lock for handing work from any number of
//! producer threads to one consumer thread, with close and blocking semantics.
//!
//! The consumer usually takes everything in one go with
//! [`ThreadQueue::flush_into`], so the lock is held once per batch rather than
//! once per item.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Growable circular FIFO queue.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Move every item to the back of `dst`, preserving order.
    pub fn flush_into(&mut self, dst: &mut Queue<T>) {
        dst.items.append(&mut self.items);
    }

    /// Remove every item.
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.items.drain(..)
    }
}

struct Shared<T> {
    queue: Queue<T>,
    closed: bool,
}

/// Thread-safe queue with close semantics.
pub struct ThreadQueue<T> {
    shared: Mutex<Shared<T>>,
    cond: Condvar,
}

impl<T> Default for ThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                queue: Queue::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Add an item. A closed queue hands the item back.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(item);
        }
        shared.queue.enqueue(item);
        drop(shared);
        self.cond.notify_one();
        Ok(())
    }

    /// Take one item, waiting up to `timeout` for it.
    ///
    /// Returns `None` on timeout, or once the queue is closed and empty.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let mut shared = self.shared.lock();
        if shared.queue.is_empty() && !shared.closed {
            self.cond.wait_for(&mut shared, timeout);
        }
        shared.queue.dequeue()
    }

    /// Move everything queued so far into `dst`.
    pub fn flush_into(&self, dst: &mut Queue<T>) {
        self.shared.lock().queue.flush_into(dst);
    }

    /// Refuse further items; what is already queued stays available.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
