//! Blocking frame queue.
//!
//! Bridges the async network loop (producer) and the synchronous
//! emulator callback (consumer): a FIFO behind a mutex and condition
//! variable with a latched interrupt state. Once interrupted, pushes and
//! pops fail with the stored reason; the interrupt wins even over queued
//! elements so a dead connection unblocks the emulator immediately.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// The latched failure a queue reports after [`BlockingQueue::interrupt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupted(pub String);

struct Inner<T> {
    queue: VecDeque<T>,
    interrupt: Option<Interrupted>,
}

pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                interrupt: None,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, element: T) -> Result<(), Interrupted> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.interrupt {
            return Err(reason.clone());
        }
        inner.queue.push_back(element);
        self.ready.notify_one();
        Ok(())
    }

    /// Wait until an element or the interrupt reason is available.
    pub fn pop(&self) -> Result<T, Interrupted> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(reason) = &inner.interrupt {
                return Err(reason.clone());
            }
            if let Some(element) = inner.queue.pop_front() {
                return Ok(element);
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Latch the interrupt state; the first reason wins.
    pub fn interrupt(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.interrupt.is_none() {
            inner.interrupt = Some(Interrupted(reason.to_string()));
            self.ready.notify_all();
        }
    }

    /// Clear elements and the interrupt latch, for a fresh connection.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.interrupt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn elements_come_out_in_order() {
        let queue = BlockingQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.pop(), Ok(1));
        assert_eq!(queue.pop(), Ok(2));
    }

    #[test]
    fn interrupt_wins_over_queued_elements() {
        let queue = BlockingQueue::new();
        queue.push(1).unwrap();
        queue.interrupt("gone");
        assert_eq!(queue.pop(), Err(Interrupted("gone".into())));
        assert_eq!(queue.push(2), Err(Interrupted("gone".into())));
    }

    #[test]
    fn first_interrupt_reason_is_latched() {
        let queue: BlockingQueue<u32> = BlockingQueue::new();
        queue.interrupt("first");
        queue.interrupt("second");
        assert_eq!(queue.pop(), Err(Interrupted("first".into())));
    }

    #[test]
    fn pop_blocks_until_a_producer_arrives() {
        let queue = Arc::new(BlockingQueue::new());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || queue.pop());
        std::thread::sleep(Duration::from_millis(50));
        producer.push(7u32).unwrap();
        assert_eq!(handle.join().expect("no panic"), Ok(7));
    }

    #[test]
    fn interrupt_unblocks_a_waiting_consumer() {
        let queue: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new());
        let interrupter = queue.clone();
        let handle = std::thread::spawn(move || queue.pop());
        std::thread::sleep(Duration::from_millis(50));
        interrupter.interrupt("closed");
        assert_eq!(handle.join().expect("no panic"), Err(Interrupted("closed".into())));
    }

    #[test]
    fn reset_clears_the_latch() {
        let queue = BlockingQueue::new();
        queue.interrupt("gone");
        queue.reset();
        queue.push(3).unwrap();
        assert_eq!(queue.pop(), Ok(3));
    }
}
