//! Bounded intake queue between event delivery and dispatch.

use crate::error::{Result, SubscriberError};
use crate::types::SubscribedEvent;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// Bounded FIFO of events awaiting dispatch.
///
/// `add` blocks while the queue is full, which is the back-pressure applied to
/// the event source's delivery thread. `take` blocks while the queue is empty
/// and returns `None` once the queue has been closed and drained.
///
/// Clones share the same underlying queue.
#[derive(Clone)]
pub struct IntakeQueue {
    /// Producer side. `None` once closed.
    sender: Arc<Mutex<Option<Sender<SubscribedEvent>>>>,
    receiver: Receiver<SubscribedEvent>,
    capacity: usize,
}

impl IntakeQueue {
    /// Create a queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
            capacity,
        }
    }

    /// Enqueue an event, blocking while the queue is full.
    pub fn add(&self, event: SubscribedEvent) -> Result<()> {
        // Clone the sender so a blocked producer never holds the lock `close` needs.
        let sender = self
            .sender
            .lock()
            .as_ref()
            .cloned()
            .ok_or(SubscriberError::QueueClosed)?;
        sender
            .send(event)
            .map_err(|_| SubscriberError::QueueClosed)
    }

    /// Dequeue the next event, blocking while the queue is empty.
    ///
    /// Returns `None` when the queue is closed and every event has been taken.
    pub fn take(&self) -> Option<SubscribedEvent> {
        self.receiver.recv().ok()
    }

    /// Stop accepting events. Already queued events can still be taken.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamPosition;
    use std::thread;
    use std::time::Duration;

    fn event(position: u64) -> SubscribedEvent {
        SubscribedEvent::new(StreamPosition(position), "test", vec![], "stream")
    }

    #[test]
    fn test_fifo_order() {
        let queue = IntakeQueue::new(8);
        for i in 0..5 {
            queue.add(event(i)).unwrap();
        }
        assert_eq!(queue.len(), 5);

        let taken: Vec<u64> = (0..5).map(|_| queue.take().unwrap().position.0).collect();
        assert_eq!(taken, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = IntakeQueue::new(4);
        queue.add(event(1)).unwrap();
        queue.add(event(2)).unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert!(matches!(queue.add(event(3)), Err(SubscriberError::QueueClosed)));
        assert_eq!(queue.take().unwrap().position, StreamPosition(1));
        assert_eq!(queue.take().unwrap().position, StreamPosition(2));
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_add_blocks_when_full() {
        let queue = IntakeQueue::new(2);
        queue.add(event(0)).unwrap();
        queue.add(event(1)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.add(event(2)))
        };

        // The producer cannot finish until something is taken.
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take().unwrap().position, StreamPosition(0));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.take().unwrap().position, StreamPosition(1));
        assert_eq!(queue.take().unwrap().position, StreamPosition(2));
    }

    #[test]
    fn test_take_wakes_on_close() {
        let queue = IntakeQueue::new(2);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_zero_capacity_holds_one_event() {
        let queue = IntakeQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.add(event(0)).unwrap();
        assert_eq!(queue.len(), 1);
    }
}
