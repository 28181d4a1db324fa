//! Outgoing frame queue.

use heapless::Deque;

use crate::frame::Frame;

/// Static bound on the configurable queue capacity
pub const MAX_QUEUE_CAPACITY: usize = 32;

/// Bounded FIFO of frames accepted from the upper layer and awaiting MAC
/// service. The head entry is the current transmission attempt; it is only
/// removed on acknowledgment, broadcast completion or retry exhaustion.
pub struct TxQueue {
    frames: Deque<Frame, MAX_QUEUE_CAPACITY>,
    capacity: usize,
}

impl TxQueue {
    /// Create a queue with the given capacity. The capacity has been
    /// validated against [`MAX_QUEUE_CAPACITY`] by config validation.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Deque::new(),
            capacity,
        }
    }

    /// Append a frame, handing it back untouched if the queue is full
    pub fn enqueue(&mut self, frame: Frame) -> Result<(), Frame> {
        if self.frames.len() >= self.capacity {
            return Err(frame);
        }

        self.frames.push_back(frame)
    }

    /// Current transmission attempt
    pub fn head(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Frame> {
        self.frames.front_mut()
    }

    /// Remove and return the current attempt, advancing the queue
    pub fn pop_head(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use crate::frame::Address;
    use super::*;

    fn frame(seq: u16) -> Frame {
        Frame::data(Address(1), Address(2), seq, Bytes::from_static(b"payload"))
    }

    #[test]
    fn enqueue_below_capacity_succeeds() {
        let mut q = TxQueue::new(2);

        assert!(q.enqueue(frame(1)).is_ok());
        assert!(q.enqueue(frame(2)).is_ok());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn enqueue_at_capacity_fails_without_mutation() {
        let mut q = TxQueue::new(2);
        q.enqueue(frame(1)).unwrap();
        q.enqueue(frame(2)).unwrap();

        let rejected = q.enqueue(frame(3)).unwrap_err();

        assert_eq!(rejected.sequence, 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.head().unwrap().sequence, 1);
    }

    #[test]
    fn head_advances_in_fifo_order() {
        let mut q = TxQueue::new(4);
        q.enqueue(frame(1)).unwrap();
        q.enqueue(frame(2)).unwrap();

        assert_eq!(q.pop_head().unwrap().sequence, 1);
        assert_eq!(q.head().unwrap().sequence, 2);
        assert_eq!(q.pop_head().unwrap().sequence, 2);
        assert!(q.pop_head().is_none());
        assert!(q.is_empty());
    }
}
