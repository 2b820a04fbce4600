//! Bounded FIFO of envelopes waiting for a live connection.

use std::collections::VecDeque;

use livechat_shared::Envelope;

use crate::error::SendError;

/// Outbound messages accepted while the connection is down.
///
/// When full, the newest message is rejected; nothing already accepted is
/// ever evicted, so delivery order of accepted messages is preserved.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, envelope: Envelope) -> Result<(), SendError> {
        if self.items.len() >= self.capacity {
            return Err(SendError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(envelope);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    /// Put back an envelope that was popped but could not be transmitted.
    pub(crate) fn restore_front(&mut self, envelope: Envelope) {
        self.items.push_front(envelope);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
