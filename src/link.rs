//! Link Transmit Queue
//!
//! The radio driver drains messages from a bounded byte queue in which every
//! message is stored as a one-byte length followed by its bytes.

use std::collections::VecDeque;

use crate::error::{Result, SchcError};
use crate::fragmentation::MAX_LORAWAN_PKT_LEN;

pub const DEFAULT_QUEUE_CAPACITY: usize = 2048;

/// Sink for messages ready to go over the air
pub trait LinkQueue {
    /// Queue one message; fails without queuing anything when it does not fit
    fn push(&mut self, message: &[u8]) -> Result<()>;

    /// Bytes still available, framing included
    fn free_space(&self) -> usize;
}

/// In-memory `[len u8][bytes]` queue with a fixed byte capacity
#[derive(Debug, Clone)]
pub struct LengthPrefixedQueue {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl Default for LengthPrefixedQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl LengthPrefixedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes in use, length prefixes included
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove the oldest message
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        let len = self.bytes.pop_front()? as usize;
        Some(self.bytes.drain(..len.min(self.bytes.len())).collect())
    }

    /// Remove every queued message, oldest first
    pub fn drain_messages(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.pop_message()).collect()
    }
}

impl LinkQueue for LengthPrefixedQueue {
    fn push(&mut self, message: &[u8]) -> Result<()> {
        if message.is_empty() || message.len() > MAX_LORAWAN_PKT_LEN {
            return Err(SchcError::MalformedInput(format!(
                "message of {} bytes cannot be sent in one LoRaWAN frame",
                message.len()
            )));
        }
        let needed = message.len() + 1;
        if self.bytes.len() + needed > self.capacity {
            return Err(SchcError::ResourceExhausted(format!(
                "transmit queue full: {} of {} bytes used, {} needed",
                self.bytes.len(),
                self.capacity,
                needed
            )));
        }
        self.bytes.push_back(message.len() as u8);
        self.bytes.extend(message);
        Ok(())
    }

    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.bytes.len())
    }
}
