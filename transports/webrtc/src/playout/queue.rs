//! Bounded drop-oldest frame queue
//!
//! Each (viewer, track) sender buffers normalized frames here until the
//! playout scheduler releases them. Producers never wait: when the queue is
//! full the oldest frame is evicted, trading completeness for freshness.

use bytes::Bytes;
use std::collections::VecDeque;

/// One normalized access unit waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedItem {
    /// Annex-B payload (shared between every viewer's copy)
    pub data: Bytes,
    /// Extended media-clock timestamp
    pub timestamp: u64,
    pub is_keyframe: bool,
}

/// Fixed-capacity FIFO that evicts its oldest entry on overflow
#[derive(Debug)]
pub struct FrameQueue {
    items: VecDeque<EncodedItem>,
    capacity: usize,
    evicted: u64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append an item, returning the evicted oldest item if the queue was full
    pub fn push(&mut self, item: EncodedItem) -> Option<EncodedItem> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn front(&self) -> Option<&EncodedItem> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<EncodedItem> {
        self.items.pop_front()
    }

    /// Drop everything still queued; returns how many items were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
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

    /// Total items evicted by overflow since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodedItem> {
        self.items.iter()
    }
}
