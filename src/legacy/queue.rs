//! Word queue shared between composer client and server
//!
//! Stands in for the fast message queue the legacy protocol maps into both
//! processes. Clones share the same storage. Two queues are the same "shape"
//! only when they share storage, so a recreated queue must be re-registered
//! with the server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct MessageQueue {
    id: u64,
    capacity: usize,
    words: Arc<Mutex<VecDeque<u32>>>,
}

impl MessageQueue {
    /// Create a queue holding up to `capacity` words
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            words: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words waiting to be read
    pub fn available(&self) -> usize {
        self.words.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Append `data` atomically. Fails without writing anything when the
    /// queue lacks room.
    pub fn write(&self, data: &[u32]) -> bool {
        let mut words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        if words.len() + data.len() > self.capacity {
            return false;
        }
        words.extend(data.iter().copied());
        true
    }

    /// Remove exactly `count` words, or nothing if fewer are queued
    pub fn read(&self, count: usize) -> Option<Vec<u32>> {
        let mut words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        if words.len() < count {
            return None;
        }
        Some(words.drain(..count).collect())
    }
}

impl PartialEq for MessageQueue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_respects_capacity() {
        let q = MessageQueue::new(4);
        assert!(q.write(&[1, 2, 3]));
        assert!(!q.write(&[4, 5]));
        assert_eq!(q.available(), 3);
        assert_eq!(q.read(2), Some(vec![1, 2]));
        assert!(q.write(&[4, 5]));
        assert_eq!(q.read(4), None);
        assert_eq!(q.read(3), Some(vec![3, 4, 5]));
    }

    #[test]
    fn test_clones_share_storage() {
        let q = MessageQueue::new(8);
        let server_side = q.clone();
        assert!(q.write(&[7]));
        assert_eq!(server_side.read(1), Some(vec![7]));
        assert_eq!(q, server_side);
        assert_ne!(q, MessageQueue::new(8));
    }
}
