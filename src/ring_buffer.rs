//! Per-host bounded response store
//!
//! A fixed number of slots is reused in strict insertion order: when the buffer
//! is full the oldest slot is overwritten. Reads never refresh an entry's
//! position, so this is FIFO and not LRU.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::response::CachedResponse;

/// What a [`RingBuffer::put`] did to the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// A free slot was used
    Inserted,
    /// The path already had a slot and it was overwritten in place
    Replaced,
    /// The oldest slot was reused; carries the path that lost its entry
    Evicted(String),
}

#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    size: usize,
    /// Oldest live slot
    start: usize,
    slots: Vec<Option<CachedResponse>>,
    path_to_index: HashMap<String, usize>,
    index_to_path: Vec<Option<String>>,
}

impl RingBuffer {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        Self {
            capacity,
            size: 0,
            start: 0,
            slots: vec![None; capacity],
            path_to_index: HashMap::with_capacity(capacity),
            index_to_path: vec![None; capacity],
        }
    }

    /// Look up a path. The returned response is an independent copy.
    pub fn get(&self, path: &str) -> Option<CachedResponse> {
        let index = *self.path_to_index.get(path)?;
        self.slots[index].clone()
    }

    pub fn put(&mut self, path: &str, response: CachedResponse) -> PutOutcome {
        if let Some(&index) = self.path_to_index.get(path) {
            self.slots[index] = Some(response);
            return PutOutcome::Replaced;
        }

        let (index, outcome) = if self.size == self.capacity {
            let index = self.start;
            // A full buffer has a path recorded for every slot
            let evicted = self.index_to_path[index].take().unwrap_or_default();
            self.path_to_index.remove(&evicted);
            self.start = (self.start + 1) % self.capacity;
            (index, PutOutcome::Evicted(evicted))
        } else {
            let index = (self.start + self.size) % self.capacity;
            self.size += 1;
            (index, PutOutcome::Inserted)
        };

        self.slots[index] = Some(response);
        self.path_to_index.insert(path.to_string(), index);
        self.index_to_path[index] = Some(path.to_string());
        outcome
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live paths, oldest first
    pub fn paths(&self) -> Vec<String> {
        (0..self.size)
            .filter_map(|offset| {
                let index = (self.start + offset) % self.capacity;
                self.index_to_path[index].clone()
            })
            .collect()
    }

    /// Check that the forward and reverse indexes describe the same live slots.
    pub fn is_consistent(&self) -> bool {
        if self.path_to_index.len() != self.size || self.size > self.capacity {
            return false;
        }

        let forward_ok = self.path_to_index.iter().all(|(path, &index)| {
            index < self.capacity
                && self.index_to_path[index].as_deref() == Some(path.as_str())
                && self.slots[index].is_some()
        });

        let reverse_ok = self
            .index_to_path
            .iter()
            .enumerate()
            .filter_map(|(index, path)| path.as_ref().map(|p| (index, p)))
            .all(|(index, path)| self.path_to_index.get(path) == Some(&index));

        let live_ok = (0..self.size).all(|offset| {
            let index = (self.start + offset) % self.capacity;
            self.index_to_path[index].is_some()
        });

        forward_ok && reverse_ok && live_ok
    }
}
