//! Bounded de-duplication cache.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Fixed-capacity set that forgets its oldest entry when full.
///
/// Insertion order lives in a ring buffer next to the membership set, so
/// eviction is O(1) regardless of capacity.
#[derive(Debug)]
pub struct SeenCache<K> {
    capacity: usize,
    order: VecDeque<K>,
    members: HashSet<K>,
}

impl<K: Eq + Hash + Clone> SeenCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Remember `key`. Returns false if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.members.insert(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
