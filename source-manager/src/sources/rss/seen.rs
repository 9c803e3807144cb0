use std::collections::{HashSet, VecDeque};

/// Most identifiers a feed source remembers.
pub const SEEN_CAPACITY: usize = 10_000;

/// Bounded set of item identifiers; evicts the oldest insert when full.
#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::with_capacity(SEEN_CAPACITY)
    }
}

impl SeenSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Records `key`; returns true if it was not already present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }
}
