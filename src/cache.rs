//! Known-object cache
//!
//! In-memory record of versioned hashes already confirmed present in object
//! storage, so repeat references to the same commitment skip the existence
//! check.
//!
//! Strategy:
//! - Objects are content-addressed and never deleted, so a confirmed key stays cached
//! - The cache is bounded; when full it is cleared and refilled from existence checks

use alloy_primitives::B256;
use std::collections::HashSet;

/// Default number of hashes retained.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// Versioned hashes known to be stored.
pub struct KnownBlobCache {
    known: HashSet<B256>,
    capacity: usize,
}

impl KnownBlobCache {
    /// Create a new empty cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            known: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Whether `hash` is known to be stored.
    pub fn contains(&self, hash: &B256) -> bool {
        self.known.contains(hash)
    }

    /// Mark `hash` as stored.
    pub fn insert(&mut self, hash: B256) {
        if self.known.len() >= self.capacity && !self.known.contains(&hash) {
            self.known.clear();
        }
        self.known.insert(hash);
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

impl Default for KnownBlobCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
