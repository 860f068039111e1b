//! Bounded cache of serialized virtual blocks.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Maximum number of virtual blocks kept by a serving replica.
pub const MAX_CACHED_VBLOCKS: usize = 28;

/// Identifies a virtual block: the pair of the serving checkpoint and the
/// requester's last known checkpoint. Ordering is lexicographic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VBlockKey {
    /// The checkpoint the virtual block was materialized for.
    pub checkpoint: u64,
    /// The requester's last known checkpoint.
    pub requester_checkpoint: u64,
}

/// Cache of materialized virtual blocks.
///
/// Building a virtual block walks every reserved page, so a serving replica keeps
/// recent ones around: laggards with the same frontier ask for identical bundles.
/// On overflow the entry with the oldest checkpoint is evicted first (it is the
/// least likely to be requested again).
pub struct VBlockCache {
    entries: BTreeMap<VBlockKey, Bytes>,
    capacity: usize,
}

impl VBlockCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &VBlockKey) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    pub fn put(&mut self, key: VBlockKey, vblock: Bytes) {
        self.entries.insert(key, vblock);
        while self.entries.len() > self.capacity {
            self.entries.pop_first();
        }
    }

    /// Drops every entry for a checkpoint below `min` (called on checkpoint pruning).
    pub fn prune(&mut self, min: u64) {
        self.entries.retain(|key, _| key.checkpoint >= min);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(checkpoint: u64, requester: u64) -> VBlockKey {
        VBlockKey {
            checkpoint,
            requester_checkpoint: requester,
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_checkpoint() {
        let mut cache = VBlockCache::new(2);
        cache.put(key(5, 1), Bytes::from_static(b"a"));
        cache.put(key(3, 2), Bytes::from_static(b"b"));
        cache.put(key(4, 0), Bytes::from_static(b"c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(3, 2)).is_none());
        assert!(cache.get(&key(4, 0)).is_some());
        assert!(cache.get(&key(5, 1)).is_some());
    }

    #[test]
    fn test_secondary_key_breaks_ties() {
        let mut cache = VBlockCache::new(2);
        cache.put(key(5, 2), Bytes::from_static(b"a"));
        cache.put(key(5, 1), Bytes::from_static(b"b"));
        cache.put(key(5, 3), Bytes::from_static(b"c"));
        assert!(cache.get(&key(5, 1)).is_none());
        assert!(cache.get(&key(5, 2)).is_some());
        assert!(cache.get(&key(5, 3)).is_some());
    }

    #[test]
    fn test_prune() {
        let mut cache = VBlockCache::new(8);
        cache.put(key(3, 1), Bytes::from_static(b"a"));
        cache.put(key(4, 1), Bytes::from_static(b"b"));
        cache.put(key(5, 1), Bytes::from_static(b"c"));
        cache.prune(4);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(3, 1)).is_none());
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut cache = VBlockCache::new(MAX_CACHED_VBLOCKS);
        for checkpoint in 0..100u64 {
            cache.put(key(checkpoint, checkpoint % 7), Bytes::from_static(b"x"));
            assert!(cache.len() <= MAX_CACHED_VBLOCKS);
        }
    }
}
