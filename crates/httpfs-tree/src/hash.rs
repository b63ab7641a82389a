//! Open-addressed path index.
//!
//! Buckets are sized at build time to ~1.9x the expected entry count so
//! the load factor stays under 53% and a probe always terminates at an
//! empty slot. Keys are hashed and compared on one normalized form: the
//! full path including the leading '/'.

use crate::{Node, NodeId, Result, TreeError};

/// Position-weighted character sum. Weights cycle through successive
/// powers of 17 starting from the last character, resetting every 7
/// characters.
pub(crate) fn path_hash(key: &str) -> u32 {
    let mut val: u32 = 0;
    let mut weight: u32 = 1;
    let mut j = 1;
    for &b in key.as_bytes().iter().rev() {
        val = val.wrapping_add((b as u32).wrapping_mul(weight));
        if j >= 7 {
            weight = 1;
            j = 1;
        } else {
            weight = weight.wrapping_mul(17);
            j += 1;
        }
    }
    val
}

#[derive(Debug)]
pub(crate) struct PathIndex {
    buckets: Vec<Option<NodeId>>,
    entries: usize,
}

impl PathIndex {
    /// Size for an expected entry count. The document's entry-count hint
    /// feeds this; 1.9x keeps linear probing short.
    pub(crate) fn with_expected(expected: usize) -> PathIndex {
        let capacity = (expected + expected * 9 / 10).max(16);
        PathIndex {
            buckets: vec![None; capacity],
            entries: 0,
        }
    }

    pub(crate) fn insert(&mut self, path: &str, id: NodeId) -> Result<()> {
        let capacity = self.buckets.len();
        // At least one slot must stay empty so every probe terminates.
        // The sizing rule makes this unreachable for documents with an
        // honest hint; a dishonest one fails the build here instead of
        // leaving behind a table that cannot answer misses.
        if self.entries + 1 >= capacity {
            return Err(TreeError::IndexFull {
                capacity,
                entries: self.entries,
            });
        }
        let mut bucket = path_hash(path) as usize % capacity;
        while self.buckets[bucket].is_some() {
            bucket = (bucket + 1) % capacity;
        }
        self.buckets[bucket] = Some(id);
        self.entries += 1;
        Ok(())
    }

    pub(crate) fn lookup(&self, path: &str, nodes: &[Node]) -> Option<NodeId> {
        let capacity = self.buckets.len();
        let mut bucket = path_hash(path) as usize % capacity;
        // insert keeps an empty slot around, so the scan terminates.
        while let Some(id) = self.buckets[bucket] {
            if nodes[id.index()].full_path == path {
                return Some(id);
            }
            bucket = (bucket + 1) % capacity;
        }
        None
    }
}
