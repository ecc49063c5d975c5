use std::collections::{BTreeMap, BTreeSet};
use xxhash_rust::xxh64::xxh64;

/// Consistent hash ring with virtual nodes.
///
/// Every node id is placed at `virtual_nodes` positions, each the XXH64 of
/// `"{id}#{i}"`. A key belongs to the first position at or after its own hash,
/// wrapping around the end of the ring.
///
/// Lookups depend only on the member set: two rings with the same ids answer
/// identically no matter the order the ids were added or removed in.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    positions: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            positions: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Build a ring from a set of ids.
    pub fn with_nodes<I, S>(virtual_nodes: usize, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new(virtual_nodes);
        for id in ids {
            ring.add_node(id);
        }
        ring
    }

    /// Place a node on the ring. Adding a member again does nothing.
    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.nodes.contains(&id) {
            return;
        }
        self.place(&id);
        self.nodes.insert(id);
    }

    /// Take a node off the ring. Returns false if it was not a member.
    pub fn remove_node(&mut self, id: &str) -> bool {
        if !self.nodes.remove(id) {
            return false;
        }
        // A removed id may have lost collisions that now belong to another
        // member, so rebuild from the survivors.
        self.positions.clear();
        let ids: Vec<String> = self.nodes.iter().cloned().collect();
        for id in &ids {
            self.place(id);
        }
        true
    }

    fn place(&mut self, id: &str) {
        for i in 0..self.virtual_nodes {
            let position = xxh64(format!("{}#{}", id, i).as_bytes(), 0);
            self.positions
                .entry(position)
                .and_modify(|holder| {
                    if id < holder.as_str() {
                        *holder = id.to_string();
                    }
                })
                .or_insert_with(|| id.to_string());
        }
    }

    /// Id of the node that owns `key`, or `None` for an empty ring.
    pub fn lookup(&self, key: &[u8]) -> Option<&str> {
        let hash = xxh64(key, 0);
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, id)| id.as_str())
    }

    /// Member ids in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DEFAULT_VIRTUAL_NODES;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{}", i)).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        assert!(ring.is_empty());
        assert_eq!(ring.lookup(b"anything"), None);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["a"]);
        for key in keys(100) {
            assert_eq!(ring.lookup(key.as_bytes()), Some("a"));
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring1 = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["A", "B", "C"]);
        let ring2 = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["C", "A", "B"]);

        let owner = ring1.lookup(b"user:42");
        assert!(owner.is_some());
        for _ in 0..10 {
            assert_eq!(ring1.lookup(b"user:42"), owner);
        }
        for key in keys(1000) {
            assert_eq!(ring1.lookup(key.as_bytes()), ring2.lookup(key.as_bytes()));
        }
    }

    #[test]
    fn test_incremental_equals_full_rebuild() {
        let mut ring1 = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["A", "B"]);
        ring1.add_node("C");
        assert!(ring1.remove_node("B"));
        assert!(!ring1.remove_node("B"));
        ring1.add_node("A");

        let ring2 = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["A", "C"]);
        assert_eq!(ring1.nodes().collect::<Vec<_>>(), vec!["A", "C"]);
        for key in keys(1000) {
            assert_eq!(
                ring1.lookup(key.as_bytes()),
                ring2.lookup(key.as_bytes()),
                "Key {} should have same owner in both rings",
                key
            );
        }
    }

    #[test]
    fn test_adding_node_only_moves_keys_to_it() {
        let keys = keys(10_000);
        let before = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["A", "B", "C"]);
        let mut after = before.clone();
        after.add_node("D");

        let mut moved = 0;
        for key in &keys {
            let old = before.lookup(key.as_bytes()).unwrap();
            let new = after.lookup(key.as_bytes()).unwrap();
            if old != new {
                assert_eq!(new, "D", "key {} moved from {} to {}", key, old, new);
                moved += 1;
            }
        }

        let fraction = moved as f64 / keys.len() as f64;
        assert!(fraction > 0.10, "too few keys moved: {}", fraction);
        assert!(fraction <= 0.30, "too many keys moved: {}", fraction);
    }

    #[test]
    fn test_keys_spread_over_nodes() {
        let ring = HashRing::with_nodes(DEFAULT_VIRTUAL_NODES, ["A", "B", "C"]);
        let mut counts = BTreeMap::new();
        for key in keys(9000) {
            *counts.entry(ring.lookup(key.as_bytes()).unwrap()).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 3);
        for (node, count) in counts {
            assert!(count > 2000, "node {} got only {} keys", node, count);
        }
    }

    #[test]
    fn test_zero_virtual_nodes_is_clamped() {
        let ring = HashRing::with_nodes(0, ["A"]);
        assert_eq!(ring.virtual_nodes(), 1);
        assert_eq!(ring.lookup(b"k"), Some("A"));
    }
}
