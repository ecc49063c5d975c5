use super::{HashRing, Node, NodeResolver};
use crate::error::ClusterError;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Membership {
    nodes: BTreeMap<String, Node>,
    ring: HashRing,
}

/// Cluster membership plus the ring built from it.
///
/// Both live behind one `RwLock`, so a lookup never sees a ring that
/// disagrees with the member table. Membership changes are exclusive;
/// lookups share the lock.
pub struct ClusterManager {
    inner: RwLock<Membership>,
}

impl ClusterManager {
    /// Build a manager from an initial member list.
    ///
    /// # Errors
    ///
    /// `InvalidNode` for an empty id, `DuplicateNode` if an id repeats.
    pub fn new(nodes: Vec<Node>, virtual_nodes: usize) -> Result<Self, ClusterError> {
        let mut membership = Membership {
            nodes: BTreeMap::new(),
            ring: HashRing::new(virtual_nodes),
        };
        for node in nodes {
            Self::insert(&mut membership, node)?;
        }

        Ok(Self {
            inner: RwLock::new(membership),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Membership> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Membership> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(membership: &mut Membership, node: Node) -> Result<(), ClusterError> {
        if node.id.is_empty() {
            return Err(ClusterError::InvalidNode("node id is empty".to_string()));
        }
        if membership.nodes.contains_key(&node.id) {
            return Err(ClusterError::DuplicateNode { id: node.id });
        }
        membership.ring.add_node(node.id.clone());
        membership.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Snapshot of the members, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        self.read().nodes.values().cloned().collect()
    }

    pub fn add_node(&self, node: Node) -> Result<(), ClusterError> {
        let mut membership = self.write();
        let id = node.id.clone();
        Self::insert(&mut membership, node)?;
        tracing::info!("Node {} joined, {} members", id, membership.nodes.len());
        Ok(())
    }

    /// Remove a member by id. A non-member is not an error.
    pub fn remove_node(&self, id: &str) -> Option<Node> {
        let mut membership = self.write();
        let removed = membership.nodes.remove(id)?;
        membership.ring.remove_node(id);
        tracing::info!("Node {} left, {} members", id, membership.nodes.len());
        Some(removed)
    }

    /// The node that owns `key`.
    ///
    /// # Errors
    ///
    /// `EmptyCluster` when there are no members.
    pub fn get_node(&self, key: &[u8]) -> Result<Node, ClusterError> {
        let membership = self.read();
        membership
            .ring
            .lookup(key)
            .and_then(|id| membership.nodes.get(id))
            .cloned()
            .ok_or(ClusterError::EmptyCluster)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }
}

impl NodeResolver for ClusterManager {
    fn get_node(&self, key: &[u8]) -> Result<Node, ClusterError> {
        ClusterManager::get_node(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DEFAULT_VIRTUAL_NODES;
    use std::sync::Arc;

    fn three_nodes() -> Vec<Node> {
        vec![
            Node::new("A", "10.0.0.1:7000"),
            Node::new("B", "10.0.0.2:7000"),
            Node::new("C", "10.0.0.3:7000"),
        ]
    }

    #[test]
    fn test_empty_cluster() {
        let manager = ClusterManager::new(Vec::new(), DEFAULT_VIRTUAL_NODES).unwrap();
        assert!(manager.is_empty());
        assert_eq!(manager.get_node(b"user:42"), Err(ClusterError::EmptyCluster));
    }

    #[test]
    fn test_get_node_is_stable() {
        let manager = ClusterManager::new(three_nodes(), DEFAULT_VIRTUAL_NODES).unwrap();
        let owner = manager.get_node(b"user:42").unwrap();
        for _ in 0..10 {
            assert_eq!(manager.get_node(b"user:42").unwrap(), owner);
        }
        assert!(three_nodes().contains(&owner));
    }

    #[test]
    fn test_add_node_rejects_duplicates_and_empty_ids() {
        let manager = ClusterManager::new(three_nodes(), DEFAULT_VIRTUAL_NODES).unwrap();

        assert_eq!(
            manager.add_node(Node::new("A", "10.0.0.9:7000")),
            Err(ClusterError::DuplicateNode { id: "A".into() })
        );
        assert!(matches!(
            manager.add_node(Node::new("", "10.0.0.9:7000")),
            Err(ClusterError::InvalidNode(_))
        ));
        assert_eq!(manager.len(), 3);
        // The first address is kept.
        assert_eq!(manager.nodes()[0].address, "10.0.0.1:7000");

        assert!(matches!(
            ClusterManager::new(vec![Node::new("A", "x"), Node::new("A", "y")], 8),
            Err(ClusterError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn test_remove_node() {
        let manager = ClusterManager::new(three_nodes(), DEFAULT_VIRTUAL_NODES).unwrap();

        assert_eq!(manager.remove_node("B"), Some(Node::new("B", "10.0.0.2:7000")));
        assert_eq!(manager.remove_node("B"), None);
        assert_eq!(manager.remove_node("Z"), None);
        assert!(!manager.contains("B"));

        for i in 0..500 {
            let key = format!("key-{}", i);
            assert_ne!(manager.get_node(key.as_bytes()).unwrap().id, "B");
        }

        manager.remove_node("A");
        manager.remove_node("C");
        assert_eq!(manager.get_node(b"k"), Err(ClusterError::EmptyCluster));
    }

    #[test]
    fn test_nodes_ordered_by_id() {
        let manager = ClusterManager::new(
            vec![Node::new("c", "3"), Node::new("a", "1")],
            DEFAULT_VIRTUAL_NODES,
        )
        .unwrap();
        manager.add_node(Node::new("b", "2")).unwrap();

        let ids: Vec<String> = manager.nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_membership_changes_move_only_affected_keys() {
        let manager = ClusterManager::new(three_nodes(), DEFAULT_VIRTUAL_NODES).unwrap();
        let keys: Vec<String> = (0..2000).map(|i| format!("user:{}", i)).collect();
        let before: Vec<Node> = keys.iter().map(|k| manager.get_node(k.as_bytes()).unwrap()).collect();

        manager.add_node(Node::new("D", "10.0.0.4:7000")).unwrap();
        for (key, old) in keys.iter().zip(&before) {
            let new = manager.get_node(key.as_bytes()).unwrap();
            assert!(new == *old || new.id == "D");
        }

        manager.remove_node("D");
        for (key, old) in keys.iter().zip(&before) {
            assert_eq!(manager.get_node(key.as_bytes()).unwrap(), *old);
        }
    }

    #[test]
    fn test_concurrent_lookups_during_membership_changes() {
        let manager = Arc::new(ClusterManager::new(three_nodes(), DEFAULT_VIRTUAL_NODES).unwrap());

        let mut handles = Vec::new();
        for t in 0..4 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("t{}-{}", t, i);
                    let node = manager.get_node(key.as_bytes()).unwrap();
                    assert!(!node.id.is_empty());
                }
            }));
        }
        {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..20 {
                    let id = format!("extra-{}", i);
                    manager.add_node(Node::new(id.clone(), "127.0.0.1:0")).unwrap();
                    manager.remove_node(&id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.len(), 3);
    }
}
