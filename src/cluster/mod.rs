//! Cluster membership and key ownership.
//!
//! [`HashRing`] maps keys to node ids with consistent hashing, and
//! [`ClusterManager`] keeps the membership table and the ring in step behind
//! one lock.

mod manager;
mod ring;

pub use manager::ClusterManager;
pub use ring::HashRing;

use crate::error::ClusterError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ring positions per node unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique, stable identifier. This is what gets hashed onto the ring.
    pub id: String,
    /// Network address the node serves on, e.g. `10.0.0.1:7000`.
    pub address: String,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Anything that can name the node owning a key.
pub trait NodeResolver: Send + Sync {
    /// The node responsible for `key`.
    fn get_node(&self, key: &[u8]) -> Result<Node, ClusterError>;
}

impl<R: NodeResolver + ?Sized> NodeResolver for std::sync::Arc<R> {
    fn get_node(&self, key: &[u8]) -> Result<Node, ClusterError> {
        (**self).get_node(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_display() {
        let node = Node::new("a", "127.0.0.1:7000");
        assert_eq!(node.to_string(), "a@127.0.0.1:7000");
    }

    #[test]
    fn test_node_serde() {
        let node = Node::new("b", "10.0.0.2:7000");
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, r#"{"id":"b","address":"10.0.0.2:7000"}"#);
        assert_eq!(serde_json::from_str::<Node>(&json).unwrap(), node);
    }
}
