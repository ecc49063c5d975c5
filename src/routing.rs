use crate::cluster::{Node, NodeResolver};
use crate::error::ClusterError;

/// Where a request for a key should be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// This node owns the key.
    Local(Node),
    /// Another node owns the key.
    Remote(Node),
}

impl Route {
    pub fn node(&self) -> &Node {
        match self {
            Route::Local(node) | Route::Remote(node) => node,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Route::Local(_))
    }
}

/// Maps keys to owning nodes.
///
/// Holds nothing but the resolver and the id of the node it runs on.
pub struct Router<R> {
    resolver: R,
    local_id: String,
}

impl<R: NodeResolver> Router<R> {
    pub fn new(resolver: R, local_id: impl Into<String>) -> Self {
        Self {
            resolver,
            local_id: local_id.into(),
        }
    }

    /// The node that owns `key`.
    pub fn route(&self, key: &[u8]) -> Result<Node, ClusterError> {
        self.resolver.get_node(key)
    }

    /// Whether `key` is served here or by someone else.
    pub fn decide(&self, key: &[u8]) -> Result<Route, ClusterError> {
        let node = self.route(key)?;
        if node.id == self.local_id {
            Ok(Route::Local(node))
        } else {
            Ok(Route::Remote(node))
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }
}
