use crate::cluster::{ClusterManager, Node, NodeResolver};
use crate::config::NodeConfig;
use crate::engine::{StorageEngine, WriteOp};
use crate::error::{ClusterError, NodeError};
use crate::replication::{LogEntry, ReplicationQueue};
use crate::routing::{Route, Router};
use std::sync::Arc;

/// One member of the cluster: a local engine behind a router.
///
/// Primary-key operations are served only when the ring assigns the key to
/// this node; otherwise they fail with [`NodeError::NotOwner`] naming the
/// owner, and the transport layer forwards the request. Index lookups never
/// leave the node, since every record's index entries live next to it.
///
/// Committed writes are handed to the replication queue, if one is attached.
/// A closed queue never fails the write.
pub struct StorageNode<R = Arc<ClusterManager>> {
    engine: Arc<StorageEngine>,
    router: Router<R>,
    replication: Option<ReplicationQueue>,
}

impl StorageNode<Arc<ClusterManager>> {
    /// Open the engine and build the membership described by `config`.
    pub fn open(config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let engine = Arc::new(StorageEngine::open(config.storage.clone())?);
        let cluster = Arc::new(ClusterManager::new(
            config.cluster.nodes.clone(),
            config.cluster.virtual_nodes,
        )?);

        tracing::info!(
            "Node {} serving {:?} in a cluster of {}",
            config.cluster.local_node,
            config.storage.data_dir,
            cluster.len()
        );
        Ok(Self::new(engine, Router::new(cluster, config.cluster.local_node.id.clone())))
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        self.router.resolver()
    }
}

impl<R: NodeResolver> StorageNode<R> {
    pub fn new(engine: Arc<StorageEngine>, router: Router<R>) -> Self {
        Self {
            engine,
            router,
            replication: None,
        }
    }

    pub fn with_replication(mut self, queue: ReplicationQueue) -> Self {
        self.replication = Some(queue);
        self
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), NodeError> {
        self.write(WriteOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn set_with_index(
        &self,
        key: &[u8],
        value: &[u8],
        index_name: &str,
        index_value: &[u8],
    ) -> Result<(), NodeError> {
        self.write(WriteOp::SetWithIndex {
            key: key.to_vec(),
            value: value.to_vec(),
            index_name: index_name.to_string(),
            index_value: index_value.to_vec(),
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), NodeError> {
        self.write(WriteOp::Delete { key: key.to_vec() })
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, NodeError> {
        self.ensure_local(key)?;
        Ok(self.engine.get(key)?)
    }

    /// Primary keys indexed under `(index_name, index_value)` on this node.
    pub fn get_by_index(&self, index_name: &str, index_value: &[u8]) -> Result<Vec<Vec<u8>>, NodeError> {
        Ok(self.engine.get_by_index(index_name, index_value)?)
    }

    pub fn get_records_by_index(
        &self,
        index_name: &str,
        index_value: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, NodeError> {
        Ok(self.engine.get_records_by_index(index_name, index_value)?)
    }

    /// The node that owns `key`.
    pub fn owner(&self, key: &[u8]) -> Result<Node, ClusterError> {
        self.router.route(key)
    }

    fn ensure_local(&self, key: &[u8]) -> Result<Node, NodeError> {
        match self.router.decide(key)? {
            Route::Local(node) => Ok(node),
            Route::Remote(owner) => Err(NodeError::NotOwner {
                key: key.to_vec(),
                owner,
            }),
        }
    }

    fn write(&self, op: WriteOp) -> Result<(), NodeError> {
        self.ensure_local(op.key())?;

        // Queued inside the commit so the queue order is the commit order.
        self.engine.apply_with(&op, |sequence| {
            if let Some(queue) = &self.replication {
                if let Err(e) = queue.submit(LogEntry::new(sequence, op.clone())) {
                    tracing::warn!(
                        "Write {} committed but not queued for replication: {}",
                        sequence,
                        e
                    );
                }
            }
        })?;
        Ok(())
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Router<R> {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DEFAULT_VIRTUAL_NODES;
    use crate::config::{ClusterConfig, Config};
    use crate::error::{ErrorKind, StorageError};
    use crate::replication::{spawn_replication_worker, Follower, Leader, LoggingFollower};
    use tempfile::TempDir;

    fn open_engine(temp_dir: &TempDir) -> Arc<StorageEngine> {
        let config = Config::new(temp_dir.path().to_path_buf()).with_sync_writes(false);
        Arc::new(StorageEngine::open(config).unwrap())
    }

    fn two_node_cluster() -> Arc<ClusterManager> {
        Arc::new(
            ClusterManager::new(
                vec![Node::new("A", "10.0.0.1:7000"), Node::new("B", "10.0.0.2:7000")],
                DEFAULT_VIRTUAL_NODES,
            )
            .unwrap(),
        )
    }

    /// First generated key whose owner has the given id.
    fn key_owned_by(cluster: &ClusterManager, id: &str) -> Vec<u8> {
        (0..)
            .map(|i| format!("user:{}", i).into_bytes())
            .find(|key| cluster.get_node(key).unwrap().id == id)
            .unwrap()
    }

    #[test]
    fn test_local_keys_are_served() {
        let temp_dir = TempDir::new().unwrap();
        let cluster = two_node_cluster();
        let node = StorageNode::new(open_engine(&temp_dir), Router::new(cluster.clone(), "A"));
        let key = key_owned_by(&cluster, "A");

        node.set_with_index(&key, b"alice", "name", b"alice").unwrap();
        assert_eq!(node.get(&key).unwrap(), b"alice");
        assert_eq!(node.get_by_index("name", b"alice").unwrap(), vec![key.clone()]);

        node.delete(&key).unwrap();
        let err = node.get(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err, NodeError::Storage(StorageError::KeyNotFound { .. })));
        assert_eq!(node.get_by_index("name", b"alice").unwrap(), vec![key]);
    }

    #[test]
    fn test_remote_keys_are_rejected_with_owner() {
        let temp_dir = TempDir::new().unwrap();
        let cluster = two_node_cluster();
        let node = StorageNode::new(open_engine(&temp_dir), Router::new(cluster.clone(), "A"));
        let key = key_owned_by(&cluster, "B");

        match node.set(&key, b"v") {
            Err(NodeError::NotOwner { key: k, owner }) => {
                assert_eq!(k, key);
                assert_eq!(owner, Node::new("B", "10.0.0.2:7000"));
            }
            other => panic!("expected NotOwner, got {:?}", other),
        }
        assert!(matches!(node.get(&key), Err(NodeError::NotOwner { .. })));
        assert!(matches!(node.delete(&key), Err(NodeError::NotOwner { .. })));
        assert_eq!(node.owner(&key).unwrap().id, "B");

        // Nothing was written locally.
        assert!(node.engine().get(&key).unwrap_err().is_not_found());
        assert_eq!(node.engine().last_sequence(), 0);
    }

    #[test]
    fn test_empty_cluster_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let cluster = Arc::new(ClusterManager::new(Vec::new(), DEFAULT_VIRTUAL_NODES).unwrap());
        let node = StorageNode::new(open_engine(&temp_dir), Router::new(cluster, "A"));

        let err = node.set(b"k", b"v").unwrap_err();
        assert!(matches!(err, NodeError::Cluster(ClusterError::EmptyCluster)));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(node.owner(b"k"), Err(ClusterError::EmptyCluster));
    }

    #[test]
    fn test_open_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let local = Node::new("solo", "127.0.0.1:7000");
        let config = NodeConfig::new(
            Config::new(temp_dir.path().to_path_buf()).with_sync_writes(false),
            local.clone(),
        );
        assert_eq!(config.cluster, ClusterConfig::single(local));

        let node = StorageNode::open(&config).unwrap();
        node.set(b"k", b"v").unwrap();
        assert_eq!(node.get(b"k").unwrap(), b"v");
        assert_eq!(node.cluster().len(), 1);
    }

    /// Remembers the sequence of every entry it receives.
    #[derive(Default)]
    struct RecordingFollower {
        sequences: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl Follower for RecordingFollower {
        fn id(&self) -> &str {
            "recording"
        }

        async fn apply(&self, entry: &LogEntry) -> Result<(), crate::error::ReplicationError> {
            self.sequences.lock().unwrap().push(entry.sequence);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_replicate_in_commit_order() {
        let temp_dir = TempDir::new().unwrap();
        let follower = Arc::new(RecordingFollower::default());
        let followers: Vec<Arc<dyn Follower>> = vec![follower.clone()];
        let (queue, worker) = spawn_replication_worker(Leader::new(followers));

        let cluster = Arc::new(
            ClusterManager::new(vec![Node::new("A", "127.0.0.1:7000")], DEFAULT_VIRTUAL_NODES)
                .unwrap(),
        );
        let node = StorageNode::new(open_engine(&temp_dir), Router::new(cluster, "A"))
            .with_replication(queue);

        std::thread::scope(|s| {
            for t in 0..8 {
                let node = &node;
                s.spawn(move || {
                    for i in 0..500 {
                        let key = format!("t{}:k{}", t, i);
                        node.set(key.as_bytes(), b"v").unwrap();
                    }
                });
            }
        });

        drop(node);
        worker.await.unwrap();

        let sequences = follower.sequences.lock().unwrap().clone();
        let expected: Vec<u64> = (1..=4000).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn test_writes_are_replicated() {
        let temp_dir = TempDir::new().unwrap();
        let follower = Arc::new(LoggingFollower::new("f1"));
        let (queue, worker) =
            spawn_replication_worker(Leader::new(vec![follower.clone() as Arc<dyn Follower>]));

        let cluster = Arc::new(
            ClusterManager::new(vec![Node::new("A", "127.0.0.1:7000")], DEFAULT_VIRTUAL_NODES)
                .unwrap(),
        );
        let node = StorageNode::new(open_engine(&temp_dir), Router::new(cluster, "A"))
            .with_replication(queue);

        node.set(b"k1", b"v1").unwrap();
        node.set_with_index(b"k2", b"v2", "tag", b"x").unwrap();
        node.delete(b"k1").unwrap();
        // Rejected writes are not replicated.
        assert!(node.set(b"", b"v").is_err());

        drop(node);
        worker.await.unwrap();

        assert_eq!(follower.applied(), 3);
        assert_eq!(follower.last_sequence(), 3);
    }
}
