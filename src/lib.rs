//! # ringKV - Distributed Key-Value Storage with Secondary Indexes
//!
//! ringKV is a storage node for a sharded key-value cluster. Each node owns a
//! slice of the keyspace, assigned by a consistent hash ring, and keeps its
//! records in a local log-structured store. Records can carry secondary-index
//! entries that live next to them on the same node.
//!
//! ## Architecture
//!
//! - **Storage engine**: primary records and index entries in one ordered
//!   keyspace, written together as atomic batches
//! - **Write-Ahead Log (WAL)**: every batch is logged before it is applied
//! - **Memtable**: in-memory skip list buffer for recent writes
//! - **Sorted tables**: immutable on-disk tables, merged by size-tiered compaction
//! - **Hash ring**: XXH64 consistent hashing with virtual nodes
//! - **Router / Node**: serve owned keys locally, name the owner otherwise
//! - **Replication**: leader-to-follower fan-out interface with a logging stub
//!
//! ## Example Usage
//!
//! ```no_run
//! use ringkv::{ClusterManager, Config, Node, Router, StorageEngine, StorageNode};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(StorageEngine::open(Config::new(PathBuf::from("./data")))?);
//!     let cluster = Arc::new(ClusterManager::new(
//!         vec![Node::new("A", "10.0.0.1:7000"), Node::new("B", "10.0.0.2:7000")],
//!         ringkv::cluster::DEFAULT_VIRTUAL_NODES,
//!     )?);
//!     let node = StorageNode::new(engine, Router::new(cluster, "A"));
//!
//!     // Fails with NotOwner when the ring assigns the key to B.
//!     node.set_with_index(b"u1", b"alice", "name", b"alice")?;
//!     let keys = node.get_by_index("name", b"alice")?;
//!     println!("{} keys", keys.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: Storage engine with secondary indexes
//! - [`keys`]: Encoding of index entries inside the shared keyspace
//! - [`wal`]: Write-ahead log manager for durability
//! - [`memtable`]: In-memory skip list buffer
//! - [`sst`]: Sorted table file management
//! - [`compaction`]: Size-tiered merging of sorted tables
//! - [`cluster`]: Hash ring and cluster membership
//! - [`routing`]: Key-to-node routing decisions
//! - [`replication`]: Follower interface and fan-out
//! - [`node`]: The composed storage node
//! - [`metrics`]: Performance metrics collection
//! - [`config`]: Configuration structures
//! - [`error`]: Error types and result aliases

/// Checksum utilities (CRC32, XXH64) for data integrity
pub mod checksum;

/// Configuration structures and validation
pub mod config;

/// Record formats for WAL batches and sorted tables
pub mod entry;

/// Primary and index key encoding
pub mod keys;

/// Storage engine
pub mod engine;

/// Write-ahead log manager
pub mod wal;

/// In-memory skip list memtable
pub mod memtable;

/// Sorted table file management
pub mod sst;

/// Size-tiered compaction for sorted tables
pub mod compaction;

/// Performance metrics collection and reporting
pub mod metrics;

/// Hash ring and cluster membership
pub mod cluster;

/// Key routing
pub mod routing;

/// Leader-to-follower replication
pub mod replication;

/// Storage node composing engine, routing and replication
pub mod node;

/// Command-line interface
pub mod cli;

/// Error types and result aliases
pub mod error;

// Re-export commonly used types
pub use cluster::{ClusterManager, HashRing, Node, NodeResolver};
pub use config::{Config, NodeConfig};
pub use engine::{StorageEngine, WriteOp};
pub use error::{ClusterError, ErrorKind, NodeError, ReplicationError, Result, StorageError};
pub use node::StorageNode;
pub use routing::{Route, Router};
