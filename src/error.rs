//! Error types for ringKV.
//!
//! Each layer has its own error enum: [`StorageError`] for the embedded store and
//! storage engine, [`ClusterError`] for membership and routing,
//! [`ReplicationError`] for follower fan-out, and [`NodeError`] for the composed
//! storage node. Every error maps to an [`ErrorKind`], which is
//! what a transport adapter turns into a status code.

use crate::cluster::Node;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for storage operations.
///
/// This is a convenience alias for `Result<T, StorageError>`.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Coarse classification of an error at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested key does not exist.
    NotFound,
    /// The request cannot be served right now (no nodes, wrong node).
    Unavailable,
    /// The request itself is malformed.
    InvalidArgument,
    /// The request conflicts with existing state.
    Conflict,
    /// Anything the caller cannot fix: I/O, corruption, encoding.
    Internal,
}

/// Error types for storage operations.
///
/// `KeyNotFound` is the only expected condition; everything else is either a
/// caller mistake (`InvalidKey`, `Closed`) or an internal failure.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the operating system.
    ///
    /// This includes file system errors, permission errors, and device errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Key not found in storage.
    #[error("Key not found: {key:?}")]
    KeyNotFound {
        /// The key that was not found
        key: Vec<u8>,
    },

    /// The key is empty or falls inside the reserved index namespace.
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key
        key: Vec<u8>,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The value exceeds the largest size the store accepts.
    #[error("Value of {len} bytes exceeds the limit of {max} bytes")]
    ValueTooLarge {
        /// Length of the rejected value
        len: usize,
        /// Largest accepted length
        max: usize,
    },

    /// An index key could not be decoded back into its parts.
    ///
    /// Only happens when the keyspace is corrupted.
    #[error("Index encoding error: {0}")]
    EncodingError(String),

    /// Data corruption detected in a file.
    #[error("Corrupted data in file {file:?} at offset {offset}")]
    CorruptedData {
        /// Path to the file containing corrupted data
        file: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
    },

    /// Checksum verification failed.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value computed from data
        actual: u32,
    },

    /// The engine was closed and no longer accepts operations.
    #[error("Storage engine is closed")]
    Closed,

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization or deserialization of an on-disk record failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// JSON parsing or serialization failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl StorageError {
    /// Classify this error for the transport boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::KeyNotFound { .. } => ErrorKind::NotFound,
            StorageError::InvalidKey { .. } | StorageError::ValueTooLarge { .. } => {
                ErrorKind::InvalidArgument
            }
            StorageError::Closed => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// True for the expected "no such key" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::KeyNotFound { .. })
    }
}

/// Errors from cluster membership and key resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// There are no nodes to route to.
    #[error("Cluster has no nodes")]
    EmptyCluster,

    /// A node with this id is already a member.
    #[error("Node {id} is already a member of the cluster")]
    DuplicateNode {
        /// The conflicting node id
        id: String,
    },

    /// The node description is unusable (e.g. empty id).
    #[error("Invalid node: {0}")]
    InvalidNode(String),
}

impl ClusterError {
    /// Classify this error for the transport boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::EmptyCluster => ErrorKind::Unavailable,
            ClusterError::DuplicateNode { .. } => ErrorKind::Conflict,
            ClusterError::InvalidNode(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Errors from shipping log entries to followers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The follower received the entry but refused it.
    #[error("Follower {follower} rejected entry {sequence}: {reason}")]
    Rejected {
        follower: String,
        sequence: u64,
        reason: String,
    },

    /// The follower could not be reached or its task died.
    #[error("Follower {follower} is unavailable: {reason}")]
    Unavailable { follower: String, reason: String },

    /// The replication worker has shut down.
    #[error("Replication queue is closed")]
    QueueClosed,
}

impl ReplicationError {
    /// Classify this error for the transport boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicationError::Rejected { .. } => ErrorKind::Internal,
            ReplicationError::Unavailable { .. } | ReplicationError::QueueClosed => {
                ErrorKind::Unavailable
            }
        }
    }
}

/// Errors returned by [`crate::node::StorageNode`].
#[derive(Error, Debug)]
pub enum NodeError {
    /// The local storage engine failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The key could not be resolved to a node.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The key belongs to another node.
    #[error("Key {key:?} is owned by node {owner}")]
    NotOwner {
        /// The requested key
        key: Vec<u8>,
        /// The node that owns it
        owner: Node,
    },
}

impl NodeError {
    /// Classify this error for the transport boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Storage(e) => e.kind(),
            NodeError::Cluster(e) => e.kind(),
            NodeError::NotOwner { .. } => ErrorKind::Unavailable,
        }
    }
}
