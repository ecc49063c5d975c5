use crate::checksum::ChecksumAlgorithm;
use crate::cluster::Node;
use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the configuration file written into every data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

const MIB: u64 = 1024 * 1024;

/// Size-tiered compaction parameters for sorted tables.
///
/// Tables are kept in age order. After a flush, the first run of at least
/// `min_threshold` adjacent tables whose sizes are within `size_ratio` of each
/// other is merged into one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Largest allowed ratio between the biggest and smallest table of a run
    /// (must be >= 1.0).
    pub size_ratio: f64,
    /// Minimum number of tables in a run (must be >= 2).
    pub min_threshold: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            size_ratio: 1.2,
            min_threshold: 4,
        }
    }
}

/// Configuration for the storage engine.
///
/// Use the builder methods to customize settings.
///
/// # Example
///
/// ```
/// use ringkv::Config;
/// use std::path::PathBuf;
///
/// let config = Config::new(PathBuf::from("./data"))
///     .with_wal_segment_size(256 * 1024 * 1024)
///     .with_memtable_size(16 * 1024 * 1024)
///     .with_sync_writes(false);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for storing data files.
    ///
    /// Holds `config.json` and the `wal/` and `sst/` subdirectories.
    pub data_dir: PathBuf,

    /// Maximum size of a WAL segment in bytes (default: 128MB).
    ///
    /// Valid range: 1MB - 1GB.
    pub wal_segment_size: u64,

    /// Maximum size of the memtable in bytes (default: 64MB).
    ///
    /// When the memtable reaches this size it is flushed to a sorted table.
    /// Valid range: 64KB - 512MB.
    pub memtable_size: u64,

    /// Checksum algorithm for WAL batches and sorted-table entries.
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Fsync the WAL before acknowledging each write (default: true).
    pub sync_writes: bool,

    /// Compaction parameters.
    pub compaction: CompactionConfig,
}

impl Config {
    /// Creates a configuration for `data_dir` with default values.
    ///
    /// # Default Values
    ///
    /// - WAL segment size: 128MB
    /// - Memtable size: 64MB
    /// - Checksum: CRC32
    /// - Synchronous writes: enabled
    /// - Compaction: ratio 1.2, threshold 4
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            wal_segment_size: 128 * MIB,
            memtable_size: 64 * MIB,
            checksum_algorithm: ChecksumAlgorithm::CRC32,
            sync_writes: true,
            compaction: CompactionConfig::default(),
        }
    }

    /// Validates the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any parameter is invalid:
    /// - Empty data directory
    /// - WAL segment size < 1MB or > 1GB
    /// - Memtable size < 64KB or > 512MB
    /// - Compaction ratio < 1.0 or threshold < 2
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StorageError::ConfigError(
                "data_dir cannot be empty".to_string(),
            ));
        }

        if self.wal_segment_size < MIB {
            return Err(StorageError::ConfigError(
                "wal_segment_size must be at least 1MB".to_string(),
            ));
        }
        if self.wal_segment_size > 1024 * MIB {
            return Err(StorageError::ConfigError(
                "wal_segment_size cannot exceed 1GB".to_string(),
            ));
        }

        if self.memtable_size < 64 * 1024 {
            return Err(StorageError::ConfigError(
                "memtable_size must be at least 64KB".to_string(),
            ));
        }
        if self.memtable_size > 512 * MIB {
            return Err(StorageError::ConfigError(
                "memtable_size cannot exceed 512MB".to_string(),
            ));
        }

        if !(self.compaction.size_ratio >= 1.0) {
            return Err(StorageError::ConfigError(
                "size_ratio must be at least 1.0".to_string(),
            ));
        }
        if self.compaction.min_threshold < 2 {
            return Err(StorageError::ConfigError(
                "min_threshold must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Set WAL segment size
    pub fn with_wal_segment_size(mut self, size: u64) -> Self {
        self.wal_segment_size = size;
        self
    }

    /// Set memtable size
    pub fn with_memtable_size(mut self, size: u64) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set checksum algorithm
    pub fn with_checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = algorithm;
        self
    }

    /// Enable or disable fsync on every write
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set compaction parameters
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub(crate) fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub(crate) fn sst_dir(&self) -> PathBuf {
        self.data_dir.join("sst")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(PathBuf::from("./data"))
    }
}

/// Cluster membership as seen by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The node this process serves.
    pub local_node: Node,
    /// All known nodes, the local node included.
    pub nodes: Vec<Node>,
    /// Ring positions per node (default: 160). Valid range: 1 - 4096.
    pub virtual_nodes: usize,
}

impl ClusterConfig {
    /// Single-node cluster made of `local_node`.
    pub fn single(local_node: Node) -> Self {
        Self {
            nodes: vec![local_node.clone()],
            local_node,
            virtual_nodes: crate::cluster::DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// Replication targets. Followers are stubs identified by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub followers: Vec<String>,
}

/// Everything a storage node needs, persisted as `<data_dir>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub storage: Config,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl NodeConfig {
    pub fn new(storage: Config, local_node: Node) -> Self {
        Self {
            storage,
            cluster: ClusterConfig::single(local_node),
            replication: ReplicationConfig::default(),
        }
    }

    /// Validates storage and cluster settings.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;

        let vnodes = self.cluster.virtual_nodes;
        if vnodes < 1 || vnodes > 4096 {
            return Err(StorageError::ConfigError(
                "virtual_nodes must be between 1 and 4096".to_string(),
            ));
        }
        if self.cluster.local_node.id.is_empty() {
            return Err(StorageError::ConfigError(
                "local_node id cannot be empty".to_string(),
            ));
        }
        if !self
            .cluster
            .nodes
            .iter()
            .any(|n| n.id == self.cluster.local_node.id)
        {
            return Err(StorageError::ConfigError(format!(
                "local node {} is not listed in cluster nodes",
                self.cluster.local_node.id
            )));
        }

        Ok(())
    }

    /// Path of the configuration file inside `data_dir`.
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE_NAME)
    }

    /// Reads and validates `<data_dir>/config.json`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path_in(data_dir);
        let content = fs::read_to_string(&path).map_err(|e| {
            StorageError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON to `<storage.data_dir>/config.json`.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.storage.data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(Self::path_in(&self.storage.data_dir), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default_values() {
        let config = Config::new(PathBuf::from("/tmp/test"));

        assert_eq!(config.wal_segment_size, 128 * 1024 * 1024);
        assert_eq!(config.memtable_size, 64 * 1024 * 1024);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::CRC32);
        assert!(config.sync_writes);
        assert_eq!(config.compaction, CompactionConfig::default());
    }

    #[test]
    fn test_config_validation_success() {
        let config = Config::new(PathBuf::from("/tmp/test"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_data_dir() {
        let config = Config::new(PathBuf::from(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_wal_segment_bounds() {
        let config = Config::new(PathBuf::from("/tmp/test")).with_wal_segment_size(1024);
        assert!(config.validate().is_err());

        let config =
            Config::new(PathBuf::from("/tmp/test")).with_wal_segment_size(2 * 1024 * 1024 * 1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_memtable_bounds() {
        let config = Config::new(PathBuf::from("/tmp/test")).with_memtable_size(1024);
        assert!(config.validate().is_err());

        let config = Config::new(PathBuf::from("/tmp/test")).with_memtable_size(64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compaction_validation() {
        let config = Config::new(PathBuf::from("/tmp/test")).with_compaction(CompactionConfig {
            size_ratio: 0.5,
            min_threshold: 4,
        });
        assert!(config.validate().is_err());

        let config = Config::new(PathBuf::from("/tmp/test")).with_compaction(CompactionConfig {
            size_ratio: 1.5,
            min_threshold: 1,
        });
        assert!(config.validate().is_err());

        let config = Config::new(PathBuf::from("/tmp/test")).with_compaction(CompactionConfig {
            size_ratio: f64::NAN,
            min_threshold: 4,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = Config::new(PathBuf::from("/tmp/test"))
            .with_wal_segment_size(256 * 1024 * 1024)
            .with_memtable_size(128 * 1024 * 1024)
            .with_checksum_algorithm(ChecksumAlgorithm::XXH64)
            .with_sync_writes(false);

        assert_eq!(config.wal_segment_size, 256 * 1024 * 1024);
        assert_eq!(config.memtable_size, 128 * 1024 * 1024);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::XXH64);
        assert!(!config.sync_writes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_config_requires_local_node_in_list() {
        let mut config = NodeConfig::new(
            Config::new(PathBuf::from("/tmp/test")),
            Node::new("a", "127.0.0.1:7000"),
        );
        assert!(config.validate().is_ok());

        config.cluster.nodes = vec![Node::new("b", "127.0.0.1:7001")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_virtual_nodes_bounds() {
        let mut config = NodeConfig::new(
            Config::new(PathBuf::from("/tmp/test")),
            Node::new("a", "127.0.0.1:7000"),
        );
        config.cluster.virtual_nodes = 0;
        assert!(config.validate().is_err());

        config.cluster.virtual_nodes = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = NodeConfig::new(
            Config::new(temp_dir.path().to_path_buf()).with_sync_writes(false),
            Node::new("a", "127.0.0.1:7000"),
        );
        config.cluster.nodes.push(Node::new("b", "127.0.0.1:7001"));
        config.replication.followers.push("replica-1".to_string());
        config.save().unwrap();

        let loaded = NodeConfig::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.cluster.nodes, config.cluster.nodes);
        assert_eq!(loaded.cluster.local_node, config.cluster.local_node);
        assert_eq!(loaded.replication.followers, vec!["replica-1".to_string()]);
        assert!(!loaded.storage.sync_writes);
    }

    #[test]
    fn test_node_config_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        match NodeConfig::load(temp_dir.path()) {
            Err(StorageError::ConfigError(msg)) => assert!(msg.contains("config.json")),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
