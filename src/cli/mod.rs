use crate::checksum::ChecksumAlgorithm;
use crate::cluster::{ClusterManager, Node};
use crate::config::{Config, NodeConfig, ReplicationConfig};
use crate::error::{NodeError, StorageError};
use crate::node::StorageNode;
use crate::replication::{spawn_replication_worker, Leader};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Parser)]
#[command(name = "ringkv")]
#[command(about = "Distributed key-value storage node with secondary indexes", long_about = None)]
pub struct Command {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a node's data directory and configuration
    Init {
        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Id of the local node
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Address the local node serves on
        #[arg(long, default_value = "127.0.0.1:7000")]
        address: String,

        /// WAL segment size in MB
        #[arg(short, long, default_value = "128")]
        segment_size: u64,

        /// Memtable size in MB
        #[arg(short, long, default_value = "64")]
        memtable_size: u64,

        /// Checksum algorithm for on-disk records
        #[arg(long, value_enum, default_value = "crc32")]
        checksum: ChecksumArg,

        /// Do not fsync the WAL on every write
        #[arg(long)]
        no_sync: bool,

        /// Ring positions per node
        #[arg(long, default_value = "160")]
        virtual_nodes: usize,

        /// Replication follower id (repeatable)
        #[arg(long = "follower")]
        followers: Vec<String>,
    },

    /// Store a record, optionally with one secondary-index entry
    Set {
        /// Primary key
        key: String,

        /// Value to store
        value: String,

        /// Index name
        #[arg(long, requires = "index_value")]
        index_name: Option<String>,

        /// Index value
        #[arg(long, requires = "index_name")]
        index_value: Option<String>,

        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },

    /// Get the value for a key
    Get {
        /// Key to retrieve
        key: String,

        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },

    /// List primary keys indexed under a name and value
    GetByIndex {
        /// Index name
        index_name: String,

        /// Index value
        index_value: String,

        /// Print each record's value, skipping deleted records
        #[arg(long)]
        resolve: bool,

        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },

    /// Delete a key (its index entries are kept)
    Delete {
        /// Key to delete
        key: String,

        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },

    /// Manage cluster membership
    Node {
        #[command(subcommand)]
        action: NodeCommand,

        /// Data directory path
        #[arg(short, long, default_value = "./data", global = true)]
        path: PathBuf,
    },

    /// Show which node owns a key
    Route {
        /// Key to route
        key: String,

        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },

    /// Run benchmark against the local engine
    Bench {
        /// Number of keys
        #[arg(short, long, default_value = "100000")]
        keys: u64,

        /// Read percentage (0-100)
        #[arg(short, long, default_value = "70")]
        read_pct: u8,

        /// Write percentage (0-100)
        #[arg(short, long, default_value = "30")]
        write_pct: u8,

        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum NodeCommand {
    /// Add a node to the cluster
    Add {
        /// Node id
        id: String,

        /// Node address
        address: String,
    },

    /// Remove a node from the cluster
    Remove {
        /// Node id
        id: String,
    },

    /// List cluster members
    List,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ChecksumArg {
    Crc32,
    Xxh64,
}

impl From<ChecksumArg> for ChecksumAlgorithm {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::Crc32 => ChecksumAlgorithm::CRC32,
            ChecksumArg::Xxh64 => ChecksumAlgorithm::XXH64,
        }
    }
}

pub async fn execute_command(cmd: Command) -> Result<()> {
    match cmd.command {
        Commands::Init {
            path,
            node_id,
            address,
            segment_size,
            memtable_size,
            checksum,
            no_sync,
            virtual_nodes,
            followers,
        } => {
            let storage = Config::new(path)
                .with_wal_segment_size(megabytes(segment_size, "--segment-size")?)
                .with_memtable_size(megabytes(memtable_size, "--memtable-size")?)
                .with_checksum_algorithm(checksum.into())
                .with_sync_writes(!no_sync);
            let mut config = NodeConfig::new(storage, Node::new(node_id, address));
            config.cluster.virtual_nodes = virtual_nodes;
            config.replication = ReplicationConfig { followers };
            execute_init_command(config).await
        }
        Commands::Set {
            key,
            value,
            index_name,
            index_value,
            path,
        } => {
            let index = index_name.zip(index_value);
            execute_set_command(key, value, index, path).await
        }
        Commands::Get { key, path } => execute_get_command(key, path).await,
        Commands::GetByIndex {
            index_name,
            index_value,
            resolve,
            path,
        } => execute_get_by_index_command(index_name, index_value, resolve, path).await,
        Commands::Delete { key, path } => execute_delete_command(key, path).await,
        Commands::Node { action, path } => execute_node_command(action, path).await,
        Commands::Route { key, path } => execute_route_command(key, path).await,
        Commands::Bench {
            keys,
            read_pct,
            write_pct,
            duration,
            path,
        } => execute_bench_command(keys, read_pct, write_pct, duration, path).await,
    }
}

fn megabytes(value: u64, flag: &str) -> Result<u64> {
    value.checked_mul(1024 * 1024).ok_or_else(|| {
        StorageError::ConfigError(format!("{} of {} MB is too large", flag, value)).into()
    })
}

/// An opened node plus its replication worker, for one command.
struct Session {
    node: StorageNode,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Must run inside the tokio runtime when followers are configured.
    fn open(path: &Path) -> Result<Self> {
        let config = load_config_from_path(path)?;
        let mut node = StorageNode::open(&config)?;

        let worker = if config.replication.followers.is_empty() {
            None
        } else {
            let (queue, worker) = spawn_replication_worker(Leader::from_config(&config.replication));
            node = node.with_replication(queue);
            Some(worker)
        };

        Ok(Self { node, worker })
    }

    /// Close the engine and let queued replication finish.
    async fn finish(self) -> Result<()> {
        self.node.engine().close()?;
        drop(self.node);
        if let Some(worker) = self.worker {
            if let Err(e) = worker.await {
                tracing::warn!("Replication worker failed: {}", e);
            }
        }
        Ok(())
    }
}

async fn execute_init_command(config: NodeConfig) -> Result<()> {
    let path = config.storage.data_dir.clone();
    println!("Initializing ringKV node at: {}", path.display());

    let config_path = NodeConfig::path_in(&path);
    if config_path.exists() {
        return Err(StorageError::ConfigError(format!(
            "{} already exists",
            config_path.display()
        ))
        .into());
    }
    config.validate()?;

    std::fs::create_dir_all(path.join("wal")).map_err(StorageError::from)?;
    std::fs::create_dir_all(path.join("sst")).map_err(StorageError::from)?;
    config.save()?;

    println!("  ✓ Created configuration file: {}", config_path.display());
    println!("\nConfiguration:");
    println!("  Local node: {}", config.cluster.local_node);
    println!("  WAL segment size: {} MB", config.storage.wal_segment_size / (1024 * 1024));
    println!("  Memtable size: {} MB", config.storage.memtable_size / (1024 * 1024));
    println!("  Checksum: {:?}", config.storage.checksum_algorithm);
    println!("  Sync writes: {}", config.storage.sync_writes);
    println!("  Virtual nodes: {}", config.cluster.virtual_nodes);
    if !config.replication.followers.is_empty() {
        println!("  Followers: {}", config.replication.followers.join(", "));
    }
    println!("\nNode initialized successfully!");

    Ok(())
}

async fn execute_set_command(
    key: String,
    value: String,
    index: Option<(String, String)>,
    path: PathBuf,
) -> Result<()> {
    let session = Session::open(&path)?;

    match &index {
        Some((name, index_value)) => {
            session
                .node
                .set_with_index(key.as_bytes(), value.as_bytes(), name, index_value.as_bytes())?;
            println!("✓ Set key: {} (indexed {}={})", key, name, index_value);
        }
        None => {
            session.node.set(key.as_bytes(), value.as_bytes())?;
            println!("✓ Set key: {}", key);
        }
    }

    session.finish().await
}

async fn execute_get_command(key: String, path: PathBuf) -> Result<()> {
    let session = Session::open(&path)?;

    match session.node.get(key.as_bytes()) {
        Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
        Err(NodeError::Storage(StorageError::KeyNotFound { .. })) => {
            println!("Key not found: {}", key);
        }
        Err(e) => return Err(e),
    }

    session.finish().await
}

async fn execute_get_by_index_command(
    index_name: String,
    index_value: String,
    resolve: bool,
    path: PathBuf,
) -> Result<()> {
    let session = Session::open(&path)?;

    if resolve {
        let records = session
            .node
            .get_records_by_index(&index_name, index_value.as_bytes())?;
        println!("Found {} records:", records.len());
        for (key, value) in records {
            println!(
                "  {} = {}",
                String::from_utf8_lossy(&key),
                String::from_utf8_lossy(&value)
            );
        }
    } else {
        let keys = session.node.get_by_index(&index_name, index_value.as_bytes())?;
        println!("Found {} keys:", keys.len());
        for key in keys {
            println!("  {}", String::from_utf8_lossy(&key));
        }
    }

    session.finish().await
}

async fn execute_delete_command(key: String, path: PathBuf) -> Result<()> {
    let session = Session::open(&path)?;
    session.node.delete(key.as_bytes())?;
    println!("✓ Deleted key: {}", key);
    session.finish().await
}

async fn execute_node_command(action: NodeCommand, path: PathBuf) -> Result<()> {
    let mut config = load_config_from_path(&path)?;
    let cluster = ClusterManager::new(config.cluster.nodes.clone(), config.cluster.virtual_nodes)?;

    match action {
        NodeCommand::Add { id, address } => {
            let node = Node::new(id, address);
            cluster.add_node(node.clone())?;
            config.cluster.nodes = cluster.nodes();
            config.save()?;
            println!("✓ Added node {}", node);
        }
        NodeCommand::Remove { id } => {
            if id == config.cluster.local_node.id {
                return Err(StorageError::ConfigError(format!(
                    "cannot remove the local node {}",
                    id
                ))
                .into());
            }
            match cluster.remove_node(&id) {
                Some(node) => {
                    config.cluster.nodes = cluster.nodes();
                    config.save()?;
                    println!("✓ Removed node {}", node);
                }
                None => println!("Node {} is not a member", id),
            }
        }
        NodeCommand::List => {
            println!("Cluster has {} nodes:", cluster.len());
            for node in cluster.nodes() {
                let marker = if node.id == config.cluster.local_node.id {
                    " (local)"
                } else {
                    ""
                };
                println!("  {}{}", node, marker);
            }
        }
    }

    Ok(())
}

async fn execute_route_command(key: String, path: PathBuf) -> Result<()> {
    let config = load_config_from_path(&path)?;
    let cluster = ClusterManager::new(config.cluster.nodes.clone(), config.cluster.virtual_nodes)?;

    let owner = cluster.get_node(key.as_bytes())?;
    let marker = if owner.id == config.cluster.local_node.id {
        " (local)"
    } else {
        ""
    };
    println!("{} -> {}{}", key, owner, marker);
    Ok(())
}

async fn execute_bench_command(
    keys: u64,
    read_pct: u8,
    write_pct: u8,
    duration: u64,
    path: PathBuf,
) -> Result<()> {
    use rand::Rng;
    use std::io::Write;
    use std::time::{Duration, Instant};

    if read_pct as u16 + write_pct as u16 != 100 {
        return Err(StorageError::ConfigError(format!(
            "Read and write percentages must sum to 100 (got {})",
            read_pct as u16 + write_pct as u16
        ))
        .into());
    }
    if keys == 0 {
        return Err(StorageError::ConfigError("--keys must be at least 1".to_string()).into());
    }

    println!("=== ringKV Benchmark ===");
    println!("Configuration:");
    println!("  Total keys: {}", keys);
    println!("  Read percentage: {}%", read_pct);
    println!("  Write percentage: {}%", write_pct);
    println!("  Duration: {} seconds", duration);
    println!("  Data path: {}", path.display());
    println!();

    // The benchmark measures the storage engine, so it bypasses routing.
    let session = Session::open(&path)?;
    let engine = session.node.engine().clone();

    println!("Populating initial data...");
    for i in 0..keys {
        let key = format!("bench_key_{:010}", i);
        let value = format!("bench_value_{:010}", i);
        let bucket = format!("{}", i % 16);
        engine.set_with_index(key.as_bytes(), value.as_bytes(), "bucket", bucket.as_bytes())?;

        if (i + 1) % 10000 == 0 {
            println!("  Populated {} / {} keys", i + 1, keys);
        }
    }
    println!("✓ Initial data populated\n");
    println!("Running benchmark...");

    let start_time = Instant::now();
    let duration_secs = Duration::from_secs(duration);
    let mut rng = rand::thread_rng();
    let mut operation_count = 0u64;
    let mut read_count = 0u64;
    let mut write_count = 0u64;

    while start_time.elapsed() < duration_secs {
        let key_idx = rng.gen_range(0..keys);
        let key = format!("bench_key_{:010}", key_idx);

        if rng.gen_range(0..100) < read_pct {
            if rng.gen_range(0..10) == 0 {
                let bucket = format!("{}", key_idx % 16);
                engine.get_by_index("bucket", bucket.as_bytes())?;
            } else {
                match engine.get(key.as_bytes()) {
                    Ok(_) | Err(StorageError::KeyNotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            read_count += 1;
        } else {
            let value = format!("updated_value_{:010}_{}", key_idx, operation_count);
            engine.set(key.as_bytes(), value.as_bytes())?;
            write_count += 1;
        }

        operation_count += 1;
        if operation_count % 10000 == 0 {
            let elapsed = start_time.elapsed().as_secs_f64();
            print!(
                "\r  Operations: {} | Throughput: {:.0} ops/sec",
                operation_count,
                operation_count as f64 / elapsed
            );
            let _ = std::io::stdout().flush();
        }
    }

    let elapsed = start_time.elapsed().as_secs_f64();
    let total = operation_count.max(1) as f64;

    println!("\n\n=== Benchmark Results ===");
    println!("Duration: {:.2} seconds", elapsed);
    println!("Total operations: {}", operation_count);
    println!("  Reads: {} ({:.1}%)", read_count, read_count as f64 / total * 100.0);
    println!("  Writes: {} ({:.1}%)", write_count, write_count as f64 / total * 100.0);
    println!("Throughput: {:.0} ops/sec", operation_count as f64 / elapsed.max(f64::EPSILON));
    println!();

    let report = engine.metrics().report();
    println!("Latency Percentiles (microseconds):");
    for (operation, p) in &report.operation_latencies {
        println!("  {} ({} ops):", operation, p.count);
        println!("    p50: {:.2} µs", p.p50);
        println!("    p95: {:.2} µs", p.p95);
        println!("    p99: {:.2} µs", p.p99);
    }
    println!();
    println!("System Metrics:");
    println!("  fsync calls: {}", report.fsync_count);
    println!("  memtable flushes: {}", report.flush_count);
    println!("  compactions: {}", report.compaction_count);

    drop(engine);
    session.finish().await
}

/// Load `<data_dir>/config.json`, pointing storage at `data_dir` itself.
fn load_config_from_path(data_dir: &Path) -> Result<NodeConfig> {
    let config_path = NodeConfig::path_in(data_dir);
    if !config_path.exists() {
        return Err(StorageError::ConfigError(format!(
            "Configuration file not found at {}. Run 'ringkv init --path {}' first.",
            config_path.display(),
            data_dir.display()
        ))
        .into());
    }

    let mut config = NodeConfig::load(data_dir)?;
    config.storage.data_dir = data_dir.to_path_buf();
    Ok(config)
}
