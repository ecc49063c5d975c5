use crate::compaction::Compactor;
use crate::config::Config;
use crate::entry::{Mutation, WalBatch, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::error::{Result, StorageError};
use crate::keys::{self, decode_index_key, encode_index_key, index_prefix, prefix_successor};
use crate::memtable::Memtable;
use crate::metrics::Metrics;
use crate::sst::SstManager;
use crate::wal::WalManager;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;

/// A logical write against the engine.
///
/// Each variant commits as one atomic WAL batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Upsert a primary record.
    Set { key: Vec<u8>, value: Vec<u8> },
    /// Upsert a primary record together with one secondary-index entry.
    SetWithIndex {
        key: Vec<u8>,
        value: Vec<u8>,
        index_name: String,
        index_value: Vec<u8>,
    },
    /// Remove a primary record. Index entries pointing at it are left alone.
    Delete { key: Vec<u8> },
}

impl WriteOp {
    /// The primary key this write targets.
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Set { key, .. }
            | WriteOp::SetWithIndex { key, .. }
            | WriteOp::Delete { key } => key,
        }
    }

    fn operation_name(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::SetWithIndex { .. } => "set_with_index",
            WriteOp::Delete { .. } => "delete",
        }
    }

    /// Validate and expand into store mutations.
    fn to_mutations(&self) -> Result<Vec<Mutation>> {
        keys::validate_primary_key(self.key())?;

        match self {
            WriteOp::Set { key, value } => {
                check_value(value)?;
                Ok(vec![Mutation::put(key.clone(), value.clone())])
            }
            WriteOp::SetWithIndex {
                key,
                value,
                index_name,
                index_value,
            } => {
                check_value(value)?;
                let index_key = encode_index_key(index_name, index_value, key);
                if index_key.len() > MAX_KEY_LEN {
                    return Err(StorageError::InvalidKey {
                        key: key.clone(),
                        reason: "index entry key is too long",
                    });
                }
                Ok(vec![
                    Mutation::put(key.clone(), value.clone()),
                    Mutation::put(index_key, Vec::new()),
                ])
            }
            WriteOp::Delete { key } => Ok(vec![Mutation::delete(key.clone())]),
        }
    }
}

fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(StorageError::ValueTooLarge {
            len: value.len(),
            max: MAX_VALUE_LEN,
        });
    }
    Ok(())
}

/// Local storage engine with primary-key records and secondary indexes.
///
/// Primary records and index entries share one ordered keyspace (see
/// [`crate::keys`]). Underneath sits a small LSM store:
///
/// - **WAL**: every write is appended as one atomic batch before it is applied
/// - **Memtable**: recent writes are buffered in an in-memory skip list
/// - **Sorted tables**: a full memtable is flushed to an immutable table file
/// - **Compaction**: similarly sized adjacent tables are merged after a flush
///
/// The engine knows nothing about cluster topology.
///
/// # Concurrency
///
/// The WAL mutex serializes commits. A batch is applied to the memtable under
/// its write lock, and reads hold the read lock across the memtable and the
/// sorted tables, so a reader never observes half of a batch. Lock order is
/// WAL, then memtable, then the table list.
///
/// # Example
///
/// ```no_run
/// use ringkv::{Config, StorageEngine};
/// use std::path::PathBuf;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = StorageEngine::open(Config::new(PathBuf::from("./data")))?;
///
///     engine.set_with_index(b"user:1", b"Alice", "name", b"alice")?;
///     assert_eq!(engine.get(b"user:1")?, b"Alice".to_vec());
///     assert_eq!(engine.get_by_index("name", b"alice")?, vec![b"user:1".to_vec()]);
///
///     engine.close()?;
///     Ok(())
/// }
/// ```
pub struct StorageEngine {
    config: Config,
    wal: Mutex<WalManager>,
    memtable: RwLock<Memtable>,
    sst_manager: Arc<SstManager>,
    compactor: Compactor,
    /// Sequence number of the next commit
    sequence: AtomicU64,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Opens the engine over `config.data_dir`, creating it if needed.
    ///
    /// Loads the sorted tables, replays the WAL into the memtable and resumes
    /// the sequence after the highest one found on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - Directory creation fails
    /// - A sorted table cannot be loaded
    /// - WAL segments cannot be read
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let metrics = Arc::new(Metrics::new());
        let sst_manager = Arc::new(SstManager::open(config.sst_dir(), config.checksum_algorithm)?);

        let mut wal = WalManager::open(&config)?;
        wal.set_metrics(metrics.clone());

        let memtable = Memtable::new(config.memtable_size);
        let last_sequence = Self::recover(&wal, &memtable, &sst_manager)?;

        let mut compactor = Compactor::new(sst_manager.clone(), config.compaction.clone());
        compactor.set_metrics(metrics.clone());

        let engine = Self {
            config,
            wal: Mutex::new(wal),
            memtable: RwLock::new(memtable),
            sst_manager,
            compactor,
            sequence: AtomicU64::new(last_sequence + 1),
            metrics,
            closed: AtomicBool::new(false),
        };

        if engine.read_memtable().is_full() {
            engine.flush()?;
        }

        tracing::info!(
            "Storage engine opened at {:?}, next sequence {}",
            engine.config.data_dir,
            last_sequence + 1
        );
        Ok(engine)
    }

    /// Replay the WAL into `memtable`. Returns the highest sequence seen on
    /// disk.
    fn recover(wal: &WalManager, memtable: &Memtable, sst_manager: &SstManager) -> Result<u64> {
        tracing::info!("Starting crash recovery...");

        let batches = wal.recover()?;
        let mut max_seq = sst_manager.max_sequence();
        let mut mutations = 0usize;
        for batch in &batches {
            memtable.apply(batch);
            max_seq = max_seq.max(batch.sequence);
            mutations += batch.mutations.len();
        }

        tracing::info!(
            "Crash recovery complete: {} batches ({} mutations) replayed over {} sorted tables",
            batches.len(),
            mutations,
            sst_manager.file_count()
        );
        Ok(max_seq)
    }

    fn lock_wal(&self) -> MutexGuard<'_, WalManager> {
        self.wal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_memtable(&self) -> RwLockReadGuard<'_, Memtable> {
        self.memtable.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Inserts or updates a primary record.
    ///
    /// # Errors
    ///
    /// `InvalidKey` for an empty key or one inside the reserved index
    /// namespace, `IoError` if the WAL append fails.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(&WriteOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .map(|_| ())
    }

    /// Upserts a primary record and an index entry for
    /// `(index_name, index_value)` as one atomic batch.
    ///
    /// No reader can observe the record without the index entry or the other
    /// way round, and after a crash either both are recovered or neither.
    ///
    /// ```no_run
    /// # use ringkv::{Config, StorageEngine};
    /// # use std::path::PathBuf;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let engine = StorageEngine::open(Config::new(PathBuf::from("./data")))?;
    /// engine.set_with_index(b"car:1", b"{...}", "color", b"red")?;
    /// engine.set_with_index(b"car:2", b"{...}", "color", b"red")?;
    /// assert_eq!(engine.get_by_index("color", b"red")?.len(), 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_with_index(
        &self,
        key: &[u8],
        value: &[u8],
        index_name: &str,
        index_value: &[u8],
    ) -> Result<()> {
        self.apply(&WriteOp::SetWithIndex {
            key: key.to_vec(),
            value: value.to_vec(),
            index_name: index_name.to_string(),
            index_value: index_value.to_vec(),
        })
        .map(|_| ())
    }

    /// Removes the primary record for `key`.
    ///
    /// Index entries that reference `key` are not touched, so
    /// [`StorageEngine::get_by_index`] may keep returning it. Deleting a
    /// missing key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.apply(&WriteOp::Delete { key: key.to_vec() }).map(|_| ())
    }

    /// Commits a write and returns its sequence number.
    pub fn apply(&self, op: &WriteOp) -> Result<u64> {
        self.apply_with(op, |_| {})
    }

    /// Like [`StorageEngine::apply`], but calls `on_commit` with the sequence
    /// number while the commit still holds the WAL lock.
    ///
    /// Calls happen in sequence order, so a hook that queues the write
    /// elsewhere sees writes in commit order. The hook must not block or
    /// call back into the engine.
    pub fn apply_with<F>(&self, op: &WriteOp, on_commit: F) -> Result<u64>
    where
        F: FnOnce(u64),
    {
        let start = Instant::now();
        self.ensure_open()?;
        let mutations = op.to_mutations()?;
        let sequence = self.commit(mutations, on_commit)?;
        self.metrics.record_latency(op.operation_name(), start.elapsed());
        Ok(sequence)
    }

    fn commit<F: FnOnce(u64)>(&self, mutations: Vec<Mutation>, on_commit: F) -> Result<u64> {
        let mut wal = self.lock_wal();
        // A close may have won the race for the WAL lock.
        self.ensure_open()?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let batch = WalBatch::new(sequence, mutations);
        if let Err(e) = wal.append(&batch) {
            if wal.is_failed() {
                self.closed.store(true, Ordering::SeqCst);
                tracing::error!("WAL can no longer be trusted, closing engine: {}", e);
            }
            return Err(e);
        }

        let mut memtable = self.memtable.write().unwrap_or_else(PoisonError::into_inner);
        memtable.apply(&batch);
        on_commit(sequence);

        if memtable.is_full() {
            // The batch is already durable; a failed flush is retried on the
            // next write.
            if let Err(e) = self.flush_locked(&mut wal, &mut memtable) {
                tracing::error!("Memtable flush failed: {}", e);
            }
        }
        Ok(sequence)
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if the key has no live record.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();
        self.ensure_open()?;
        keys::validate_primary_key(key)?;

        let memtable = self.read_memtable();
        let result = self
            .lookup(&memtable, key)?
            .ok_or_else(|| StorageError::KeyNotFound { key: key.to_vec() });
        drop(memtable);

        self.metrics.record_latency("get", start.elapsed());
        result
    }

    /// Primary keys indexed under exactly `(index_name, index_value)`, ordered
    /// by primary-key bytes. Empty when nothing matches.
    ///
    /// Entries whose primary record was deleted are still returned.
    ///
    /// # Errors
    ///
    /// `EncodingError` if a key under the index prefix cannot be decoded,
    /// which means the keyspace is corrupted.
    pub fn get_by_index(&self, index_name: &str, index_value: &[u8]) -> Result<Vec<Vec<u8>>> {
        let start = Instant::now();
        self.ensure_open()?;

        let memtable = self.read_memtable();
        let keys = self.scan_index(&memtable, index_name, index_value)?;
        drop(memtable);

        self.metrics.record_latency("get_by_index", start.elapsed());
        Ok(keys)
    }

    /// Like [`StorageEngine::get_by_index`], but resolves every primary key
    /// and skips entries whose record no longer exists.
    ///
    /// The index scan and the lookups see the same snapshot.
    pub fn get_records_by_index(
        &self,
        index_name: &str,
        index_value: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = Instant::now();
        self.ensure_open()?;

        let memtable = self.read_memtable();
        let mut records = Vec::new();
        for key in self.scan_index(&memtable, index_name, index_value)? {
            match self.lookup(&memtable, &key)? {
                Some(value) => records.push((key, value)),
                None => tracing::debug!("Skipping dangling index entry for {:?}", key),
            }
        }
        drop(memtable);

        self.metrics
            .record_latency("get_records_by_index", start.elapsed());
        Ok(records)
    }

    /// Live value of `key`, memtable first, then sorted tables newest first.
    fn lookup(&self, memtable: &Memtable, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = memtable.get(key) {
            return Ok(entry.value);
        }
        Ok(self.sst_manager.get(key)?.and_then(|entry| entry.value))
    }

    fn scan_index(
        &self,
        memtable: &Memtable,
        index_name: &str,
        index_value: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let prefix = index_prefix(index_name, index_value);
        let entries = self.scan_prefix(memtable, &prefix)?;

        entries
            .into_iter()
            .map(|(key, _)| {
                let decoded = decode_index_key(&key).map_err(|e| {
                    tracing::error!("Corrupted index entry {:?}: {}", key, e);
                    e
                })?;
                if decoded.index_name != index_name || decoded.index_value != index_value {
                    tracing::error!("Index entry {:?} does not match its scan prefix", key);
                    return Err(StorageError::EncodingError(format!(
                        "index entry {:?} decodes to a different index",
                        key
                    )));
                }
                Ok(decoded.primary_key.to_vec())
            })
            .collect()
    }

    /// Live entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, memtable: &Memtable, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end = prefix_successor(prefix);

        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .sst_manager
            .scan_all(prefix, end.as_deref())?
            .into_iter()
            .collect();
        // Memtable is newer than every table.
        for (key, value) in memtable.scan(prefix, end.as_deref()) {
            merged.insert(key, value);
        }

        Ok(merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    /// Forces the memtable into a sorted table and resets the WAL.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let mut wal = self.lock_wal();
        let mut memtable = self.memtable.write().unwrap_or_else(PoisonError::into_inner);
        self.flush_locked(&mut wal, &mut memtable)
    }

    /// Caller holds the WAL lock and the memtable write lock.
    fn flush_locked(&self, wal: &mut WalManager, memtable: &mut Memtable) -> Result<()> {
        if memtable.is_empty() {
            return Ok(());
        }

        let entries = memtable.get_all_entries();
        let max_sequence = memtable.max_sequence().unwrap_or(0);
        let table = self.sst_manager.write_sst(&entries, max_sequence)?;

        memtable.clear();
        wal.reset()?;
        self.metrics.increment_flush();
        tracing::info!(
            "Flushed {} entries to sorted table {}",
            table.num_entries,
            table.id
        );

        if let Err(e) = self.compactor.maybe_compact() {
            tracing::error!("Compaction failed: {}", e);
        }
        Ok(())
    }

    /// Flushes the memtable, syncs the WAL and marks the engine closed.
    ///
    /// Every later operation fails with `Closed`. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut wal = self.lock_wal();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut memtable = self.memtable.write().unwrap_or_else(PoisonError::into_inner);
        self.flush_locked(&mut wal, &mut memtable)?;
        wal.sync()?;
        self.closed.store(true, Ordering::SeqCst);

        tracing::info!("Storage engine at {:?} closed", self.config.data_dir);
        Ok(())
    }

    /// Sequence number of the most recent commit, 0 if there was none.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a reference to the metrics collector.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.lock_wal().sync() {
            tracing::warn!("WAL sync on drop failed: {}", e);
        }
    }
}
