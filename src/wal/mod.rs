use crate::checksum::ChecksumAlgorithm;
use crate::config::Config;
use crate::entry::WalBatch;
use crate::error::{Result, StorageError};
use crate::metrics::Metrics;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// WAL segment representing a single WAL file
pub struct WalSegment {
    /// Segment file ID
    file_id: u32,
    /// Path to the segment file
    path: PathBuf,
    /// File handle, opened for appending
    file: File,
    /// Current write offset in the segment
    offset: u64,
    /// Maximum segment size
    max_size: u64,
}

impl WalSegment {
    /// Create a new, empty WAL segment
    pub fn create(wal_dir: &Path, file_id: u32, max_size: u64) -> Result<Self> {
        let path = wal_dir.join(segment_file_name(file_id));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            file_id,
            path,
            file,
            offset: 0,
            max_size,
        })
    }

    /// Append one encoded record. Not durable until [`WalSegment::sync`].
    ///
    /// Writes always start at the end of the last complete record. If the
    /// write fails, whatever part of the record reached the file is cut off
    /// again, so the next append never lands behind a torn record.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        if let Err(e) = self.file.write_all(record) {
            if let Err(truncate_err) = self.truncate(self.offset) {
                // The next append overwrites the torn bytes from `offset`.
                tracing::warn!(
                    "Failed to cut torn record from {:?}: {}",
                    self.path,
                    truncate_err
                );
            }
            return Err(e.into());
        }
        self.offset += record.len() as u64;
        Ok(())
    }

    /// Drop everything from `offset` on.
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.offset = offset;
        Ok(())
    }

    /// Sync the segment's data to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Check if the segment is full
    pub fn is_full(&self) -> bool {
        self.offset >= self.max_size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn segment_file_name(file_id: u32) -> String {
    format!("{:08}.wal", file_id)
}

fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension().and_then(|s| s.to_str()) != Some("wal") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Write-ahead log of atomic batches.
///
/// Every open starts a fresh segment, so a torn record at the tail of an older
/// segment never hides batches written after a restart. Recovery reads the
/// segments in id order.
pub struct WalManager {
    wal_dir: PathBuf,
    /// Segment currently receiving appends
    current: WalSegment,
    /// Older segments, oldest first
    sealed: Vec<PathBuf>,
    next_segment_id: u32,
    segment_size: u64,
    checksum_algo: ChecksumAlgorithm,
    sync_writes: bool,
    /// Set once a sync fails; nothing more is appended after that
    failed: bool,
    /// Metrics collector for fsync accounting
    metrics: Option<Arc<Metrics>>,
}

impl WalManager {
    /// Open the WAL directory of `config`, creating it if needed.
    pub fn open(config: &Config) -> Result<Self> {
        let wal_dir = config.wal_dir();
        fs::create_dir_all(&wal_dir)?;

        let mut existing: Vec<(u32, PathBuf)> = fs::read_dir(&wal_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| parse_segment_id(&p).map(|id| (id, p)))
            .collect();
        existing.sort();

        let next_id = existing.last().map_or(1, |(id, _)| id + 1);
        let current = WalSegment::create(&wal_dir, next_id, config.wal_segment_size)?;

        tracing::debug!(
            "Opened WAL in {:?}: {} existing segments, writing to {:?}",
            wal_dir,
            existing.len(),
            current.path()
        );

        Ok(Self {
            wal_dir,
            current,
            sealed: existing.into_iter().map(|(_, p)| p).collect(),
            next_segment_id: next_id + 1,
            segment_size: config.wal_segment_size,
            checksum_algo: config.checksum_algorithm,
            sync_writes: config.sync_writes,
            failed: false,
            metrics: None,
        })
    }

    /// Set the metrics collector for tracking fsync operations
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    /// Append a batch as a single record.
    ///
    /// With `sync_writes` the segment is synced before returning, so an `Ok`
    /// means the batch survives a crash. Returns the record's offset within
    /// its segment.
    ///
    /// A failed sync leaves the durability of earlier records unknown. The
    /// record is cut off again and the WAL refuses further appends; see
    /// [`WalManager::is_failed`].
    pub fn append(&mut self, batch: &WalBatch) -> Result<u64> {
        if self.failed {
            return Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "WAL is unusable after a failed sync",
            )));
        }
        if self.current.is_full() {
            self.rotate_segment()?;
        }

        let record = batch.serialize(self.checksum_algo);
        let offset = self.current.offset();
        self.current.append(&record)?;

        if self.sync_writes {
            if let Err(e) = self.sync() {
                self.failed = true;
                if let Err(truncate_err) = self.current.truncate(offset) {
                    tracing::error!(
                        "Failed to drop unsynced batch seq={}: {}",
                        batch.sequence,
                        truncate_err
                    );
                }
                return Err(e);
            }
        }

        tracing::debug!(
            "Appended WAL batch seq={} ({} mutations, {} bytes) at offset {}",
            batch.sequence,
            batch.mutations.len(),
            record.len(),
            offset
        );
        Ok(offset)
    }

    /// Sync the current segment
    pub fn sync(&mut self) -> Result<()> {
        self.current.sync()?;
        if let Some(metrics) = &self.metrics {
            metrics.increment_fsync();
        }
        Ok(())
    }

    fn rotate_segment(&mut self) -> Result<()> {
        self.sync()?;

        let new_segment = WalSegment::create(&self.wal_dir, self.next_segment_id, self.segment_size)?;
        self.next_segment_id += 1;

        let old = std::mem::replace(&mut self.current, new_segment);
        tracing::debug!("Rotated WAL segment {:?} -> {:?}", old.path(), self.current.path());
        self.sealed.push(old.path);
        Ok(())
    }

    /// Drop every segment and start over with an empty one.
    ///
    /// Called once the memtable contents are safely in a sorted table.
    pub fn reset(&mut self) -> Result<()> {
        let new_segment = WalSegment::create(&self.wal_dir, self.next_segment_id, self.segment_size)?;
        self.next_segment_id += 1;

        let old = std::mem::replace(&mut self.current, new_segment);
        for path in self.sealed.drain(..).chain(std::iter::once(old.path)) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::IoError(e)),
            }
        }
        tracing::debug!("WAL reset, now writing to {:?}", self.current.path());
        Ok(())
    }

    /// Whether a sync has failed. A failed WAL accepts no more appends.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    #[cfg(test)]
    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Number of segment files, the current one included.
    pub fn segment_count(&self) -> usize {
        self.sealed.len() + 1
    }

    /// Read back every complete batch, oldest first.
    pub fn recover(&self) -> Result<Vec<WalBatch>> {
        let mut batches = Vec::new();
        for path in self.sealed.iter().chain(std::iter::once(&self.current.path)) {
            batches.extend(self.recover_segment(path)?);
        }
        Ok(batches)
    }

    /// Recover batches from a single segment.
    ///
    /// Replay stops at the first record that is cut short or fails its
    /// checksum. Everything before it is returned.
    fn recover_segment(&self, path: &Path) -> Result<Vec<WalBatch>> {
        let data = fs::read(path)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut batches = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            match WalBatch::deserialize(&data[offset..], self.checksum_algo) {
                Ok((batch, used)) => {
                    batches.push(batch);
                    offset += used;
                }
                Err(e) => {
                    tracing::warn!(
                        "WAL corruption detected at offset {} in {:?}: {}; discarding {} trailing bytes",
                        offset,
                        path,
                        e,
                        data.len() - offset
                    );
                    break;
                }
            }
        }

        tracing::info!("Recovered {} batches from WAL segment {:?}", batches.len(), path);
        Ok(batches)
    }
}
