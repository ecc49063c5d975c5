use crate::checksum::ChecksumAlgorithm;
use crate::entry::{read_u32, read_u64, SstEntry, MAX_KEY_LEN, SST_ENTRY_HEADER};
use crate::error::{Result, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

mod bloom;
pub use bloom::BloomFilter;

/// SST file header size (64 bytes)
const HEADER_SIZE: usize = 64;
/// Data block size (64KB)
const DATA_BLOCK_SIZE: usize = 64 * 1024;
/// Target false positive rate of each table's bloom filter
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
/// Largest index block accepted when loading a table
const MAX_INDEX_SIZE: usize = 64 * 1024 * 1024;
/// Largest single data block accepted when reading
const MAX_BLOCK_SIZE: u32 = 32 * 1024 * 1024;

/// A key with its value, or `None` for a tombstone.
pub type KvEntry = (Vec<u8>, Option<Vec<u8>>);

/// Metadata of one immutable sorted table.
///
/// Tables are totally ordered by `id`: a higher id always holds newer data.
#[derive(Debug, Clone)]
pub struct SstFile {
    pub id: u64,
    pub path: PathBuf,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub num_entries: u64,
    /// Highest WAL sequence number whose writes are in this table
    pub max_sequence: u64,
    pub size: u64,
    bloom_filter: Arc<BloomFilter>,
    index: Arc<Vec<IndexEntry>>,
}

impl SstFile {
    /// Check if a key might exist in this SST file using bloom filter
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom_filter.may_contain(key)
    }

    /// Check if a key is within the range of this SST file
    pub fn in_range(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }

    /// Whether any key in `[start, end)` can be in this table.
    fn overlaps(&self, start: &[u8], end: Option<&[u8]>) -> bool {
        self.max_key.as_slice() >= start && end.map_or(true, |end| self.min_key.as_slice() < end)
    }

    /// Index of the block that could hold `key`, if any.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        let after = self
            .index
            .partition_point(|entry| entry.first_key.as_slice() <= key);
        after.checked_sub(1)
    }
}

/// SST file header
#[derive(Debug)]
struct SstHeader {
    num_entries: u64,
    index_offset: u64,
    bloom_offset: u64,
    min_key_len: u32,
    max_key_len: u32,
    max_sequence: u64,
}

impl SstHeader {
    const MAGIC: u32 = 0x524B_5354; // "RKST"
    const VERSION: u32 = 1;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&Self::MAGIC.to_le_bytes());
        buf.extend_from_slice(&Self::VERSION.to_le_bytes());
        buf.extend_from_slice(&self.num_entries.to_le_bytes());
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.bloom_offset.to_le_bytes());
        buf.extend_from_slice(&self.min_key_len.to_le_bytes());
        buf.extend_from_slice(&self.max_key_len.to_le_bytes());
        buf.extend_from_slice(&self.max_sequence.to_le_bytes());
        buf.resize(HEADER_SIZE, 0);
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::SerializationError(
                "Header data too short".to_string(),
            ));
        }

        let magic = read_u32(data, 0)?;
        if magic != Self::MAGIC {
            return Err(StorageError::SerializationError(format!(
                "Invalid SST magic number: {:#x}",
                magic
            )));
        }
        let version = read_u32(data, 4)?;
        if version != Self::VERSION {
            return Err(StorageError::SerializationError(format!(
                "Unsupported SST version: {}",
                version
            )));
        }

        let header = Self {
            num_entries: read_u64(data, 8)?,
            index_offset: read_u64(data, 16)?,
            bloom_offset: read_u64(data, 24)?,
            min_key_len: read_u32(data, 32)?,
            max_key_len: read_u32(data, 36)?,
            max_sequence: read_u64(data, 40)?,
        };

        if header.min_key_len as usize > MAX_KEY_LEN || header.max_key_len as usize > MAX_KEY_LEN {
            return Err(StorageError::SerializationError(format!(
                "Invalid key lengths in SST header: min={}, max={} (max allowed: {})",
                header.min_key_len, header.max_key_len, MAX_KEY_LEN
            )));
        }
        if header.bloom_offset > header.index_offset {
            return Err(StorageError::SerializationError(
                "SST bloom filter located after index".to_string(),
            ));
        }

        Ok(header)
    }
}

/// Index entry mapping the first key of a data block to its location
#[derive(Debug, Clone)]
struct IndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    size: u32,
}

impl IndexEntry {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.first_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.first_key);
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
    }

    fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        let key_len = read_u32(data, 0)? as usize;
        if key_len > MAX_KEY_LEN {
            return Err(StorageError::SerializationError(format!(
                "Invalid key length in index entry: {} (max allowed: {})",
                key_len, MAX_KEY_LEN
            )));
        }

        let first_key = data
            .get(4..4 + key_len)
            .ok_or_else(|| {
                StorageError::SerializationError("Index entry data too short for key".to_string())
            })?
            .to_vec();
        let offset = read_u64(data, 4 + key_len)?;
        let size = read_u32(data, 12 + key_len)?;

        Ok((
            Self {
                first_key,
                offset,
                size,
            },
            16 + key_len,
        ))
    }
}

/// Owns the set of sorted tables of one data directory.
///
/// The table list sits behind an `RwLock`: reads hold it shared while they
/// touch table files, and flush or compaction swap tables under the exclusive
/// lock, so a reader never sees a table disappear mid-lookup.
pub struct SstManager {
    sst_dir: PathBuf,
    /// Live tables, oldest first
    files: RwLock<Vec<SstFile>>,
    checksum_algo: ChecksumAlgorithm,
    next_id: AtomicU64,
}

impl SstManager {
    /// Open `sst_dir`, creating it if needed, and load every table in it.
    ///
    /// Leftover temporary files from an interrupted compaction are removed.
    pub fn open(sst_dir: PathBuf, checksum_algo: ChecksumAlgorithm) -> Result<Self> {
        fs::create_dir_all(&sst_dir)?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&sst_dir)? {
            let path = entry?.path();
            match path.extension().and_then(|s| s.to_str()) {
                Some("sst") => {
                    let Some(id) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.parse::<u64>().ok())
                    else {
                        tracing::warn!("Ignoring unrecognised file {:?}", path);
                        continue;
                    };
                    files.push(load_table(id, path)?);
                }
                Some("tmp") => {
                    tracing::warn!("Removing incomplete table {:?}", path);
                    fs::remove_file(&path)?;
                }
                _ => {}
            }
        }
        files.sort_by_key(|f| f.id);

        let next_id = files.last().map_or(1, |f| f.id + 1);
        tracing::info!("Loaded {} sorted tables from {:?}", files.len(), sst_dir);

        Ok(Self {
            sst_dir,
            files: RwLock::new(files),
            checksum_algo,
            next_id: AtomicU64::new(next_id),
        })
    }

    fn table_path(&self, id: u64) -> PathBuf {
        self.sst_dir.join(format!("{:08}.sst", id))
    }

    /// Write a new table from sorted entries and make it the newest table.
    pub fn write_sst(&self, entries: &[KvEntry], max_sequence: u64) -> Result<SstFile> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.table_path(id);
        let sst_file = self.write_table(id, &path, entries, max_sequence)?;

        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sst_file.clone());

        tracing::info!(
            "Wrote sorted table {:?} ({} entries, {} bytes)",
            sst_file.path,
            sst_file.num_entries,
            sst_file.size
        );
        Ok(sst_file)
    }

    /// Write `entries` to a table file at `path` without registering it.
    fn write_table(
        &self,
        id: u64,
        path: &Path,
        entries: &[KvEntry],
        max_sequence: u64,
    ) -> Result<SstFile> {
        let (min_key, max_key) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.0.clone(), last.0.clone()),
            _ => {
                return Err(StorageError::SerializationError(
                    "Cannot write empty SST file".to_string(),
                ))
            }
        };

        let mut bloom_filter = BloomFilter::new(entries.len(), BLOOM_FALSE_POSITIVE_RATE);
        for (key, _) in entries {
            bloom_filter.insert(key);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        // Header is rewritten once offsets are known.
        writer.write_all(&[0u8; HEADER_SIZE])?;
        writer.write_all(&min_key)?;
        writer.write_all(&max_key)?;
        let mut offset = (HEADER_SIZE + min_key.len() + max_key.len()) as u64;

        let mut index = Vec::new();
        let mut block = Vec::with_capacity(DATA_BLOCK_SIZE);
        let mut block_first_key: Option<&[u8]> = None;

        for (key, value) in entries {
            let serialized = SstEntry::new(key.clone(), value.clone()).serialize(self.checksum_algo);

            if !block.is_empty() && block.len() + serialized.len() > DATA_BLOCK_SIZE {
                if let Some(first_key) = block_first_key.take() {
                    writer.write_all(&block)?;
                    index.push(IndexEntry {
                        first_key: first_key.to_vec(),
                        offset,
                        size: block.len() as u32,
                    });
                    offset += block.len() as u64;
                    block.clear();
                }
            }

            if block_first_key.is_none() {
                block_first_key = Some(key.as_slice());
            }
            block.extend_from_slice(&serialized);
        }
        if let Some(first_key) = block_first_key {
            writer.write_all(&block)?;
            index.push(IndexEntry {
                first_key: first_key.to_vec(),
                offset,
                size: block.len() as u32,
            });
            offset += block.len() as u64;
        }

        let bloom_offset = offset;
        let bloom_data = bloom_filter.serialize();
        writer.write_all(&bloom_data)?;

        let index_offset = bloom_offset + bloom_data.len() as u64;
        let mut index_data = Vec::new();
        for entry in &index {
            entry.serialize_into(&mut index_data);
        }
        writer.write_all(&index_data)?;
        let size = index_offset + index_data.len() as u64;

        let header = SstHeader {
            num_entries: entries.len() as u64,
            index_offset,
            bloom_offset,
            min_key_len: min_key.len() as u32,
            max_key_len: max_key.len() as u32,
            max_sequence,
        };
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&header.serialize())?;

        let file = writer
            .into_inner()
            .map_err(|e| StorageError::IoError(e.into_error()))?;
        file.sync_all()?;

        Ok(SstFile {
            id,
            path: path.to_path_buf(),
            min_key,
            max_key,
            num_entries: entries.len() as u64,
            max_sequence,
            size,
            bloom_filter: Arc::new(bloom_filter),
            index: Arc::new(index),
        })
    }

    /// Newest version of `key` across all tables.
    ///
    /// `Some` with a `None` value means the newest version is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<SstEntry>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        for file in files.iter().rev() {
            if let Some(entry) = self.read(file, key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Read `key` from a single table.
    pub fn read(&self, file: &SstFile, key: &[u8]) -> Result<Option<SstEntry>> {
        if !file.in_range(key) || !file.may_contain(key) {
            return Ok(None);
        }
        let Some(block_idx) = file.block_for(key) else {
            return Ok(None);
        };

        let mut f = File::open(&file.path)?;
        let block = self.read_block(&mut f, file, block_idx)?;

        let mut offset = 0;
        while offset < block.len() {
            let (entry, used) = self.decode_entry(file, &block, offset)?;
            if entry.key.as_slice() == key {
                return Ok(Some(entry));
            }
            if entry.key.as_slice() > key {
                break;
            }
            offset += used;
        }
        Ok(None)
    }

    /// Entries of one table with `start <= key < end`, tombstones included.
    pub fn scan(&self, file: &SstFile, start: &[u8], end: Option<&[u8]>) -> Result<Vec<KvEntry>> {
        let mut results = Vec::new();
        if file.num_entries == 0 || !file.overlaps(start, end) {
            return Ok(results);
        }

        let first_block = file.block_for(start).unwrap_or(0);
        let mut f = File::open(&file.path)?;

        for block_idx in first_block..file.index.len() {
            let block = self.read_block(&mut f, file, block_idx)?;
            let mut offset = 0;
            while offset < block.len() {
                let (entry, used) = self.decode_entry(file, &block, offset)?;
                offset += used;

                if entry.key.as_slice() < start {
                    continue;
                }
                if end.map_or(false, |end| entry.key.as_slice() >= end) {
                    return Ok(results);
                }
                results.push((entry.key, entry.value));
            }
        }
        Ok(results)
    }

    /// Range scan across every table, keeping only the newest version of each
    /// key. Tombstones are returned so the caller can layer the memtable on top.
    pub fn scan_all(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<KvEntry>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut merged = std::collections::BTreeMap::new();
        // Oldest first, so newer tables overwrite.
        for file in files.iter() {
            for (key, value) in self.scan(file, start, end)? {
                merged.insert(key, value);
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Every entry of one table, in key order.
    pub fn read_all(&self, file: &SstFile) -> Result<Vec<KvEntry>> {
        self.scan(file, &[], None)
    }

    fn read_block(&self, f: &mut File, file: &SstFile, block_idx: usize) -> Result<Vec<u8>> {
        let block = &file.index[block_idx];
        if block.size > MAX_BLOCK_SIZE {
            return Err(StorageError::CorruptedData {
                file: file.path.clone(),
                offset: block.offset,
            });
        }
        f.seek(SeekFrom::Start(block.offset))?;
        let mut data = vec![0u8; block.size as usize];
        f.read_exact(&mut data)?;
        Ok(data)
    }

    fn decode_entry(&self, file: &SstFile, block: &[u8], offset: usize) -> Result<(SstEntry, usize)> {
        if block.len() - offset < SST_ENTRY_HEADER {
            return Err(StorageError::CorruptedData {
                file: file.path.clone(),
                offset: offset as u64,
            });
        }
        SstEntry::deserialize(&block[offset..], self.checksum_algo).map_err(|e| match e {
            StorageError::ChecksumMismatch { .. } => e,
            _ => StorageError::CorruptedData {
                file: file.path.clone(),
                offset: offset as u64,
            },
        })
    }

    /// Replace a run of tables with their merged contents.
    ///
    /// `inputs` must be adjacent in age order. The merged table is written to a
    /// temporary file and renamed over the newest input, so it inherits that
    /// id and age ordering survives restarts. When `entries` is empty the
    /// inputs are simply dropped.
    pub fn replace_tables(&self, inputs: &[SstFile], entries: &[KvEntry]) -> Result<Option<SstFile>> {
        let Some(newest) = inputs.iter().max_by_key(|f| f.id) else {
            return Ok(None);
        };
        let max_sequence = inputs.iter().map(|f| f.max_sequence).max().unwrap_or(0);

        let output = if entries.is_empty() {
            None
        } else {
            let tmp_path = newest.path.with_extension("tmp");
            let mut table = self.write_table(newest.id, &tmp_path, entries, max_sequence)?;
            table.path = newest.path.clone();
            Some((tmp_path, table))
        };

        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((tmp_path, _)) = &output {
            fs::rename(tmp_path, &newest.path)?;
        }

        // The newest input's path now holds the merged table.
        let input_ids: Vec<u64> = inputs.iter().map(|f| f.id).collect();
        files.retain(|f| !input_ids.contains(&f.id));
        let output = output.map(|(_, table)| table);
        if let Some(table) = &output {
            let pos = files.partition_point(|f| f.id < table.id);
            files.insert(pos, table.clone());
        }
        drop(files);

        for input in inputs.iter().filter(|f| f.id != newest.id || output.is_none()) {
            match fs::remove_file(&input.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "Failed to remove compacted table {:?}: {}",
                    input.path,
                    e
                ),
            }
        }
        Ok(output)
    }

    /// Get all SST files, oldest first
    pub fn get_all_files(&self) -> Vec<SstFile> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Highest sequence number persisted in any table.
    pub fn max_sequence(&self) -> u64 {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|f| f.max_sequence)
            .max()
            .unwrap_or(0)
    }
}

fn load_table(id: u64, path: PathBuf) -> Result<SstFile> {
    let data = fs::read(&path)?;
    let corrupted = |offset: usize| StorageError::CorruptedData {
        file: path.clone(),
        offset: offset as u64,
    };

    let header = SstHeader::deserialize(&data)?;
    let keys_end = HEADER_SIZE + header.min_key_len as usize + header.max_key_len as usize;
    let bloom_offset = header.bloom_offset as usize;
    let index_offset = header.index_offset as usize;
    if keys_end > bloom_offset || index_offset > data.len() {
        return Err(corrupted(HEADER_SIZE));
    }
    if data.len() - index_offset > MAX_INDEX_SIZE {
        return Err(StorageError::SerializationError(format!(
            "Invalid index size in SST file: {} (max allowed: {})",
            data.len() - index_offset,
            MAX_INDEX_SIZE
        )));
    }

    let min_key = data[HEADER_SIZE..HEADER_SIZE + header.min_key_len as usize].to_vec();
    let max_key = data[HEADER_SIZE + header.min_key_len as usize..keys_end].to_vec();
    let bloom_filter = BloomFilter::deserialize(&data[bloom_offset..index_offset])?;

    let mut index = Vec::new();
    let mut offset = index_offset;
    while offset < data.len() {
        let (entry, used) =
            IndexEntry::deserialize(&data[offset..]).map_err(|_| corrupted(offset))?;
        if entry.offset + entry.size as u64 > header.bloom_offset {
            return Err(corrupted(offset));
        }
        index.push(entry);
        offset += used;
    }

    Ok(SstFile {
        id,
        path,
        min_key,
        max_key,
        num_entries: header.num_entries,
        max_sequence: header.max_sequence,
        size: data.len() as u64,
        bloom_filter: Arc::new(bloom_filter),
        index: Arc::new(index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_manager() -> (SstManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let manager =
            SstManager::open(temp_dir.path().join("sst"), ChecksumAlgorithm::CRC32).unwrap();
        (manager, temp_dir)
    }

    fn put(key: &str, value: &str) -> KvEntry {
        (key.as_bytes().to_vec(), Some(value.as_bytes().to_vec()))
    }

    #[test]
    fn test_write_and_read_sst() {
        let (manager, _temp_dir) = create_test_manager();

        let entries = vec![put("key1", "value1"), put("key2", "value2"), put("key3", "value3")];
        let sst_file = manager.write_sst(&entries, 3).unwrap();

        assert_eq!(sst_file.min_key, b"key1");
        assert_eq!(sst_file.max_key, b"key3");
        assert_eq!(sst_file.num_entries, 3);
        assert_eq!(manager.max_sequence(), 3);

        let entry = manager.read(&sst_file, b"key2").unwrap().unwrap();
        assert_eq!(entry.value, Some(b"value2".to_vec()));
        assert!(manager.read(&sst_file, b"key4").unwrap().is_none());
        assert!(manager.read(&sst_file, b"key0").unwrap().is_none());
    }

    #[test]
    fn test_multi_block_lookup_and_scan() {
        let (manager, _temp_dir) = create_test_manager();

        let entries: Vec<KvEntry> = (0..300)
            .map(|i| (format!("key_{:04}", i).into_bytes(), Some(vec![b'v'; 1000])))
            .collect();
        let sst_file = manager.write_sst(&entries, 1).unwrap();
        assert!(sst_file.index.len() > 1, "expected several data blocks");

        for i in [0, 64, 65, 150, 299] {
            let key = format!("key_{:04}", i).into_bytes();
            let entry = manager.read(&sst_file, &key).unwrap();
            assert_eq!(entry.unwrap().value.unwrap().len(), 1000);
        }

        let results = manager
            .scan(&sst_file, b"key_0060", Some(&b"key_0070"[..]))
            .unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].0, b"key_0060");
        assert_eq!(results[9].0, b"key_0069");
    }

    #[test]
    fn test_tombstone_and_empty_value() {
        let (manager, _temp_dir) = create_test_manager();

        let entries = vec![
            put("key1", "value1"),
            (b"key2".to_vec(), None),
            (b"key3".to_vec(), Some(Vec::new())),
        ];
        let sst_file = manager.write_sst(&entries, 1).unwrap();

        assert!(manager.read(&sst_file, b"key2").unwrap().unwrap().is_tombstone());
        assert_eq!(
            manager.read(&sst_file, b"key3").unwrap().unwrap().value,
            Some(Vec::new())
        );

        let all = manager.read_all(&sst_file).unwrap();
        assert_eq!(all, entries);
    }

    #[test]
    fn test_get_prefers_newest_table() {
        let (manager, _temp_dir) = create_test_manager();

        manager.write_sst(&[put("a", "old"), put("b", "old")], 1).unwrap();
        manager.write_sst(&[put("a", "new"), (b"b".to_vec(), None)], 2).unwrap();

        assert_eq!(manager.get(b"a").unwrap().unwrap().value, Some(b"new".to_vec()));
        assert!(manager.get(b"b").unwrap().unwrap().is_tombstone());
        assert!(manager.get(b"c").unwrap().is_none());

        let merged = manager.scan_all(b"", None).unwrap();
        assert_eq!(merged, vec![put("a", "new"), (b"b".to_vec(), None)]);
    }

    #[test]
    fn test_reload_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let sst_dir = temp_dir.path().join("sst");
        {
            let manager = SstManager::open(sst_dir.clone(), ChecksumAlgorithm::XXH64).unwrap();
            manager.write_sst(&[put("k1", "v1")], 4).unwrap();
            manager.write_sst(&[put("k1", "v2")], 9).unwrap();
        }
        fs::write(sst_dir.join("00000003.tmp"), b"partial").unwrap();

        let manager = SstManager::open(sst_dir.clone(), ChecksumAlgorithm::XXH64).unwrap();
        assert_eq!(manager.file_count(), 2);
        assert_eq!(manager.max_sequence(), 9);
        assert_eq!(manager.get(b"k1").unwrap().unwrap().value, Some(b"v2".to_vec()));
        assert!(!sst_dir.join("00000003.tmp").exists());

        let next = manager.write_sst(&[put("k2", "v")], 10).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_replace_tables_keeps_newest_id() {
        let (manager, _temp_dir) = create_test_manager();

        let t1 = manager.write_sst(&[put("a", "1")], 1).unwrap();
        let t2 = manager.write_sst(&[put("b", "2")], 2).unwrap();
        let t3 = manager.write_sst(&[put("c", "3")], 3).unwrap();

        let merged = vec![put("a", "1"), put("b", "2")];
        let output = manager
            .replace_tables(&[t1.clone(), t2.clone()], &merged)
            .unwrap()
            .unwrap();

        assert_eq!(output.id, t2.id);
        assert_eq!(output.path, t2.path);
        assert!(!t1.path.exists());

        let ids: Vec<u64> = manager.get_all_files().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![t2.id, t3.id]);
        assert_eq!(manager.get(b"a").unwrap().unwrap().value, Some(b"1".to_vec()));
    }

    #[test]
    fn test_replace_tables_survives_failed_input_removal() {
        let (manager, _temp_dir) = create_test_manager();

        let t1 = manager.write_sst(&[put("a", "1")], 1).unwrap();
        let t2 = manager.write_sst(&[put("b", "2")], 2).unwrap();

        // A non-empty directory at t1's path makes its removal fail.
        fs::remove_file(&t1.path).unwrap();
        fs::create_dir(&t1.path).unwrap();
        fs::write(t1.path.join("pinned"), b"x").unwrap();

        let merged = vec![put("a", "1"), put("b", "22")];
        let output = manager
            .replace_tables(&[t1.clone(), t2.clone()], &merged)
            .unwrap()
            .unwrap();

        assert_eq!(output.id, t2.id);
        let ids: Vec<u64> = manager.get_all_files().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![t2.id]);
        assert_eq!(manager.get(b"a").unwrap().unwrap().value, Some(b"1".to_vec()));
        assert_eq!(manager.get(b"b").unwrap().unwrap().value, Some(b"22".to_vec()));
    }

    #[test]
    fn test_replace_tables_with_nothing_left() {
        let (manager, _temp_dir) = create_test_manager();
        let t1 = manager.write_sst(&[(b"a".to_vec(), None)], 1).unwrap();
        let t2 = manager.write_sst(&[(b"b".to_vec(), None)], 2).unwrap();

        assert!(manager.replace_tables(&[t1.clone(), t2.clone()], &[]).unwrap().is_none());
        assert_eq!(manager.file_count(), 0);
        assert!(!t1.path.exists() && !t2.path.exists());
    }

    #[test]
    fn test_checksum_verification() {
        let (manager, _temp_dir) = create_test_manager();

        let entries = vec![put("key1", "value1"), put("key2", "value2"), put("key3", "value3")];
        let sst_file = manager.write_sst(&entries, 1).unwrap();

        // Flip a byte inside the first entry's value.
        let pos = HEADER_SIZE + 4 + 4 + SST_ENTRY_HEADER + 4 + 2;
        let mut data = fs::read(&sst_file.path).unwrap();
        data[pos] ^= 0xFF;
        fs::write(&sst_file.path, &data).unwrap();

        assert!(manager.read(&sst_file, b"key1").is_err());
    }

    #[test]
    fn test_write_empty_rejected() {
        let (manager, _temp_dir) = create_test_manager();
        assert!(manager.write_sst(&[], 1).is_err());
    }
}
