//! On-disk record layouts for WAL batches and sorted-table entries.
//!
//! All integers are little-endian.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Result, StorageError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest key accepted by the store. Index keys count against this too.
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Largest value accepted by the store.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// `[len u32][checksum u32]` in front of every WAL batch payload.
pub const BATCH_HEADER_SIZE: usize = 8;

/// `seq u64, timestamp u64, count u32`.
const BATCH_PAYLOAD_HEADER: usize = 8 + 8 + 4;

/// `op u8, key_len u32, value_len u32`.
const MUTATION_HEADER: usize = 1 + 4 + 4;

/// `checksum u32, key_len u32, value_len u32, kind u8`.
pub const SST_ENTRY_HEADER: usize = 4 + 4 + 4 + 1;

const KIND_VALUE: u8 = 0;
const KIND_TOMBSTONE: u8 = 1;

/// Operation type of a single mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Put = 1,
    Delete = 2,
}

impl OpType {
    /// Convert from u8 to OpType
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OpType::Put),
            2 => Ok(OpType::Delete),
            _ => Err(StorageError::SerializationError(format!(
                "Invalid OpType: {}",
                value
            ))),
        }
    }
}

/// One key-level change inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: OpType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            op: OpType::Put,
            key,
            value,
        }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self {
            op: OpType::Delete,
            key,
            value: Vec::new(),
        }
    }

    fn encoded_len(&self) -> usize {
        MUTATION_HEADER + self.key.len() + self.value.len()
    }
}

/// A group of mutations committed atomically.
///
/// A batch is written to the WAL as a single checksummed record, so recovery
/// either replays all of its mutations or none of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBatch {
    pub sequence: u64,
    pub timestamp: u64,
    pub mutations: Vec<Mutation>,
}

impl WalBatch {
    pub fn new(sequence: u64, mutations: Vec<Mutation>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        Self {
            sequence,
            timestamp,
            mutations,
        }
    }

    /// Serialize to `[len u32][checksum u32][payload]`.
    pub fn serialize(&self, checksum_algo: ChecksumAlgorithm) -> Vec<u8> {
        let payload_len = BATCH_PAYLOAD_HEADER
            + self
                .mutations
                .iter()
                .map(Mutation::encoded_len)
                .sum::<usize>();

        let mut buffer = Vec::with_capacity(BATCH_HEADER_SIZE + payload_len);
        buffer.extend_from_slice(&(payload_len as u32).to_le_bytes());
        // Checksum placeholder
        buffer.extend_from_slice(&[0u8; 4]);

        buffer.extend_from_slice(&self.sequence.to_le_bytes());
        buffer.extend_from_slice(&self.timestamp.to_le_bytes());
        buffer.extend_from_slice(&(self.mutations.len() as u32).to_le_bytes());
        for m in &self.mutations {
            buffer.push(m.op as u8);
            buffer.extend_from_slice(&(m.key.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&(m.value.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&m.key);
            buffer.extend_from_slice(&m.value);
        }

        let checksum = checksum_algo.compute(&buffer[BATCH_HEADER_SIZE..]);
        buffer[4..8].copy_from_slice(&checksum.to_le_bytes());
        buffer
    }

    /// Deserialize one batch from the start of `data`.
    ///
    /// Returns the batch and the number of bytes it occupied. A record that is
    /// cut short or fails its checksum is an error; the caller decides whether
    /// that ends replay.
    pub fn deserialize(data: &[u8], checksum_algo: ChecksumAlgorithm) -> Result<(Self, usize)> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(StorageError::SerializationError(
                "Data too short for WAL batch header".to_string(),
            ));
        }
        let payload_len = read_u32(data, 0)? as usize;
        let checksum = read_u32(data, 4)?;
        let end = BATCH_HEADER_SIZE + payload_len;
        if payload_len < BATCH_PAYLOAD_HEADER || data.len() < end {
            return Err(StorageError::SerializationError(format!(
                "Truncated WAL batch: need {} bytes, have {}",
                end,
                data.len()
            )));
        }

        let payload = &data[BATCH_HEADER_SIZE..end];
        checksum_algo.verify(payload, checksum)?;

        let sequence = read_u64(payload, 0)?;
        let timestamp = read_u64(payload, 8)?;
        let count = read_u32(payload, 16)? as usize;

        let mut offset = BATCH_PAYLOAD_HEADER;
        let mut mutations = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let op = OpType::from_u8(read_u8(payload, offset)?)?;
            let key_len = read_u32(payload, offset + 1)? as usize;
            let value_len = read_u32(payload, offset + 5)? as usize;
            offset += MUTATION_HEADER;

            let key = read_bytes(payload, offset, key_len)?;
            offset += key_len;
            let value = read_bytes(payload, offset, value_len)?;
            offset += value_len;

            mutations.push(Mutation { op, key, value });
        }

        if offset != payload.len() {
            return Err(StorageError::SerializationError(format!(
                "WAL batch has {} trailing bytes",
                payload.len() - offset
            )));
        }

        Ok((
            Self {
                sequence,
                timestamp,
                mutations,
            },
            end,
        ))
    }
}

/// Sorted-table entry. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl SstEntry {
    pub fn new(key: Vec<u8>, value: Option<Vec<u8>>) -> Self {
        Self { key, value }
    }

    /// Serialize the entry
    /// Format: [Checksum: 4B][KeyLen: 4B][ValueLen: 4B][Kind: 1B][Key][Value]
    ///
    /// The kind byte keeps tombstones apart from empty values.
    pub fn serialize(&self, checksum_algo: ChecksumAlgorithm) -> Vec<u8> {
        let (kind, value): (u8, &[u8]) = match &self.value {
            Some(v) => (KIND_VALUE, v),
            None => (KIND_TOMBSTONE, &[]),
        };

        let mut buffer = Vec::with_capacity(self.serialized_size());
        buffer.extend_from_slice(&[0u8; 4]);
        buffer.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buffer.push(kind);
        buffer.extend_from_slice(&self.key);
        buffer.extend_from_slice(value);

        let checksum = checksum_algo.compute(&buffer[4..]);
        buffer[0..4].copy_from_slice(&checksum.to_le_bytes());
        buffer
    }

    /// Deserialize one entry from the start of `data`, returning it with its size.
    pub fn deserialize(data: &[u8], checksum_algo: ChecksumAlgorithm) -> Result<(Self, usize)> {
        if data.len() < SST_ENTRY_HEADER {
            return Err(StorageError::SerializationError(
                "Data too short for SST entry".to_string(),
            ));
        }

        let checksum = read_u32(data, 0)?;
        let key_len = read_u32(data, 4)? as usize;
        let value_len = read_u32(data, 8)? as usize;
        let kind = read_u8(data, 12)?;

        if key_len > MAX_KEY_LEN {
            return Err(StorageError::SerializationError(format!(
                "Invalid key length in SST entry: {} (max allowed: {})",
                key_len, MAX_KEY_LEN
            )));
        }
        if value_len > MAX_VALUE_LEN {
            return Err(StorageError::SerializationError(format!(
                "Invalid value length in SST entry: {} (max allowed: {})",
                value_len, MAX_VALUE_LEN
            )));
        }

        let end = SST_ENTRY_HEADER + key_len + value_len;
        if data.len() < end {
            return Err(StorageError::SerializationError(
                "Invalid key/value lengths".to_string(),
            ));
        }
        checksum_algo.verify(&data[4..end], checksum)?;

        let key = data[SST_ENTRY_HEADER..SST_ENTRY_HEADER + key_len].to_vec();
        let value = match kind {
            KIND_VALUE => Some(data[SST_ENTRY_HEADER + key_len..end].to_vec()),
            KIND_TOMBSTONE => None,
            other => {
                return Err(StorageError::SerializationError(format!(
                    "Invalid SST entry kind: {}",
                    other
                )))
            }
        };

        Ok((Self { key, value }, end))
    }

    pub fn serialized_size(&self) -> usize {
        SST_ENTRY_HEADER + self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset).copied().ok_or_else(|| short_read(offset, 1))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| short_read(offset, 4))
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| short_read(offset, 8))
}

fn read_bytes(data: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
    data.get(offset..offset + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| short_read(offset, len))
}

fn short_read(offset: usize, len: usize) -> StorageError {
    StorageError::SerializationError(format!("Unexpected end of data reading {} bytes at {}", len, offset))
}
