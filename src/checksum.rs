//! Checksums guarding WAL batches and sorted-table entries.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Seed used for XXH64 checksums. Changing it invalidates every file on disk.
const XXH64_SEED: u64 = 0;

/// Checksum algorithm used for on-disk records.
///
/// The algorithm is fixed per data directory: it is stored in `config.json`
/// and must not change once data has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    CRC32,
    XXH64,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::CRC32
    }
}

impl ChecksumAlgorithm {
    /// Compute a 32-bit checksum of `data`.
    ///
    /// XXH64 is truncated to its lower 32 bits so both algorithms share the
    /// same record layout.
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            ChecksumAlgorithm::CRC32 => crc32fast::hash(data),
            ChecksumAlgorithm::XXH64 => (xxh64(data, XXH64_SEED) & 0xFFFF_FFFF) as u32,
        }
    }

    /// Verify `data` against an expected checksum.
    pub fn verify(&self, data: &[u8], expected: u32) -> Result<()> {
        let actual = self.compute(data);
        if actual == expected {
            Ok(())
        } else {
            Err(StorageError::ChecksumMismatch { expected, actual })
        }
    }
}
