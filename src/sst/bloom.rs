use crate::entry::{read_u32, read_u64};
use crate::error::{Result, StorageError};
use xxhash_rust::xxh64::xxh64;

/// Bloom filter for key existence checks.
///
/// Bit positions come from double hashing over two seeded XXH64 digests, so a
/// filter written by one build reads back identically in any other.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

const SEED_A: u64 = 0x5bd1_e995;
const SEED_B: u64 = 0x1b87_3593;

impl BloomFilter {
    /// Create a new Bloom filter with the given capacity and false positive rate
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let num_bits = Self::optimal_num_bits(capacity, false_positive_rate).max(8);
        let num_hashes = Self::optimal_num_hashes(capacity, num_bits);

        Self {
            bits: vec![0u8; (num_bits + 7) / 8],
            num_bits,
            num_hashes,
        }
    }

    fn optimal_num_bits(capacity: usize, false_positive_rate: f64) -> usize {
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let bits = -(capacity as f64 * false_positive_rate.ln()) / ln2_squared;
        bits.ceil() as usize
    }

    fn optimal_num_hashes(capacity: usize, num_bits: usize) -> usize {
        let hashes = (num_bits as f64 / capacity as f64) * std::f64::consts::LN_2;
        (hashes.ceil() as usize).max(1)
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::digests(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// False means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::digests(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    fn digests(key: &[u8]) -> (u64, u64) {
        (xxh64(key, SEED_A), xxh64(key, SEED_B))
    }

    fn bit_index(&self, h1: u64, h2: u64, i: usize) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    /// Format: [NumBits: 8B][NumHashes: 4B][BitsLen: 4B][Bits]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.bits.len());
        buf.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        buf.extend_from_slice(&(self.num_hashes as u32).to_le_bytes());
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(StorageError::SerializationError(
                "Bloom filter data too short".to_string(),
            ));
        }

        let num_bits = read_u64(data, 0)? as usize;
        let num_hashes = read_u32(data, 8)? as usize;
        let bits_len = read_u32(data, 12)? as usize;

        if data.len() < 16 + bits_len {
            return Err(StorageError::SerializationError(
                "Bloom filter bits data too short".to_string(),
            ));
        }
        if num_bits == 0 || num_bits > bits_len * 8 || num_hashes == 0 {
            return Err(StorageError::SerializationError(format!(
                "Invalid bloom filter parameters: bits={}, hashes={}, bytes={}",
                num_bits, num_hashes, bits_len
            )));
        }

        Ok(Self {
            bits: data[16..16 + bits_len].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}
