//! Encoding of secondary-index entries into the shared keyspace.
//!
//! Primary records and index entries live in one ordered keyspace. Index entries
//! are kept apart by the reserved [`INDEX_NAMESPACE`] tag, which no primary key
//! may start with. An index entry key is
//!
//! ```text
//! INDEX_NAMESPACE || u32_be(len(name)) || name || u32_be(len(value)) || value || primary_key
//! ```
//!
//! Both variable-length fields carry a length prefix, so the scan prefix of one
//! `(name, value)` pair is never a prefix of another pair's keys, and entries for
//! the same pair sort by primary-key bytes.

use crate::entry::MAX_KEY_LEN;
use crate::error::{Result, StorageError};

/// Tag in front of every index entry key.
pub const INDEX_NAMESPACE: &[u8] = b"\xffidx\x00";

/// Rejects keys that cannot be stored as primary keys.
pub fn validate_primary_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey {
            key: key.to_vec(),
            reason: "key must not be empty",
        });
    }
    if key.starts_with(INDEX_NAMESPACE) {
        return Err(StorageError::InvalidKey {
            key: key.to_vec(),
            reason: "key starts with the reserved index namespace",
        });
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey {
            key: key[..32].to_vec(),
            reason: "key is too long",
        });
    }
    Ok(())
}

/// Everything before the primary key: the range every entry for
/// `(index_name, index_value)` shares.
pub fn index_prefix(index_name: &str, index_value: &[u8]) -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(INDEX_NAMESPACE.len() + 8 + index_name.len() + index_value.len());
    prefix.extend_from_slice(INDEX_NAMESPACE);
    prefix.extend_from_slice(&(index_name.len() as u32).to_be_bytes());
    prefix.extend_from_slice(index_name.as_bytes());
    prefix.extend_from_slice(&(index_value.len() as u32).to_be_bytes());
    prefix.extend_from_slice(index_value);
    prefix
}

/// Full index entry key for `primary_key`.
pub fn encode_index_key(index_name: &str, index_value: &[u8], primary_key: &[u8]) -> Vec<u8> {
    let mut key = index_prefix(index_name, index_value);
    key.extend_from_slice(primary_key);
    key
}

/// Decoded view of an index entry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey<'a> {
    pub index_name: &'a str,
    pub index_value: &'a [u8],
    pub primary_key: &'a [u8],
}

/// Splits an index entry key back into its parts.
pub fn decode_index_key(key: &[u8]) -> Result<IndexKey<'_>> {
    let rest = key.strip_prefix(INDEX_NAMESPACE).ok_or_else(|| {
        StorageError::EncodingError(format!("key {:?} is outside the index namespace", key))
    })?;

    let (name, rest) = split_field(rest, "index name")?;
    let index_name = std::str::from_utf8(name)
        .map_err(|e| StorageError::EncodingError(format!("index name is not UTF-8: {}", e)))?;
    let (index_value, primary_key) = split_field(rest, "index value")?;

    if primary_key.is_empty() {
        return Err(StorageError::EncodingError(
            "index entry has an empty primary key".to_string(),
        ));
    }

    Ok(IndexKey {
        index_name,
        index_value,
        primary_key,
    })
}

fn split_field<'a>(data: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8])> {
    let len_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StorageError::EncodingError(format!("{} length is truncated", what)))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let rest = &data[4..];
    if rest.len() < len {
        return Err(StorageError::EncodingError(format!(
            "{} claims {} bytes but only {} remain",
            what,
            len,
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

/// Smallest key greater than every key starting with `prefix`.
///
/// `None` when no such key exists (the prefix is all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
