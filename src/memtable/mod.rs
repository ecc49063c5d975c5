use crate::entry::{OpType, WalBatch};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory buffer for recent writes.
///
/// Entries are kept in key order. A `None` value is a tombstone that shadows
/// older versions of the key in sorted tables.
pub struct Memtable {
    data: SkipMap<Vec<u8>, MemtableEntry>,
    size: AtomicU64,
    max_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableEntry {
    pub value: Option<Vec<u8>>,
    pub sequence: u64,
}

impl Memtable {
    pub fn new(max_size: u64) -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicU64::new(0),
            max_size,
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) {
        self.insert(key, Some(value), seq);
    }

    pub fn delete(&self, key: Vec<u8>, seq: u64) {
        self.insert(key, None, seq);
    }

    /// Apply every mutation of a committed batch.
    ///
    /// Callers hold the engine's memtable write lock, so readers see either
    /// none or all of the batch.
    pub fn apply(&self, batch: &WalBatch) {
        for m in &batch.mutations {
            match m.op {
                OpType::Put => self.put(m.key.clone(), m.value.clone(), batch.sequence),
                OpType::Delete => self.delete(m.key.clone(), batch.sequence),
            }
        }
    }

    fn insert(&self, key: Vec<u8>, value: Option<Vec<u8>>, sequence: u64) {
        // Approximate: overwrites are not subtracted.
        let entry_size = key.len()
            + value.as_ref().map_or(0, Vec::len)
            + std::mem::size_of::<MemtableEntry>();

        self.data.insert(key, MemtableEntry { value, sequence });
        self.size.fetch_add(entry_size as u64, Ordering::Relaxed);
    }

    pub fn get(&self, key: &[u8]) -> Option<MemtableEntry> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Entries with `start <= key < end`, tombstones included. `end: None`
    /// means unbounded.
    pub fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let range: (Bound<&[u8]>, Bound<&[u8]>) = match end {
            Some(end) => (Bound::Included(start), Bound::Excluded(end)),
            None => (Bound::Included(start), Bound::Unbounded),
        };

        self.data
            .range::<[u8], _>(range)
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Get all entries including tombstones for flushing to a sorted table
    pub fn get_all_entries(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Highest sequence number applied, if any.
    pub fn max_sequence(&self) -> Option<u64> {
        self.data.iter().map(|entry| entry.value().sequence).max()
    }

    pub fn is_full(&self) -> bool {
        self.size.load(Ordering::Relaxed) >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn approximate_size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.size.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Mutation;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_and_get() {
        let memtable = Memtable::new(1024 * 1024);

        memtable.put(b"test_key".to_vec(), b"test_value".to_vec(), 1);

        let entry = memtable.get(b"test_key").unwrap();
        assert_eq!(entry.value, Some(b"test_value".to_vec()));
        assert_eq!(entry.sequence, 1);
        assert!(memtable.get(b"nonexistent").is_none());
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let memtable = Memtable::new(1024 * 1024);

        memtable.put(b"delete_key".to_vec(), b"delete_value".to_vec(), 1);
        memtable.delete(b"delete_key".to_vec(), 2);

        let entry = memtable.get(b"delete_key").unwrap();
        assert_eq!(entry.value, None);
        assert_eq!(entry.sequence, 2);
    }

    #[test]
    fn test_empty_value_is_not_a_tombstone() {
        let memtable = Memtable::new(1024 * 1024);
        memtable.put(b"k".to_vec(), Vec::new(), 1);
        assert_eq!(memtable.get(b"k").unwrap().value, Some(Vec::new()));
    }

    #[test]
    fn test_apply_batch() {
        let memtable = Memtable::new(1024 * 1024);
        memtable.put(b"old".to_vec(), b"x".to_vec(), 1);

        let batch = WalBatch::new(
            2,
            vec![
                Mutation::put(b"user".to_vec(), b"alice".to_vec()),
                Mutation::put(b"idx".to_vec(), Vec::new()),
                Mutation::delete(b"old".to_vec()),
            ],
        );
        memtable.apply(&batch);

        assert_eq!(memtable.len(), 3);
        assert_eq!(memtable.get(b"user").unwrap().sequence, 2);
        assert_eq!(memtable.get(b"old").unwrap().value, None);
        assert_eq!(memtable.max_sequence(), Some(2));
    }

    #[test]
    fn test_scan_bounds_and_tombstones() {
        let memtable = Memtable::new(1024 * 1024);

        memtable.put(b"key1".to_vec(), b"value1".to_vec(), 1);
        memtable.put(b"key2".to_vec(), b"value2".to_vec(), 2);
        memtable.put(b"key3".to_vec(), b"value3".to_vec(), 3);
        memtable.put(b"key5".to_vec(), b"value5".to_vec(), 4);
        memtable.delete(b"key2".to_vec(), 5);

        let results = memtable.scan(b"key1", Some(&b"key5"[..]));
        assert_eq!(
            results,
            vec![
                (b"key1".to_vec(), Some(b"value1".to_vec())),
                (b"key2".to_vec(), None),
                (b"key3".to_vec(), Some(b"value3".to_vec())),
            ]
        );

        assert_eq!(memtable.scan(b"key3", None).len(), 2);
        assert!(memtable.scan(b"key6", None).is_empty());
    }

    #[test]
    fn test_size_tracking_and_clear() {
        let mut memtable = Memtable::new(100);
        assert!(!memtable.is_full());
        assert_eq!(memtable.approximate_size(), 0);

        memtable.put(b"k".to_vec(), vec![0u8; 100], 1);
        assert!(memtable.is_full());

        memtable.clear();
        assert_eq!(memtable.approximate_size(), 0);
        assert!(memtable.is_empty());
        assert!(memtable.get(b"k").is_none());
    }

    #[test]
    fn test_concurrent_read_write() {
        let memtable = Arc::new(Memtable::new(10 * 1024 * 1024));
        let mut handles = vec![];

        for thread_id in 0..4u64 {
            let memtable = Arc::clone(&memtable);
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    let key = format!("thread{}_key{}", thread_id, i).into_bytes();
                    memtable.put(key, b"v".to_vec(), thread_id * 100 + i);
                    let _ = memtable.get(b"thread0_key0");
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(memtable.len(), 400);
    }
}
