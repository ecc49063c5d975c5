use crate::config::CompactionConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::sst::{KvEntry, SstFile, SstManager};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// Size-tiered compactor for sorted tables.
///
/// Tables stay in age order: only adjacent tables are merged, and the result
/// takes the place of the newest input. That keeps "higher id wins" true for
/// every read after a merge.
pub struct Compactor {
    sst_manager: Arc<SstManager>,
    config: CompactionConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Compactor {
    pub fn new(sst_manager: Arc<SstManager>, config: CompactionConfig) -> Self {
        Self {
            sst_manager,
            config,
            metrics: None,
        }
    }

    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    /// Merge runs of similarly sized tables until none qualifies.
    ///
    /// Returns the number of merges performed. Callers must not flush
    /// concurrently; the engine runs this under its commit lock.
    pub fn maybe_compact(&self) -> Result<usize> {
        let mut merges = 0;
        loop {
            let files = self.sst_manager.get_all_files();
            let Some(run) =
                Self::select_size_tiered(&files, self.config.size_ratio, self.config.min_threshold)
            else {
                return Ok(merges);
            };

            // Nothing older can hold a value a tombstone still has to hide.
            let drop_tombstones = run.start == 0;
            let inputs = &files[run];
            let entries = Self::merge(&self.sst_manager, inputs, drop_tombstones)?;
            let output = self.sst_manager.replace_tables(inputs, &entries)?;

            tracing::info!(
                "Compacted {} tables ({} bytes) into {}",
                inputs.len(),
                inputs.iter().map(|f| f.size).sum::<u64>(),
                output.map_or_else(|| "nothing".to_string(), |f| format!("{:?}", f.path))
            );
            if let Some(metrics) = &self.metrics {
                metrics.increment_compaction();
            }
            merges += 1;
        }
    }

    /// First run of at least `min_threshold` adjacent tables whose largest and
    /// smallest sizes are within `size_ratio` of each other.
    ///
    /// `files` must be in age order. Runs are extended as far as they go, so
    /// the returned range is the longest qualifying run at its start.
    pub fn select_size_tiered(
        files: &[SstFile],
        size_ratio: f64,
        min_threshold: usize,
    ) -> Option<Range<usize>> {
        if files.len() < min_threshold {
            return None;
        }

        for start in 0..files.len() {
            let mut smallest = files[start].size.max(1);
            let mut largest = smallest;
            let mut end = start + 1;

            while end < files.len() {
                let size = files[end].size.max(1);
                let lo = smallest.min(size);
                let hi = largest.max(size);
                if hi as f64 / lo as f64 > size_ratio {
                    break;
                }
                smallest = lo;
                largest = hi;
                end += 1;
            }

            if end - start >= min_threshold {
                return Some(start..end);
            }
        }
        None
    }

    /// Merge tables, newest version of each key winning.
    fn merge(
        sst_manager: &SstManager,
        files: &[SstFile],
        drop_tombstones: bool,
    ) -> Result<Vec<KvEntry>> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        // Oldest first, so later inserts overwrite.
        for file in files {
            for (key, value) in sst_manager.read_all(file)? {
                merged.insert(key, value);
            }
        }

        Ok(merged
            .into_iter()
            .filter(|(_, value)| !(drop_tombstones && value.is_none()))
            .collect())
    }
}
