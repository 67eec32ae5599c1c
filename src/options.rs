// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

/// Environment variable capping the number of compression workers.
pub const COMPRESSION_THREADS_ENV: &str = "TerarkDB_CompressionThreadsNum";

/// Options for a [`SegmentedTable`](crate::SegmentedTable). Persisted as part
/// of `dbmeta.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// A writable segment whose storage size crosses this bound is frozen and
    /// a new writable segment is appended.
    pub max_writing_segment_size: u64,

    /// Minimum length of a contiguous read-only run for a merge to proceed.
    pub min_merge_seg_num: usize,

    /// Fraction of tombstoned records above which a segment is physically
    /// purged during merge, and above which a standalone purge is scheduled.
    pub purge_delete_threshold: f64,

    /// Hard cap on the segment array length.
    pub max_seg_num: usize,

    /// Keep purge bitmaps so logical record ids survive physical purges.
    pub with_purge_bits: bool,

    /// Number of compression workers. `None` uses the available parallelism,
    /// capped by the `TerarkDB_CompressionThreadsNum` environment variable.
    pub compression_threads: Option<usize>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_writing_segment_size: 64 << 20,
            min_merge_seg_num: 2,
            purge_delete_threshold: 0.5,
            max_seg_num: 4095,
            with_purge_bits: true,
            compression_threads: None,
        }
    }
}

impl StorageOptions {
    pub fn default_for_test() -> Self {
        Self {
            max_writing_segment_size: 1 << 10,
            min_merge_seg_num: 2,
            purge_delete_threshold: 0.5,
            max_seg_num: 64,
            with_purge_bits: true,
            compression_threads: Some(2),
        }
    }

    pub fn compression_worker_count(&self) -> usize {
        let mut n = self.compression_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        });
        if let Ok(env) = std::env::var(COMPRESSION_THREADS_ENV) {
            if let Ok(cap) = env.parse::<usize>() {
                n = n.min(cap);
            }
        }
        n.max(1)
    }
}
