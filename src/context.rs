// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use crate::segment::Segment;

/// One cached segment of a context snapshot.
pub struct SegCtx {
    pub seg: Arc<Segment>,
    pub base_id: i64,
}

/// Caller-local snapshot of the segment array and row-id map. The snapshot
/// is valid while the table's three sequence counters match; hot read paths
/// compare them speculatively and refresh under the table read lock only on
/// mismatch.
pub struct TableContext {
    /// Maintain secondary indexes synchronously on the write path.
    pub sync_index: bool,

    /// Outcome of the last `upsert_row`: 0 inserted, 1 updated in place,
    /// 2 tombstoned the old row and inserted a new one.
    pub is_upsert_overwritten: u8,

    pub(crate) segs: Vec<SegCtx>,
    /// Prefix sums; one longer than `segs`, the back mirrors the table's
    /// cached row count.
    pub(crate) row_num_vec: Vec<i64>,
    pub(crate) merge_seq_num: u64,
    pub(crate) new_wr_seg_num: u64,
    pub(crate) seg_array_update_seq: u64,
}

impl TableContext {
    pub(crate) fn new(sync_index: bool) -> Self {
        Self {
            sync_index,
            is_upsert_overwritten: 0,
            segs: Vec::new(),
            row_num_vec: vec![0],
            merge_seq_num: u64::MAX,
            new_wr_seg_num: u64::MAX,
            seg_array_update_seq: u64::MAX,
        }
    }

    pub(crate) fn seg_count(&self) -> usize {
        self.segs.len()
    }

    /// Resolve a logical row id to (segment index, sub id) within this
    /// snapshot.
    pub(crate) fn locate(&self, id: i64) -> Option<(usize, usize)> {
        if id < 0 || id >= *self.row_num_vec.last().unwrap() {
            return None;
        }
        let upp = self.row_num_vec.partition_point(|&base| base <= id);
        let seg_idx = upp - 1;
        if seg_idx >= self.segs.len() {
            return None;
        }
        Some((seg_idx, (id - self.row_num_vec[seg_idx]) as usize))
    }
}
