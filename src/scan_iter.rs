// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::segment::Segment;
use crate::table::SegmentedTable;

struct ScanSeg {
    seg: Arc<Segment>,
    base_id: i64,
}

/// Full-table scan over logical row ids, skipping tombstones. Yields
/// `(logical id, row)` in ascending (forward) or descending (backward) id
/// order, which visits segments in order or reverse order respectively.
///
/// A forward scan re-syncs its segment snapshot when it runs off the end,
/// so rows inserted while scanning are picked up; a backward scan never
/// needs to, new rows only appear above its starting point.
pub struct TableScanIter {
    table: Arc<SegmentedTable>,
    backward: bool,
    segs: Vec<ScanSeg>,
    merge_seq_num: u64,
    new_wr_seg_num: u64,
    /// Next logical id to visit. Backward scans count down and use -1 as
    /// the exhausted marker.
    cursor: i64,
}

impl TableScanIter {
    pub(crate) fn new(table: Arc<SegmentedTable>, backward: bool) -> Self {
        table
            .table_scanning_ref_count
            .fetch_add(1, Ordering::AcqRel);
        let mut iter = Self {
            table,
            backward,
            segs: Vec::new(),
            merge_seq_num: u64::MAX,
            new_wr_seg_num: u64::MAX,
            cursor: 0,
        };
        iter.reset();
        iter
    }

    fn sync_tab_segs(&mut self) -> bool {
        if self.merge_seq_num == self.table.merge_seq_num.load(Ordering::Acquire)
            && self.new_wr_seg_num == self.table.new_wr_seg_num.load(Ordering::Acquire)
            && self.segs.len() == self.table.segment_count()
        {
            return false;
        }
        let snap = self.table.snapshot_segments();
        self.segs = snap
            .segments
            .iter()
            .enumerate()
            .map(|(i, seg)| ScanSeg {
                seg: seg.clone(),
                base_id: snap.row_num_vec[i],
            })
            .collect();
        self.merge_seq_num = snap.merge_seq_num;
        self.new_wr_seg_num = snap.new_wr_seg_num;
        true
    }

    pub fn reset(&mut self) {
        self.merge_seq_num = u64::MAX;
        self.sync_tab_segs();
        self.cursor = if self.backward {
            self.table.num_data_rows() - 1
        } else {
            0
        };
    }

    fn locate(&self, id: i64) -> Option<(&ScanSeg, usize)> {
        let upp = self.segs.partition_point(|s| s.base_id <= id);
        if upp == 0 {
            return None;
        }
        let seg = &self.segs[upp - 1];
        let sub = (id - seg.base_id) as usize;
        if sub >= seg.seg.num_data_rows() {
            return None;
        }
        Some((seg, sub))
    }

    pub fn next(&mut self) -> Option<(i64, Vec<u8>)> {
        loop {
            if self.backward {
                if self.cursor < 0 {
                    return None;
                }
            } else if self.cursor >= self.table.num_data_rows() {
                return None;
            }
            let id = self.cursor;
            let located = match self.locate(id) {
                Some((seg, sub)) => Some((seg.base_id, seg.seg.clone(), sub)),
                None => None,
            };
            let found = match located {
                None => {
                    // the snapshot lags behind a reshape; refresh and retry
                    if !self.sync_tab_segs() {
                        return None;
                    }
                    continue;
                }
                Some((_, seg, sub)) => {
                    if seg.is_del(sub) {
                        None
                    } else {
                        seg.get_value(sub).ok()
                    }
                }
            };
            self.cursor += if self.backward { -1 } else { 1 };
            if let Some(row) = found {
                return Some((id, row));
            }
        }
    }

    /// Fetch one row by id and park the cursor next to it. Returns `None`
    /// for out-of-range or tombstoned rows.
    pub fn seek_exact(&mut self, id: i64) -> Option<Vec<u8>> {
        self.sync_tab_segs();
        let mut hit = self.locate(id).map(|(s, sub)| (s.seg.clone(), sub));
        if hit.is_none() && self.sync_tab_segs() {
            hit = self.locate(id).map(|(s, sub)| (s.seg.clone(), sub));
        }
        let (seg, sub) = hit?;
        if seg.is_del(sub) {
            return None;
        }
        let row = seg.get_value(sub).ok()?;
        self.cursor = if self.backward { id - 1 } else { id + 1 };
        Some(row)
    }
}

impl Drop for TableScanIter {
    fn drop(&mut self) {
        self.table
            .table_scanning_ref_count
            .fetch_sub(1, Ordering::AcqRel);
    }
}
