// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Ordered multi-segment index iteration: one cursor per segment feeding a
//! hand-rolled binary heap keyed on (current key, segment index). Ties break
//! on the segment index so interleavings stay deterministic.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{StorageResult, TracedStorageError};
use crate::index_store::SegIndexIter;
use crate::schema::IndexId;
use crate::segment::Segment;
use crate::table::SegmentedTable;

struct IterSeg {
    seg: Arc<Segment>,
    base_id: i64,
    iter: Option<SegIndexIter>,
    cur_key: Vec<u8>,
    /// Logical sub id of the current entry; meaningless while off-heap.
    cur_sub: i64,
}

/// Result row of an ordered index scan.
pub struct IndexEntry {
    pub id: i64,
    pub key: Vec<u8>,
}

pub struct TableIndexIter {
    table: Arc<SegmentedTable>,
    index_id: IndexId,
    forward: bool,
    segs: Vec<IterSeg>,
    /// Heap of indices into `segs`; the root holds the next entry to emit.
    heap: Vec<usize>,
    heap_built: bool,
    old_merge_seq_num: u64,
    old_new_wr_seg_num: u64,
}

fn heap_less(segs: &[IterSeg], forward: bool, x: usize, y: usize) -> bool {
    let (a, b) = if forward { (x, y) } else { (y, x) };
    match segs[a].cur_key.cmp(&segs[b].cur_key) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a < b,
    }
}

fn sift_down(heap: &mut [usize], segs: &[IterSeg], forward: bool, mut pos: usize) {
    loop {
        let left = pos * 2 + 1;
        if left >= heap.len() {
            break;
        }
        let right = left + 1;
        let mut child = left;
        if right < heap.len() && heap_less(segs, forward, heap[right], heap[left]) {
            child = right;
        }
        if heap_less(segs, forward, heap[child], heap[pos]) {
            heap.swap(child, pos);
            pos = child;
        } else {
            break;
        }
    }
}

fn make_heap(heap: &mut [usize], segs: &[IterSeg], forward: bool) {
    for pos in (0..heap.len() / 2).rev() {
        sift_down(heap, segs, forward, pos);
    }
}

impl TableIndexIter {
    pub(crate) fn new(table: Arc<SegmentedTable>, index_id: IndexId, forward: bool) -> Self {
        table
            .table_scanning_ref_count
            .fetch_add(1, Ordering::AcqRel);
        Self {
            table,
            index_id,
            forward,
            segs: Vec::new(),
            heap: Vec::new(),
            heap_built: false,
            old_merge_seq_num: u64::MAX,
            old_new_wr_seg_num: u64::MAX,
        }
    }

    /// Refresh the cached segment list when the array reshaped. Per-segment
    /// cursors of unchanged segments are kept.
    fn sync_seg_ptr(&mut self) -> usize {
        let snap = self.table.snapshot_segments();
        if self.old_merge_seq_num == snap.merge_seq_num
            && self.old_new_wr_seg_num == snap.new_wr_seg_num
            && self.segs.len() == snap.segments.len()
        {
            return 0;
        }
        self.old_merge_seq_num = snap.merge_seq_num;
        self.old_new_wr_seg_num = snap.new_wr_seg_num;
        let mut changed = 0;
        let mut new_segs = Vec::with_capacity(snap.segments.len());
        for (i, seg) in snap.segments.iter().enumerate() {
            let reuse = self
                .segs
                .get_mut(i)
                .filter(|old| Arc::ptr_eq(&old.seg, seg))
                .map(|old| IterSeg {
                    seg: old.seg.clone(),
                    base_id: snap.row_num_vec[i],
                    iter: old.iter.take(),
                    cur_key: std::mem::take(&mut old.cur_key),
                    cur_sub: old.cur_sub,
                });
            match reuse {
                Some(entry) => new_segs.push(entry),
                None => {
                    changed += 1;
                    new_segs.push(IterSeg {
                        seg: seg.clone(),
                        base_id: snap.row_num_vec[i],
                        iter: None,
                        cur_key: Vec::new(),
                        cur_sub: -1,
                    });
                }
            }
        }
        self.segs = new_segs;
        changed
    }

    pub fn reset(&mut self) {
        self.heap.clear();
        self.segs.clear();
        self.heap_built = false;
        self.old_merge_seq_num = u64::MAX;
        self.old_new_wr_seg_num = u64::MAX;
    }

    fn ensure_iters(&mut self, seek_key: Option<&[u8]>) {
        self.sync_seg_ptr();
        self.heap.clear();
        let index_id = self.index_id;
        let backward = !self.forward;
        for i in 0..self.segs.len() {
            let pushed = {
                let entry = &mut self.segs[i];
                if entry.iter.is_none() {
                    entry.iter = Some(entry.seg.create_index_iter(index_id, backward));
                }
                let it = entry.iter.as_mut().unwrap();
                match seek_key {
                    Some(key) => it.seek_lower_bound(key),
                    None => it.reset(),
                }
                match it.next() {
                    Some((key, sub)) => {
                        entry.cur_key = key;
                        entry.cur_sub = entry.seg.get_logic_id(sub as usize) as i64;
                        true
                    }
                    None => false,
                }
            };
            if pushed {
                self.heap.push(i);
            }
        }
        make_heap(&mut self.heap, &self.segs, self.forward);
        self.heap_built = true;
    }

    /// Pop the root entry, advance its cursor, restore the heap. Returns
    /// (segment index, logical sub id, key).
    fn increment_no_check_del(&mut self) -> (usize, i64, Vec<u8>) {
        let seg_i = self.heap[0];
        let (sub, key, advanced) = {
            let entry = &mut self.segs[seg_i];
            let sub = entry.cur_sub;
            let key = std::mem::take(&mut entry.cur_key);
            match entry.iter.as_mut().unwrap().next() {
                Some((next_key, next_sub)) => {
                    entry.cur_key = next_key;
                    entry.cur_sub = entry.seg.get_logic_id(next_sub as usize) as i64;
                    (sub, key, true)
                }
                None => (sub, key, false),
            }
        };
        if !advanced {
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
        }
        sift_down(&mut self.heap, &self.segs, self.forward, 0);
        (seg_i, sub, key)
    }

    /// Next live entry in key order (non-decreasing forward, non-increasing
    /// backward).
    pub fn next(&mut self) -> Option<IndexEntry> {
        if !self.heap_built {
            self.ensure_iters(None);
        }
        while !self.heap.is_empty() {
            let (seg_i, sub, key) = self.increment_no_check_del();
            let entry = &self.segs[seg_i];
            if !entry.seg.is_del(sub as usize) {
                return Some(IndexEntry {
                    id: entry.base_id + sub,
                    key,
                });
            }
        }
        None
    }

    /// Position at the first entry with key >= `key` (forward) or <= `key`
    /// (backward) and return it. An empty key rewinds. The `exact` flag
    /// reports a full key match.
    pub fn seek_lower_bound(&mut self, key: &[u8]) -> StorageResult<Option<(IndexEntry, bool)>> {
        if key.is_empty() {
            self.reset();
            return Ok(self.next().map(|e| {
                let exact = e.key.is_empty();
                (e, exact)
            }));
        }
        let fixlen = self.table.schema().get_index_schema(self.index_id).fixed_key_len;
        if fixlen > 0 && key.len() != fixlen {
            return Err(TracedStorageError::invalid_argument(format!(
                "bad key, len={} is not same as fixed-len={}",
                key.len(),
                fixlen
            )));
        }
        self.ensure_iters(Some(key));
        while !self.heap.is_empty() {
            let (seg_i, sub, found_key) = self.increment_no_check_del();
            let entry = &self.segs[seg_i];
            if !entry.seg.is_del(sub as usize) {
                let exact = found_key == key;
                return Ok(Some((
                    IndexEntry {
                        id: entry.base_id + sub,
                        key: found_key,
                    },
                    exact,
                )));
            }
        }
        Ok(None)
    }
}

impl Drop for TableIndexIter {
    fn drop(&mut self) {
        self.table
            .table_scanning_ref_count
            .fetch_sub(1, Ordering::AcqRel);
    }
}
