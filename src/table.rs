// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! The composite table: an ordered array of segments addressed by a dense
//! logical row id space. Only the tail segment accepts writes; frozen
//! segments flow through the background pipeline towards read-only form,
//! merges and purges.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::context::{SegCtx, TableContext};
use crate::error::{StorageResult, TracedStorageError};
use crate::index_iter::TableIndexIter;
use crate::layout;
use crate::merge::{self, MergeParam};
use crate::pipeline::{BackgroundRuntime, BgTask};
use crate::scan_iter::TableScanIter;
use crate::schema::{ColumnId, ColumnVec, IndexId, SchemaConfig, DBMETA_FILE_NAME};
use crate::segment::{Segment, SegmentState};
use crate::txn::TransactionGuard;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PurgeStatus {
    None,
    Pending,
    Inqueue,
    Purging,
}

/// Row accounting of one segment, as reported by
/// [`SegmentedTable::segment_stats`].
#[derive(Clone, Debug)]
pub struct SegmentStat {
    pub logical_rows: usize,
    pub physical_rows: usize,
    pub delcnt: usize,
    pub purged_rows: usize,
    pub writable: bool,
}

pub(crate) struct TableInner {
    pub segments: Vec<Arc<Segment>>,
    /// Strict prefix sums over segment row counts; one longer than
    /// `segments`. The back entry is refreshed from the `row_num` atomic on
    /// every reshape — between reshapes the atomic is authoritative.
    pub row_num_vec: Vec<i64>,
    pub wr_seg: Option<Arc<Segment>>,
}

pub struct SegmentedTable {
    pub(crate) schema: Arc<SchemaConfig>,
    dir: PathBuf,
    pub(crate) inner: RwLock<TableInner>,
    pub(crate) row_num: AtomicI64,
    pub(crate) merge_seq_num: AtomicU64,
    pub(crate) new_wr_seg_num: AtomicU64,
    pub(crate) seg_array_update_seq: AtomicU64,
    pub(crate) is_merging: AtomicBool,
    pub(crate) purge_status: Mutex<PurgeStatus>,
    inprogress_writing_count: AtomicUsize,
    pub(crate) table_scanning_ref_count: AtomicUsize,
    pub(crate) bg_task_num: AtomicUsize,
    to_be_drop: AtomicBool,
    runtime: BackgroundRuntime,
}

impl std::fmt::Debug for SegmentedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedTable").finish_non_exhaustive()
    }
}

struct WritingGuard<'a>(&'a SegmentedTable);

impl<'a> WritingGuard<'a> {
    fn new(table: &'a SegmentedTable) -> Self {
        table.inprogress_writing_count.fetch_add(1, Ordering::AcqRel);
        Self(table)
    }
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.0.inprogress_writing_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SegmentedTable {
    /// Create a new table directory from a `dbmeta.json` document and open
    /// it.
    pub fn create(dir: impl AsRef<Path>, meta_json: &str) -> StorageResult<Arc<Self>> {
        let dir = dir.as_ref();
        // validate before touching the filesystem
        SchemaConfig::from_json(meta_json)?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(DBMETA_FILE_NAME), meta_json)?;
        Self::open(dir)
    }

    /// Open a table directory: discover the in-use merge generation, load
    /// its segments, re-enqueue pending conversions, and spawn the
    /// background runtime.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        let schema = SchemaConfig::load_json_file(dir.join(DBMETA_FILE_NAME))?;
        let merge_seq = layout::discover_merge_dir(&dir)?;
        let merge_dir = layout::merge_path(&dir, merge_seq);

        let entries = layout::working_seg_dir_list(&merge_dir)?;
        let mut slots: Vec<Option<Arc<Segment>>> = Vec::new();
        for entry in entries {
            let seg_dir = merge_dir.join(&entry.name);
            let seg = if entry.writable {
                layout::try_reduce_symlink(&seg_dir)?;
                let rd_dir = layout::seg_path(&dir, merge_seq, "rd", entry.seg_idx);
                if rd_dir.exists() {
                    info!(
                        rd = %rd_dir.display(), wr = %seg_dir.display(),
                        "readonly segment existed for writable seg, remove it"
                    );
                    if seg_dir.exists() {
                        std::fs::remove_dir_all(&seg_dir)?;
                    }
                    continue;
                }
                info!(dir = %seg_dir.display(), "loading writable segment");
                Segment::open_writable(seg_dir, schema.clone())?
            } else {
                info!(dir = %seg_dir.display(), "loading readonly segment");
                Segment::load_readonly(seg_dir, schema.clone())?
            };
            if slots.len() <= entry.seg_idx {
                slots.resize_with(entry.seg_idx + 1, || None);
            }
            slots[entry.seg_idx] = Some(seg);
        }
        let mut segments = Vec::with_capacity(slots.len() + 1);
        for (i, slot) in slots.into_iter().enumerate() {
            segments.push(slot.ok_or_else(|| {
                TracedStorageError::invalid_argument(format!(
                    "missing segment: {}",
                    layout::seg_path(&dir, merge_seq, "xx", i).display()
                ))
            })?);
        }

        // frozen writable segments (every writable one but the tail) resume
        // conversion; the tail stays writable or a fresh one is appended
        let mut pending_conversions = Vec::new();
        for (i, seg) in segments.iter().enumerate() {
            if i + 1 < segments.len() && seg.writable().is_some() {
                seg.freeze();
                pending_conversions.push(i);
            }
        }
        let wr_seg = match segments.last() {
            Some(seg) if seg.writable().is_some() => Some(seg.clone()),
            _ => {
                let seg_idx = segments.len();
                let seg = Segment::new_writable(
                    layout::seg_path(&dir, merge_seq, "wr", seg_idx),
                    schema.clone(),
                )?;
                segments.push(seg.clone());
                Some(seg)
            }
        };

        let mut row_num_vec = Vec::with_capacity(segments.len() + 1);
        row_num_vec.push(0);
        let mut base = 0i64;
        for seg in &segments {
            base += seg.num_data_rows() as i64;
            row_num_vec.push(base);
        }

        let seg_count = segments.len();
        let workers = schema.options.compression_worker_count();
        let table = Arc::new_cyclic(|weak| Self {
            inner: RwLock::new(TableInner {
                segments,
                row_num_vec,
                wr_seg,
            }),
            row_num: AtomicI64::new(base),
            merge_seq_num: AtomicU64::new(merge_seq),
            new_wr_seg_num: AtomicU64::new(0),
            seg_array_update_seq: AtomicU64::new(0),
            is_merging: AtomicBool::new(false),
            purge_status: Mutex::new(PurgeStatus::None),
            inprogress_writing_count: AtomicUsize::new(0),
            table_scanning_ref_count: AtomicUsize::new(0),
            bg_task_num: AtomicUsize::new(0),
            to_be_drop: AtomicBool::new(false),
            runtime: BackgroundRuntime::start(weak.clone(), workers),
            schema,
            dir,
        });
        for seg_idx in pending_conversions {
            table.put_to_compression_queue(seg_idx);
        }
        info!(dir = %table.dir.display(), segs = seg_count, "table loaded");
        Ok(table)
    }

    pub fn schema(&self) -> &Arc<SchemaConfig> {
        &self.schema
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn new_context(&self) -> TableContext {
        TableContext::new(true)
    }

    pub fn new_context_no_index_sync(&self) -> TableContext {
        TableContext::new(false)
    }

    // ------------------------------------------------------------------
    // Context synchronization
    // ------------------------------------------------------------------

    pub(crate) fn sync_ctx_from_inner(&self, ctx: &mut TableContext, inner: &TableInner) {
        ctx.segs = inner
            .segments
            .iter()
            .enumerate()
            .map(|(i, seg)| SegCtx {
                seg: seg.clone(),
                base_id: inner.row_num_vec[i],
            })
            .collect();
        ctx.row_num_vec = inner.row_num_vec.clone();
        *ctx.row_num_vec.last_mut().unwrap() = self.row_num.load(Ordering::Acquire);
        ctx.merge_seq_num = self.merge_seq_num.load(Ordering::Acquire);
        ctx.new_wr_seg_num = self.new_wr_seg_num.load(Ordering::Acquire);
        ctx.seg_array_update_seq = self.seg_array_update_seq.load(Ordering::Acquire);
    }

    /// Speculative sync: compare sequence counters without the table lock;
    /// refresh under the read lock only on mismatch. A pure tail growth
    /// updates the cached back entry in place.
    pub(crate) fn try_sync_ctx_speculative(&self, ctx: &mut TableContext) {
        if ctx.merge_seq_num == self.merge_seq_num.load(Ordering::Acquire)
            && ctx.new_wr_seg_num == self.new_wr_seg_num.load(Ordering::Acquire)
            && ctx.seg_array_update_seq == self.seg_array_update_seq.load(Ordering::Acquire)
        {
            *ctx.row_num_vec.last_mut().unwrap() = self.row_num.load(Ordering::Acquire);
            return;
        }
        let inner = self.inner.read();
        self.sync_ctx_from_inner(ctx, &inner);
    }

    /// Resolve a logical id against the live table state. The caller holds
    /// (at least) the read lock.
    fn locate_inner(&self, inner: &TableInner, id: i64) -> Option<(usize, i64, usize)> {
        if id < 0 || id >= self.row_num.load(Ordering::Acquire) {
            return None;
        }
        let prefix = &inner.row_num_vec[..inner.row_num_vec.len() - 1];
        let upp = prefix.partition_point(|&b| b <= id);
        let seg_idx = upp - 1;
        let base = inner.row_num_vec[seg_idx];
        Some((seg_idx, base, (id - base) as usize))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn num_data_rows(&self) -> i64 {
        self.row_num.load(Ordering::Acquire)
    }

    pub fn exists(&self, id: i64) -> bool {
        let inner = self.inner.read();
        match self.locate_inner(&inner, id) {
            Some((seg_idx, _, sub)) => !inner.segments[seg_idx].is_del(sub),
            None => false,
        }
    }

    pub fn get_value(&self, id: i64, ctx: &mut TableContext) -> StorageResult<Vec<u8>> {
        self.try_sync_ctx_speculative(ctx);
        let (seg_idx, sub) = ctx.locate(id).ok_or_else(|| {
            TracedStorageError::invalid_argument(format!(
                "id = {}, rows = {}",
                id,
                ctx.row_num_vec.last().unwrap()
            ))
        })?;
        ctx.segs[seg_idx].seg.get_value(sub)
    }

    pub fn get_project_columns(&self, names: &[&str]) -> StorageResult<Vec<ColumnId>> {
        names
            .iter()
            .map(|n| self.schema.get_column_id(n))
            .try_collect()
    }

    pub fn select_columns(
        &self,
        id: i64,
        col_ids: &[ColumnId],
        ctx: &mut TableContext,
    ) -> StorageResult<Vec<Vec<u8>>> {
        for &c in col_ids {
            if c >= self.schema.column_num() {
                return Err(TracedStorageError::invalid_argument(format!(
                    "column id {} out of range {}",
                    c,
                    self.schema.column_num()
                )));
            }
        }
        self.try_sync_ctx_speculative(ctx);
        let (seg_idx, sub) = ctx
            .locate(id)
            .ok_or_else(|| TracedStorageError::invalid_argument(format!("id = {} out of range", id)))?;
        ctx.segs[seg_idx].seg.select_columns(sub, col_ids)
    }

    pub fn select_one_column(
        &self,
        id: i64,
        col_id: ColumnId,
        ctx: &mut TableContext,
    ) -> StorageResult<Vec<u8>> {
        Ok(self.select_columns(id, &[col_id], ctx)?.pop().unwrap())
    }

    pub fn select_colgroups(
        &self,
        id: i64,
        cg_ids: &[usize],
        ctx: &mut TableContext,
    ) -> StorageResult<Vec<Vec<u8>>> {
        self.try_sync_ctx_speculative(ctx);
        let (seg_idx, sub) = ctx
            .locate(id)
            .ok_or_else(|| TracedStorageError::invalid_argument(format!("recId = {} out of range", id)))?;
        ctx.segs[seg_idx].seg.select_colgroups(sub, cg_ids)
    }

    pub fn to_json(&self, row: &[u8]) -> StorageResult<String> {
        self.schema.row_to_json(row)
    }

    // ------------------------------------------------------------------
    // Index reads
    // ------------------------------------------------------------------

    fn check_index_id(&self, index_id: IndexId) -> StorageResult<()> {
        if index_id >= self.schema.index_num() {
            return Err(TracedStorageError::invalid_argument(format!(
                "Invalid indexId={}, indexNum={}",
                index_id,
                self.schema.index_num()
            )));
        }
        Ok(())
    }

    pub fn index_key_exists(
        &self,
        index_id: IndexId,
        key: &[u8],
        ctx: &mut TableContext,
    ) -> StorageResult<bool> {
        self.check_index_id(index_id)?;
        self.try_sync_ctx_speculative(ctx);
        let mut out = Vec::new();
        for i in 0..ctx.seg_count() {
            ctx.segs[i].seg.index_search_exact_append(index_id, key, &mut out);
            if !out.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// All logical row ids holding `key`, live or tombstoned filtering left
    /// to the caller's `exists`; ids are ascending within each segment.
    pub fn index_search_exact(
        &self,
        index_id: IndexId,
        key: &[u8],
        ctx: &mut TableContext,
    ) -> StorageResult<Vec<i64>> {
        self.check_index_id(index_id)?;
        self.try_sync_ctx_speculative(ctx);
        let unique = self.schema.get_index_schema(index_id).unique;
        let mut out = Vec::new();
        for i in 0..ctx.seg_count() {
            let seg = &ctx.segs[i].seg;
            if seg.num_data_rows() == seg.delcnt() {
                continue;
            }
            let old_len = out.len();
            seg.index_search_exact_append(index_id, key, &mut out);
            let base = ctx.row_num_vec[i];
            for v in &mut out[old_len..] {
                *v += base;
            }
            if !unique && out.len() - old_len >= 2 {
                out[old_len..].sort_unstable();
            }
        }
        Ok(out)
    }

    /// Live row ids holding `key`.
    pub fn index_search_exact_live(
        &self,
        index_id: IndexId,
        key: &[u8],
        ctx: &mut TableContext,
    ) -> StorageResult<Vec<i64>> {
        let mut ids = self.index_search_exact(index_id, key, ctx)?;
        ids.retain(|&id| {
            ctx.locate(id)
                .map(|(seg_idx, sub)| !ctx.segs[seg_idx].seg.is_del(sub))
                .unwrap_or(false)
        });
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Iterators
    // ------------------------------------------------------------------

    pub fn create_store_iter_forward(self: &Arc<Self>) -> TableScanIter {
        TableScanIter::new(self.clone(), false)
    }

    pub fn create_store_iter_backward(self: &Arc<Self>) -> TableScanIter {
        TableScanIter::new(self.clone(), true)
    }

    pub fn create_index_iter_forward(self: &Arc<Self>, index_id: IndexId) -> StorageResult<TableIndexIter> {
        self.check_index_id(index_id)?;
        if !self.schema.get_index_schema(index_id).ordered {
            return Err(TracedStorageError::invalid_argument(format!(
                "index {} is not ordered",
                self.schema.get_index_schema(index_id).name
            )));
        }
        Ok(TableIndexIter::new(self.clone(), index_id, true))
    }

    pub fn create_index_iter_backward(self: &Arc<Self>, index_id: IndexId) -> StorageResult<TableIndexIter> {
        self.check_index_id(index_id)?;
        if !self.schema.get_index_schema(index_id).ordered {
            return Err(TracedStorageError::invalid_argument(format!(
                "index {} is not ordered",
                self.schema.get_index_schema(index_id).name
            )));
        }
        Ok(TableIndexIter::new(self.clone(), index_id, false))
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    pub fn insert_row(&self, row: &[u8], ctx: &mut TableContext) -> StorageResult<i64> {
        // parsing does not need the lock
        let cols = if ctx.sync_index {
            Some(self.schema.parse_row(row)?)
        } else {
            None
        };
        let _writing = WritingGuard::new(self);
        self.maybe_create_new_segment()?;
        let inner = self.inner.read();
        self.sync_ctx_from_inner(ctx, &inner);
        if let Some(cols) = &cols {
            self.check_unique_in_frozen(ctx, cols, None)?;
        }
        self.insert_row_do_insert(&inner, row, cols.as_ref(), ctx)
    }

    /// Unique-index pre-check over every frozen segment of the snapshot. The
    /// writable segment enforces its own uniqueness inside the transaction.
    fn check_unique_in_frozen(
        &self,
        ctx: &TableContext,
        cols: &ColumnVec,
        exempt_id: Option<i64>,
    ) -> StorageResult<()> {
        if ctx.seg_count() == 0 {
            return Ok(());
        }
        for seg_idx in 0..ctx.seg_count() - 1 {
            let seg = &ctx.segs[seg_idx].seg;
            for &index_id in &self.schema.uniq_indices {
                let key = self.schema.select_index_key(index_id, cols);
                let mut matches = Vec::new();
                seg.index_search_exact_append(index_id, &key, &mut matches);
                for sub in matches {
                    let logic_id = ctx.row_num_vec[seg_idx] + sub;
                    if Some(logic_id) == exempt_id {
                        continue;
                    }
                    if !seg.is_del(sub as usize) {
                        return Err(TracedStorageError::dup_key(
                            self.schema.index_key_json(index_id, &key),
                            seg.dir().display(),
                            logic_id,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Reserve a sub id in the writable segment, maintain indices inside a
    /// transaction, and flip the tombstone once everything is in place.
    fn insert_row_do_insert(
        &self,
        inner: &TableInner,
        row: &[u8],
        cols: Option<&ColumnVec>,
        _ctx: &mut TableContext,
    ) -> StorageResult<i64> {
        let ws = inner.wr_seg.clone().ok_or_else(|| {
            TracedStorageError::invalid_argument(format!(
                "syncFinishWriting('{}') was called, now writing is not allowed",
                self.dir.display()
            ))
        })?;
        let wr_base = inner.row_num_vec[inner.row_num_vec.len() - 2];

        // reserve a sub id: pop the freelist, else append invisible
        let (sub_id, appended) = {
            let mut state = ws.state_mut();
            if state.deleted_wr_id_set.is_empty() {
                let sub_id = state.is_del.len();
                state.is_del.push(true); // invisible to others
                state.delcnt += 1;
                self.row_num
                    .store(wr_base + sub_id as i64 + 1, Ordering::Release);
                debug_assert_eq!(state.is_del.count_ones(), state.delcnt);
                (sub_id, true)
            } else {
                let sub_id = state.deleted_wr_id_set.pop().unwrap() as usize;
                debug_assert!(state.is_del[sub_id]);
                (sub_id, false)
            }
        };

        let result = if let Some(cols) = cols {
            let mut txn = TransactionGuard::new(&ws);
            match self.insert_sync_index(&ws, wr_base, sub_id, cols, &mut txn) {
                Ok(()) => {
                    txn.store_upsert(sub_id, row);
                    txn.commit().map_err(|e| {
                        TracedStorageError::commit(format!(
                            "{}, baseId={}, subId={}, seg = {}",
                            e,
                            wr_base,
                            sub_id,
                            ws.dir().display()
                        ))
                    })?;
                    Ok(())
                }
                Err(e) => {
                    txn.rollback();
                    Err(e)
                }
            }
        } else {
            let mut state = ws.state_mut();
            ws.writable()
                .unwrap()
                .store
                .write()
                .upsert(sub_id, row.to_vec());
            state.dirty = true;
            Ok(())
        };

        match result {
            Ok(()) => {
                let mut state = ws.state_mut();
                state.dirty = true;
                state.is_del.set(sub_id, false);
                state.delcnt -= 1;
                debug_assert_eq!(state.is_del.count_ones(), state.delcnt);
                Ok(wr_base + sub_id as i64)
            }
            Err(e) => {
                // rewind the reservation
                let mut state = ws.state_mut();
                if appended
                    && wr_base + sub_id as i64 + 1 == self.row_num.load(Ordering::Acquire)
                {
                    state.is_del.pop();
                    state.delcnt -= 1;
                    self.row_num.fetch_sub(1, Ordering::AcqRel);
                } else {
                    state.deleted_wr_id_set.push(sub_id as u32);
                }
                debug_assert_eq!(state.is_del.count_ones(), state.delcnt);
                Err(e)
            }
        }
    }

    /// Unique indices first (conflict unwinds through the transaction),
    /// non-unique afterwards.
    fn insert_sync_index(
        &self,
        ws: &Arc<Segment>,
        wr_base: i64,
        sub_id: usize,
        cols: &ColumnVec,
        txn: &mut TransactionGuard<'_>,
    ) -> StorageResult<()> {
        for &index_id in &self.schema.uniq_indices {
            let key = self.schema.select_index_key(index_id, cols);
            if !txn.index_insert(index_id, &key, sub_id) {
                let mut existing = Vec::new();
                ws.index_search_exact_append(index_id, &key, &mut existing);
                let logic_id = existing.first().map(|&s| wr_base + s).unwrap_or(-1);
                return Err(TracedStorageError::dup_key(
                    self.schema.index_key_json(index_id, &key),
                    ws.dir().display(),
                    logic_id,
                ));
            }
        }
        for &index_id in &self.schema.mult_indices {
            let key = self.schema.select_index_key(index_id, cols);
            txn.index_insert(index_id, &key, sub_id);
        }
        Ok(())
    }

    /// Insert-or-overwrite keyed by the table's single unique index. Sets
    /// `ctx.is_upsert_overwritten`: 0 inserted, 1 updated in place,
    /// 2 tombstoned-old-and-inserted-new. Returns the resulting logical id.
    pub fn upsert_row(&self, row: &[u8], ctx: &mut TableContext) -> StorageResult<i64> {
        if self.schema.uniq_indices.len() > 1 {
            return Err(TracedStorageError::invalid_argument(format!(
                "this table has {} unique indices, must have at most one unique index for calling this method",
                self.schema.uniq_indices.len()
            )));
        }
        ctx.is_upsert_overwritten = 0;
        if self.schema.uniq_indices.is_empty() {
            return self.insert_row(row, ctx);
        }
        if !ctx.sync_index {
            return Err(TracedStorageError::invalid_argument(
                "ctx.sync_index must be true for calling this method",
            ));
        }
        let _writing = WritingGuard::new(self);
        let index_id = self.schema.uniq_indices[0];
        let cols = self.schema.parse_row(row)?;
        let key = self.schema.select_index_key(index_id, &cols);

        self.try_sync_ctx_speculative(ctx);
        for seg_idx in 0..ctx.seg_count().saturating_sub(1) {
            let mut matches = Vec::new();
            ctx.segs[seg_idx]
                .seg
                .index_search_exact_append(index_id, &key, &mut matches);
            let Some(&sub) = matches.first() else {
                continue;
            };
            let rec_id = ctx.row_num_vec[seg_idx] + sub;

            let inner = self.inner.read();
            // the snapshot may be stale by now; re-resolve under the lock
            let (seg, sub_id) = if ctx.seg_array_update_seq
                != self.seg_array_update_seq.load(Ordering::Acquire)
            {
                self.sync_ctx_from_inner(ctx, &inner);
                match self.locate_inner(&inner, rec_id) {
                    Some((seg_idx2, _, sub2)) => (inner.segments[seg_idx2].clone(), sub2),
                    None => break,
                }
            } else {
                *ctx.row_num_vec.last_mut().unwrap() = self.row_num.load(Ordering::Acquire);
                (ctx.segs[seg_idx].seg.clone(), sub as usize)
            };
            if seg.is_del(sub_id) {
                break; // raced with a concurrent remove; insert fresh
            }
            let new_rec_id = self.insert_row_do_insert(&inner, row, Some(&cols), ctx)?;
            {
                let mut state = seg.state_mut();
                state.delcnt += 1;
                state.is_del.set(sub_id, true);
                let rows = state.is_del.len();
                state.journal.record(sub_id, rows);
                state.dirty = true;
            }
            ctx.is_upsert_overwritten = 2;
            let purge_wanted = self.check_purge_delete(&seg);
            drop(inner);
            if purge_wanted {
                self.async_purge_delete();
            }
            self.maybe_create_new_segment()?;
            return Ok(new_rec_id);
        }

        // no frozen match: resolve against the writable segment
        let inner = self.inner.read();
        self.sync_ctx_from_inner(ctx, &inner);
        let ws = inner.wr_seg.clone().ok_or_else(|| {
            TracedStorageError::invalid_argument(format!(
                "syncFinishWriting('{}') was called, now writing is not allowed",
                self.dir.display()
            ))
        })?;
        let mut matches = Vec::new();
        ws.index_search_exact_append(index_id, &key, &mut matches);
        let Some(&sub) = matches.first() else {
            let rec_id = self.insert_row_do_insert(&inner, row, Some(&cols), ctx)?;
            drop(inner);
            self.maybe_create_new_segment()?;
            return Ok(rec_id);
        };
        let sub_id = sub as usize;
        let wr_base = inner.row_num_vec[inner.row_num_vec.len() - 2];

        let mut txn = TransactionGuard::new(&ws);
        if !self.schema.mult_indices.is_empty() {
            let old_row = match txn.store_get_row(sub_id) {
                Ok(row) => row,
                Err(_) => {
                    txn.rollback();
                    return Err(TracedStorageError::read_record(
                        "pre updateSyncMultIndex",
                        ws.dir().display(),
                        wr_base,
                        sub_id as i64,
                    ));
                }
            };
            let old_cols = self.schema.parse_row(&old_row)?;
            self.update_sync_mult_index(sub_id, &cols, &old_cols, &mut txn);
        }
        txn.store_upsert(sub_id, row);
        txn.commit().map_err(|e| {
            TracedStorageError::commit(format!(
                "{}, baseId={}, subId={}, seg = {}",
                e,
                wr_base,
                sub_id,
                ws.dir().display()
            ))
        })?;
        ws.state_mut().dirty = true;
        ctx.is_upsert_overwritten = 1;
        drop(inner);
        self.maybe_create_new_segment()?;
        Ok(wr_base + sub_id as i64)
    }

    /// Update by id. Inside the writable segment the row is rewritten in
    /// place and the id is preserved; across a frozen boundary the row is
    /// re-inserted and the **new** id returned, the old one tombstoned.
    pub fn update_row(&self, id: i64, row: &[u8], ctx: &mut TableContext) -> StorageResult<i64> {
        let new_cols = self.schema.parse_row(row)?;
        let _writing = WritingGuard::new(self);
        let inner = self.inner.read();
        let (seg_idx, base, sub_id) = self.locate_inner(&inner, id).ok_or_else(|| {
            TracedStorageError::invalid_argument(format!(
                "id={} is large/equal than rows={}",
                id,
                self.row_num.load(Ordering::Acquire)
            ))
        })?;
        let seg = inner.segments[seg_idx].clone();
        let in_wr_seg = seg_idx + 1 == inner.segments.len();

        if ctx.sync_index {
            if seg.is_del(sub_id) {
                return Err(TracedStorageError::invalid_argument(format!(
                    "id={} has been deleted, segIdx={}, baseId={}, subId={}",
                    id, seg_idx, base, sub_id
                )));
            }
            self.sync_ctx_from_inner(ctx, &inner);
            // the row being replaced may hold the same unique keys; exempt it
            self.check_unique_in_frozen(ctx, &new_cols, Some(id))?;
        }

        if in_wr_seg {
            if ctx.sync_index {
                self.update_with_sync_index(&seg, base, sub_id, row, &new_cols)?;
            } else {
                let mut state = seg.state_mut();
                seg.writable()
                    .unwrap()
                    .store
                    .write()
                    .upsert(sub_id, row.to_vec());
                state.dirty = true;
            }
            return Ok(id);
        }

        // frozen target: re-insert, then tombstone the old row
        let purge_wanted = self.check_purge_delete(&seg);
        self.sync_ctx_from_inner(ctx, &inner);
        let rec_id = self.insert_row_do_insert(&inner, row, ctx.sync_index.then_some(&new_cols), ctx)?;
        {
            let mut state = seg.state_mut();
            if !state.is_del[sub_id] {
                let rows = state.is_del.len();
                state.journal.record(sub_id, rows);
                state.is_del.set(sub_id, true);
                state.delcnt += 1;
                state.dirty = true;
                debug_assert_eq!(state.is_del.count_ones(), state.delcnt);
            }
        }
        drop(inner);
        if purge_wanted {
            self.async_purge_delete();
        }
        Ok(rec_id)
    }

    /// In-place update of a writable-segment row with index maintenance:
    /// changed unique keys are inserted first (conflict rolls everything
    /// back), then the old keys removed, then non-unique diffs applied.
    fn update_with_sync_index(
        &self,
        ws: &Arc<Segment>,
        base: i64,
        sub_id: usize,
        row: &[u8],
        new_cols: &ColumnVec,
    ) -> StorageResult<()> {
        let mut txn = TransactionGuard::new(ws);
        let old_row = match txn.store_get_row(sub_id) {
            Ok(row) => row,
            Err(_) => {
                txn.rollback();
                return Err(TracedStorageError::read_record(
                    "updateWithSyncIndex",
                    ws.dir().display(),
                    base,
                    sub_id as i64,
                ));
            }
        };
        let old_cols = self.schema.parse_row(&old_row)?;

        for &index_id in &self.schema.uniq_indices {
            let new_key = self.schema.select_index_key(index_id, new_cols);
            let old_key = self.schema.select_index_key(index_id, &old_cols);
            if new_key != old_key && !txn.index_insert(index_id, &new_key, sub_id) {
                let err = TracedStorageError::dup_key(
                    self.schema.index_key_json(index_id, &new_key),
                    ws.dir().display(),
                    base + sub_id as i64,
                );
                txn.rollback();
                return Err(err);
            }
        }
        for &index_id in &self.schema.uniq_indices {
            let new_key = self.schema.select_index_key(index_id, new_cols);
            let old_key = self.schema.select_index_key(index_id, &old_cols);
            if new_key != old_key {
                txn.index_remove(index_id, &old_key, sub_id);
            }
        }
        self.update_sync_mult_index(sub_id, new_cols, &old_cols, &mut txn);
        txn.store_upsert(sub_id, row);
        txn.commit().map_err(|e| {
            TracedStorageError::commit(format!(
                "{}, baseId={}, subId={}, seg = {}",
                e,
                base,
                sub_id,
                ws.dir().display()
            ))
        })?;
        ws.state_mut().dirty = true;
        Ok(())
    }

    fn update_sync_mult_index(
        &self,
        sub_id: usize,
        new_cols: &ColumnVec,
        old_cols: &ColumnVec,
        txn: &mut TransactionGuard<'_>,
    ) {
        for &index_id in &self.schema.mult_indices {
            let new_key = self.schema.select_index_key(index_id, new_cols);
            let old_key = self.schema.select_index_key(index_id, old_cols);
            if new_key != old_key {
                txn.index_remove(index_id, &old_key, sub_id);
                txn.index_insert(index_id, &new_key, sub_id);
            }
        }
    }

    /// Tombstone a row. In the writable segment the slot is recycled and
    /// index entries removed best-effort; in frozen segments the tombstone
    /// alone is authoritative and the update journal keeps a running merge
    /// informed.
    pub fn remove_row(&self, id: i64, ctx: &mut TableContext) -> StorageResult<bool> {
        let _writing = WritingGuard::new(self);
        let inner = self.inner.read();
        let (seg_idx, base, sub_id) = self.locate_inner(&inner, id).ok_or_else(|| {
            TracedStorageError::invalid_argument(format!(
                "id={} is large/equal than rows={}",
                id,
                self.row_num.load(Ordering::Acquire)
            ))
        })?;
        let seg = inner.segments[seg_idx].clone();

        if !seg.is_freezed() {
            {
                let mut state = seg.state_mut();
                if state.is_del[sub_id] {
                    return Ok(false);
                }
                state.deleted_wr_id_set.push(sub_id as u32);
                state.delcnt += 1;
                state.is_del.set(sub_id, true);
                state.dirty = true;
                debug_assert_eq!(state.is_del.count_ones(), state.delcnt);
            }
            if ctx.sync_index {
                let mut txn = TransactionGuard::new(&seg);
                let row = match txn.store_get_row(sub_id) {
                    Ok(row) => row,
                    Err(_) => {
                        txn.rollback();
                        return Err(TracedStorageError::read_record(
                            "removeRow: pre remove index",
                            seg.dir().display(),
                            base,
                            sub_id as i64,
                        ));
                    }
                };
                let cols = self.schema.parse_row(&row)?;
                for index_id in 0..self.schema.index_num() {
                    let key = self.schema.select_index_key(index_id, &cols);
                    txn.index_remove(index_id, &key, sub_id);
                }
                txn.store_remove(sub_id);
                if let Err(e) = txn.commit() {
                    // the tombstone is already set; removing index entries is
                    // only an optimization for future searches
                    warn!(
                        "removeRow: commit failed: recId={}, baseId={}, subId={}, seg = {}: {}",
                        id, base, sub_id, seg.dir().display(), e
                    );
                }
            }
        } else {
            {
                let mut state = seg.state_mut();
                if !state.is_del[sub_id] {
                    let rows = state.is_del.len();
                    state.journal.record(sub_id, rows);
                    state.is_del.set(sub_id, true);
                    state.delcnt += 1;
                    state.dirty = true;
                    debug_assert_eq!(state.is_del.count_ones(), state.delcnt);
                }
            }
            let purge_wanted = self.check_purge_delete(&seg);
            drop(inner);
            if purge_wanted {
                self.async_purge_delete();
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // In-place column updates
    // ------------------------------------------------------------------

    /// Resolve (segment, sub id, colgroup idx, byte offset) for an in-place
    /// fixed column mutation.
    fn resolve_column_patch(
        &self,
        ctx: &mut TableContext,
        record_id: i64,
        column_id: ColumnId,
    ) -> StorageResult<(Arc<Segment>, usize, usize, usize)> {
        if column_id >= self.schema.column_num() {
            return Err(TracedStorageError::invalid_argument(format!(
                "column id {} out of range {}",
                column_id,
                self.schema.column_num()
            )));
        }
        self.try_sync_ctx_speculative(ctx);
        let (seg_idx, sub) = ctx.locate(record_id).ok_or_else(|| {
            TracedStorageError::invalid_argument(format!("recordId = {} out of range", record_id))
        })?;
        let offset = self.schema.column_offset_in_colgroup(column_id)?;
        let (cg_idx, _) = self.schema.column_colgroup(column_id);
        Ok((ctx.segs[seg_idx].seg.clone(), sub, cg_idx, offset))
    }

    fn record_column_update(&self, seg: &Segment, sub_id: usize) {
        if seg.is_freezed() {
            let mut state = seg.state_mut();
            let rows = state.is_del.len();
            state.journal.record(sub_id, rows);
            state.dirty = true;
        }
    }

    /// Overwrite one fixed-width column of a record in place, including on
    /// read-only segments.
    pub fn update_column(
        &self,
        record_id: i64,
        column_id: ColumnId,
        new_data: &[u8],
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        let fixed = self.schema.columns.get(column_id).map(|c| c.column_type.fixed_len());
        if fixed != Some(new_data.len()) || new_data.is_empty() {
            return Err(TracedStorageError::invalid_argument(format!(
                "Invalid column(id={}) fixedLen={:?} newLen={}",
                column_id,
                fixed,
                new_data.len()
            )));
        }
        let (seg, sub, cg_idx, offset) = self.resolve_column_patch(ctx, record_id, column_id)?;
        seg.patch_fixed_column(sub, cg_idx, offset, new_data)?;
        self.record_column_update(&seg, sub);
        Ok(())
    }

    pub fn update_column_by_name(
        &self,
        record_id: i64,
        colname: &str,
        new_data: &[u8],
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        let column_id = self.schema.get_column_id(colname)?;
        self.update_column(record_id, column_id, new_data, ctx)
    }

    /// Read-modify-write of an integer column through `op`; the write is
    /// skipped when `op` returns false.
    pub fn update_column_integer(
        &self,
        record_id: i64,
        column_id: ColumnId,
        op: impl FnOnce(&mut i64) -> bool,
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        let (seg, sub, cg_idx, offset) = self.resolve_column_patch(ctx, record_id, column_id)?;
        let current = seg.select_columns(sub, &[column_id])?.pop().unwrap();
        let mut value = self.schema.column_as_i64(column_id, &current)?;
        if op(&mut value) {
            let bytes = self.schema.encode_column_i64(column_id, value)?;
            seg.patch_fixed_column(sub, cg_idx, offset, &bytes)?;
            self.record_column_update(&seg, sub);
        }
        Ok(())
    }

    pub fn update_column_integer_by_name(
        &self,
        record_id: i64,
        colname: &str,
        op: impl FnOnce(&mut i64) -> bool,
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        let column_id = self.schema.get_column_id(colname)?;
        self.update_column_integer(record_id, column_id, op, ctx)
    }

    pub fn update_column_double(
        &self,
        record_id: i64,
        column_id: ColumnId,
        op: impl FnOnce(&mut f64) -> bool,
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        let (seg, sub, cg_idx, offset) = self.resolve_column_patch(ctx, record_id, column_id)?;
        let current = seg.select_columns(sub, &[column_id])?.pop().unwrap();
        let mut value = self.schema.column_as_f64(column_id, &current)?;
        if op(&mut value) {
            let bytes = self.schema.encode_column_f64(column_id, value)?;
            seg.patch_fixed_column(sub, cg_idx, offset, &bytes)?;
            self.record_column_update(&seg, sub);
        }
        Ok(())
    }

    pub fn update_column_double_by_name(
        &self,
        record_id: i64,
        colname: &str,
        op: impl FnOnce(&mut f64) -> bool,
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        let column_id = self.schema.get_column_id(colname)?;
        self.update_column_double(record_id, column_id, op, ctx)
    }

    pub fn increment_column_value(
        &self,
        record_id: i64,
        column_id: ColumnId,
        inc: i64,
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        if self.schema.columns[column_id].column_type.is_integer() {
            self.update_column_integer(
                record_id,
                column_id,
                |v| {
                    *v += inc;
                    true
                },
                ctx,
            )
        } else {
            self.update_column_double(
                record_id,
                column_id,
                |v| {
                    *v += inc as f64;
                    true
                },
                ctx,
            )
        }
    }

    pub fn increment_column_value_double(
        &self,
        record_id: i64,
        column_id: ColumnId,
        inc: f64,
        ctx: &mut TableContext,
    ) -> StorageResult<()> {
        self.update_column_double(
            record_id,
            column_id,
            |v| {
                *v += inc;
                true
            },
            ctx,
        )
    }

    // ------------------------------------------------------------------
    // Manual index maintenance
    // ------------------------------------------------------------------

    pub fn index_insert(&self, index_id: IndexId, key: &[u8], id: i64) -> StorageResult<bool> {
        self.check_index_id(index_id)?;
        if id < 0 {
            return Err(TracedStorageError::invalid_argument("id must be non-negative"));
        }
        let inner = self.inner.write();
        let Some((seg_idx, _, sub_id)) = self.locate_inner(&inner, id) else {
            return Err(TracedStorageError::invalid_argument(format!("id = {} out of range", id)));
        };
        let seg = &inner.segments[seg_idx];
        let Some(wseg) = seg.writable() else {
            warn!(seg = %seg.dir().display(), "indexInsert on readonly segment, ignored");
            return Ok(true);
        };
        let unique = self.schema.get_index_schema(index_id).unique;
        seg.state_mut().dirty = true;
        let inserted = wseg.indices[index_id].write().insert(key, sub_id as u32, unique);
        Ok(inserted)
    }

    pub fn index_remove(&self, index_id: IndexId, key: &[u8], id: i64) -> StorageResult<bool> {
        self.check_index_id(index_id)?;
        let inner = self.inner.write();
        let Some((seg_idx, _, sub_id)) = self.locate_inner(&inner, id) else {
            return Err(TracedStorageError::invalid_argument(format!("id = {} out of range", id)));
        };
        let seg = &inner.segments[seg_idx];
        let Some(wseg) = seg.writable() else {
            warn!(seg = %seg.dir().display(), "indexRemove on readonly segment, ignored");
            return Ok(true);
        };
        seg.state_mut().dirty = true;
        let removed = wseg.indices[index_id].write().remove(key, sub_id as u32);
        Ok(removed)
    }

    /// Move an index entry from `old_id` to `new_id`. When the ids live in
    /// different segments the entry is removed from the old segment's index
    /// and inserted into the new segment's one.
    pub fn index_replace(
        &self,
        index_id: IndexId,
        key: &[u8],
        old_id: i64,
        new_id: i64,
    ) -> StorageResult<bool> {
        self.check_index_id(index_id)?;
        if old_id == new_id {
            return Ok(true);
        }
        let inner = self.inner.write();
        let old_loc = self.locate_inner(&inner, old_id);
        let new_loc = self.locate_inner(&inner, new_id);
        let (Some((old_seg_idx, _, old_sub)), Some((new_seg_idx, _, new_sub))) = (old_loc, new_loc)
        else {
            return Err(TracedStorageError::invalid_argument(
                "indexReplace: id out of range",
            ));
        };
        let unique = self.schema.get_index_schema(index_id).unique;
        if old_seg_idx == new_seg_idx {
            let seg = &inner.segments[old_seg_idx];
            let Some(wseg) = seg.writable() else {
                return Ok(true);
            };
            seg.state_mut().dirty = true;
            return Ok(wseg.indices[index_id]
                .write()
                .replace(key, old_sub as u32, new_sub as u32));
        }
        let old_seg = &inner.segments[old_seg_idx];
        let new_seg = &inner.segments[new_seg_idx];
        let mut ret = true;
        if let Some(wseg) = old_seg.writable() {
            ret = wseg.indices[index_id].write().remove(key, old_sub as u32);
            old_seg.state_mut().dirty = true;
        }
        if let Some(wseg) = new_seg.writable() {
            ret = wseg.indices[index_id]
                .write()
                .insert(key, new_sub as u32, unique);
            new_seg.state_mut().dirty = true;
        }
        Ok(ret)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn data_storage_size(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.iter().map(|s| s.data_storage_size()).sum()
    }

    pub fn data_inflate_size(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.iter().map(|s| s.data_inflate_size()).sum()
    }

    pub fn total_storage_size(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.iter().map(|s| s.total_storage_size()).sum()
    }

    pub fn index_storage_size(&self, index_id: IndexId) -> StorageResult<u64> {
        self.check_index_id(index_id)?;
        let inner = self.inner.read();
        Ok(inner
            .segments
            .iter()
            .map(|s| s.index_storage_size(index_id))
            .sum())
    }

    pub fn writable_seg_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .segments
            .iter()
            .filter(|s| s.writable().is_some())
            .count()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    /// Per-segment row accounting, mainly for diagnostics and tests.
    pub fn segment_stats(&self) -> Vec<SegmentStat> {
        let inner = self.inner.read();
        inner
            .segments
            .iter()
            .map(|seg| SegmentStat {
                logical_rows: seg.num_data_rows(),
                physical_rows: seg.physic_rows(),
                delcnt: seg.delcnt(),
                purged_rows: seg
                    .readonly()
                    .map(|ro| ro.is_purged.max_rank1())
                    .unwrap_or(0),
                writable: seg.writable().is_some(),
            })
            .collect()
    }

    /// Manual compaction: merge the best contiguous run of read-only
    /// segments right now, ignoring the configured minimum run length.
    /// Returns false when no run qualifies or another merge/purge is busy.
    pub fn compact(self: &Arc<Self>) -> StorageResult<bool> {
        match MergeParam::can_merge_with_min(self, 2) {
            Some(param) => {
                merge::merge(self, param)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Block until the background pipeline has no outstanding tasks.
    pub fn wait_background_idle(&self) {
        self.wait_for_background_tasks();
    }

    // ------------------------------------------------------------------
    // Segment lifecycle
    // ------------------------------------------------------------------

    /// Freeze the writable tail and append a fresh one once it crosses the
    /// configured size, provided no merge is running and we are the only
    /// in-flight writer.
    fn maybe_create_new_segment(&self) -> StorageResult<()> {
        if self.is_merging.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inprogress_writing_count.load(Ordering::Acquire) > 1 {
            return Ok(());
        }
        let need = {
            let inner = self.inner.read();
            match &inner.wr_seg {
                Some(ws) => {
                    ws.data_storage_size() >= self.schema.options.max_writing_segment_size
                }
                None => false,
            }
        };
        if !need {
            return Ok(());
        }
        let mut inner = self.inner.write();
        // the condition may have been resolved while the lock was released
        self.do_create_new_segment_in_lock(&mut inner)
    }

    fn do_create_new_segment_in_lock(&self, inner: &mut TableInner) -> StorageResult<()> {
        if self.is_merging.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(ws) = inner.wr_seg.clone() else {
            return Ok(());
        };
        if ws.data_storage_size() < self.schema.options.max_writing_segment_size {
            return Ok(());
        }
        if inner.segments.len() >= self.schema.options.max_seg_num {
            return Err(TracedStorageError::invalid_argument(format!(
                "Reaching maxSegNum={}",
                self.schema.options.max_seg_num
            )));
        }
        {
            // pop trailing tombstones so the id space stays tight
            let mut state = ws.state_mut();
            while state.is_del.last().map(|b| *b).unwrap_or(false) {
                debug_assert!(state.delcnt > 0);
                let sub = state.is_del.len() - 1;
                state.is_del.pop();
                state.delcnt -= 1;
                state.deleted_wr_id_set.retain(|&s| s as usize != sub);
                ws.writable().unwrap().store.write().truncate(sub);
            }
            let wr_base = inner.row_num_vec[inner.row_num_vec.len() - 2];
            let rows = wr_base + state.is_del.len() as i64;
            self.row_num.store(rows, Ordering::Release);
            *inner.row_num_vec.last_mut().unwrap() = rows;
            state.deleted_wr_id_set.clear();
        }
        let old_idx = inner.segments.len() - 1;
        ws.freeze();
        self.put_to_flush_queue(old_idx);

        let new_idx = inner.segments.len();
        let new_seg = Segment::new_writable(
            layout::seg_path(
                &self.dir,
                self.merge_seq_num.load(Ordering::Acquire),
                "wr",
                new_idx,
            ),
            self.schema.clone(),
        )?;
        inner.segments.push(new_seg.clone());
        inner.wr_seg = Some(new_seg);
        let rows = self.row_num.load(Ordering::Acquire);
        inner.row_num_vec.push(rows);
        self.new_wr_seg_num.fetch_add(1, Ordering::AcqRel);
        self.seg_array_update_seq.fetch_add(1, Ordering::AcqRel);
        info!(seg_idx = old_idx, rows, "froze writable segment");
        Ok(())
    }

    pub(crate) fn put_to_flush_queue(&self, seg_idx: usize) {
        if !self.runtime.accepting_tasks() {
            return;
        }
        self.bg_task_num.fetch_add(1, Ordering::AcqRel);
        if !self.runtime.push_flush(BgTask::FreezeFlush { seg_idx }) {
            self.finish_bg_task();
        }
    }

    pub(crate) fn put_to_compression_queue(&self, seg_idx: usize) {
        self.bg_task_num.fetch_add(1, Ordering::AcqRel);
        if !self.runtime.push_compress(BgTask::Convert { seg_idx }) {
            self.finish_bg_task();
        }
    }

    pub(crate) fn finish_bg_task(&self) {
        self.bg_task_num.fetch_sub(1, Ordering::AcqRel);
    }

    /// Flush-queue task: persist the frozen segment in writable format.
    pub(crate) fn freeze_flush_writable_segment(&self, seg_idx: usize) -> StorageResult<()> {
        let seg = {
            let inner = self.inner.read();
            match inner.segments.get(seg_idx) {
                Some(seg) => seg.clone(),
                None => return Ok(()),
            }
        };
        let dir = seg.dir();
        info!(dir = %dir.display(), "freezeFlushWritableSegment");
        seg.save_indices(&dir)?;
        seg.save_record_store(&dir)?;
        seg.save_is_del(&dir)?;
        info!(dir = %dir.display(), "freezeFlushWritableSegment done");
        Ok(())
    }

    /// Compression-queue task: build the read-only form of a frozen
    /// writable segment, swap it into the array, then opportunistically
    /// merge when the pipeline is otherwise idle.
    pub(crate) fn conv_writable_segment_to_readonly(
        self: &Arc<Self>,
        seg_idx: usize,
    ) -> StorageResult<()> {
        struct BgGuard<'a>(&'a SegmentedTable);
        impl Drop for BgGuard<'_> {
            fn drop(&mut self) {
                self.0.finish_bg_task();
            }
        }
        let _bg = BgGuard(self);

        let seg = {
            let inner = self.inner.read();
            match inner.segments.get(seg_idx) {
                Some(seg) => seg.clone(),
                None => return Ok(()),
            }
        };
        if seg.writable().is_none() {
            return Ok(()); // already converted (recovered queue duplicate)
        }
        let merge_seq = self.merge_seq_num.load(Ordering::Acquire);
        let rd_dir = layout::seg_path(&self.dir, merge_seq, "rd", seg_idx);
        info!(dir = %rd_dir.display(), "convWritableSegmentToReadonly");
        let ro = seg.conv_from(&rd_dir)?;

        // the wr path in the current generation may be a symlink left by a
        // merge; removing through it also drops the target directory
        let wr_dir = layout::seg_path(&self.dir, merge_seq, "wr", seg_idx);
        {
            let mut inner = self.inner.write();
            // carry over live state: deletions landed during the build
            let state = {
                let old = seg.state();
                SegmentState {
                    is_del: old.is_del.clone(),
                    delcnt: old.delcnt,
                    dirty: false,
                    deleted_wr_id_set: Vec::new(),
                    journal: Default::default(),
                }
            };
            let new_seg =
                Segment::new_readonly(rd_dir.clone(), self.schema.clone(), ro, state);
            new_seg.save_is_del(&rd_dir)?;
            inner.segments[seg_idx] = new_seg;
            self.seg_array_update_seq.fetch_add(1, Ordering::AcqRel);
        }
        layout::remove_seg_dir(&wr_dir);
        info!(dir = %rd_dir.display(), "convWritableSegmentToReadonly done");

        if self.is_merging.load(Ordering::Acquire) || self.bg_task_num.load(Ordering::Acquire) > 1
        {
            return Ok(());
        }
        if let Some(param) = MergeParam::can_merge(self) {
            merge::merge(self, param)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Purge scheduling
    // ------------------------------------------------------------------

    pub(crate) fn check_purge_delete(&self, seg: &Segment) -> bool {
        if !self.runtime.accepting_tasks() || !self.schema.options.with_purge_bits {
            return false;
        }
        let state = seg.state();
        let max_delcnt =
            state.is_del.len() as f64 * self.schema.options.purge_delete_threshold;
        state.delcnt as f64 >= max_delcnt
    }

    pub(crate) fn async_purge_delete(&self) {
        let mut status = self.purge_status.lock();
        match *status {
            PurgeStatus::Purging | PurgeStatus::Inqueue => {}
            _ if self.is_merging.load(Ordering::Acquire) => {
                *status = PurgeStatus::Pending;
            }
            PurgeStatus::Pending | PurgeStatus::None => {
                if self.runtime.accepting_tasks() {
                    self.bg_task_num.fetch_add(1, Ordering::AcqRel);
                    if self.runtime.push_compress(BgTask::PurgeDelete) {
                        *status = PurgeStatus::Inqueue;
                    } else {
                        self.finish_bg_task();
                    }
                }
            }
        }
    }

    /// Compression-queue task: rewrite read-only segments whose new
    /// tombstones crossed the purge threshold.
    pub(crate) fn run_purge_delete(self: &Arc<Self>) -> StorageResult<()> {
        struct PurgeGuard<'a>(&'a SegmentedTable);
        impl Drop for PurgeGuard<'_> {
            fn drop(&mut self) {
                *self.0.purge_status.lock() = PurgeStatus::None;
                self.0.finish_bg_task();
            }
        }
        let _guard = PurgeGuard(self);
        *self.purge_status.lock() = PurgeStatus::Purging;

        let threshold = self.schema.options.purge_delete_threshold.max(0.001);
        loop {
            let candidate = {
                let inner = self.inner.read();
                inner
                    .segments
                    .iter()
                    .enumerate()
                    .find(|(_, seg)| {
                        seg.readonly().is_some_and(|ro| {
                            let state = seg.state();
                            let new_delcnt = state.delcnt - ro.is_purged.max_rank1();
                            let physic_rows = if ro.is_purged.is_empty() {
                                state.is_del.len()
                            } else {
                                ro.is_purged.max_rank0()
                            };
                            new_delcnt as f64 > physic_rows as f64 * threshold
                        })
                    })
                    .map(|(i, seg)| (i, seg.clone()))
            };
            let Some((seg_idx, seg)) = candidate else {
                break;
            };
            merge::purge_segment(self, seg_idx, seg)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush & shutdown
    // ------------------------------------------------------------------

    /// Persist every dirty segment: writable segments in full, read-only
    /// segments just their tombstone bitmap (the stores are immutable on
    /// disk apart from merge/purge rewrites).
    pub fn flush(&self) -> StorageResult<()> {
        let segments = {
            let inner = self.inner.read();
            inner.segments.clone()
        };
        for seg in segments {
            if seg.writable().is_some() {
                seg.flush_segment()?;
            } else {
                let dirty = {
                    let mut state = seg.state_mut();
                    std::mem::replace(&mut state.dirty, false)
                };
                if dirty {
                    let dir = seg.dir();
                    seg.save_is_del(&dir)?;
                    // in-place column updates land in the fixed-length
                    // colgroups; rewrite those files as well
                    if let Some(ro) = seg.readonly() {
                        for &cg_id in &self.schema.updatable_colgroups {
                            let name =
                                &self.schema.data_colgroup(cg_id - self.schema.index_num()).name;
                            ro.colgroups[cg_id]
                                .save(dir.join(format!("colgroup-{}.bin", name)))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn wait_for_background_tasks(&self) {
        let mut retry = 0usize;
        loop {
            let n = self.bg_task_num.load(Ordering::Acquire);
            if n == 0 {
                break;
            }
            if retry % 100 == 0 {
                info!(tasks = n, retry, "waitForBackgroundTasks");
            }
            retry += 1;
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }

    /// Stop accepting writes, freeze-flush the tail (or drop it when empty)
    /// and wait until the background pipeline is quiescent.
    pub fn sync_finish_writing(&self) -> StorageResult<()> {
        {
            let mut inner = self.inner.write();
            inner.wr_seg = None;
        }
        self.wait_for_background_tasks();
        {
            let mut inner = self.inner.write();
            if let Some(tail) = inner.segments.last().cloned() {
                if tail.writable().is_some() {
                    if tail.num_data_rows() == 0 {
                        layout::remove_seg_dir(&tail.dir());
                        inner.segments.pop();
                        inner.row_num_vec.pop();
                        let rows = *inner.row_num_vec.last().unwrap();
                        self.row_num.store(rows, Ordering::Release);
                        self.seg_array_update_seq.fetch_add(1, Ordering::AcqRel);
                    } else if !tail.is_freezed() {
                        tail.freeze();
                        self.put_to_flush_queue(inner.segments.len() - 1);
                    }
                }
            }
        }
        self.wait_for_background_tasks();
        Ok(())
    }

    /// Mark the table for deletion; the directory is removed when the last
    /// handle drops.
    pub fn drop_table(&self) {
        self.to_be_drop.store(true, Ordering::Release);
    }

    /// Delete all segments and reset the table to empty.
    pub fn clear(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        for seg in inner.segments.drain(..) {
            layout::remove_seg_dir(&seg.dir());
        }
        inner.wr_seg = None;
        inner.row_num_vec = vec![0];
        self.row_num.store(0, Ordering::Release);
        self.seg_array_update_seq.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for SegmentedTable {
    fn drop(&mut self) {
        self.runtime.shutdown(true);
        if self.to_be_drop.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                warn!(dir = %self.dir.display(), error = %e, "failed to drop table dir");
            }
            return;
        }
        if let Err(e) = self.flush() {
            warn!(dir = %self.dir.display(), error = %e, "flush on close failed");
        }
    }
}

/// Read guard over the current segment snapshot, used by iterators.
pub(crate) struct SegmentsSnapshot {
    pub segments: Vec<Arc<Segment>>,
    pub row_num_vec: Vec<i64>,
    pub merge_seq_num: u64,
    pub new_wr_seg_num: u64,
}

impl SegmentedTable {
    pub(crate) fn snapshot_segments(&self) -> SegmentsSnapshot {
        let inner: RwLockReadGuard<'_, TableInner> = self.inner.read();
        let mut row_num_vec = inner.row_num_vec.clone();
        *row_num_vec.last_mut().unwrap() = self.row_num.load(Ordering::Acquire);
        SegmentsSnapshot {
            segments: inner.segments.clone(),
            row_num_vec,
            merge_seq_num: self.merge_seq_num.load(Ordering::Acquire),
            new_wr_seg_num: self.new_wr_seg_num.load(Ordering::Acquire),
        }
    }
}
