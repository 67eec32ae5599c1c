// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Merge engine. Rewrites a contiguous run of read-only segments into one,
//! optionally purging tombstoned records, while the update journal absorbs
//! concurrent modifications to the sources. The purge rebuild of a single
//! over-tombstoned segment is the degenerate one-segment case.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitvec::prelude::*;
use itertools::Itertools;
use tracing::{error, info};

use crate::error::{StorageResult, TracedStorageError};
use crate::layout::{self, MERGING_LOCK_FILE};
use crate::purge_bits::{bitvec_to_bytes, PurgeBits};
use crate::segment::{save_readonly_parts, ColgroupBuilders, Segment, SegmentState, ISDEL_FILE};
use crate::table::{PurgeStatus, SegmentedTable};

pub(crate) struct SegEntry {
    seg: Arc<Segment>,
    idx: usize,
    /// Purge bitmap the merged output will carry for this source; empty
    /// means "no purge bits" (zero filler in the output).
    new_is_purged: BitVec,
    old_num_purged: usize,
    new_num_purged: usize,
}

impl SegEntry {
    fn rows(&self) -> usize {
        self.seg.num_data_rows()
    }

    fn needs_re_purge(&self) -> bool {
        self.new_num_purged != self.old_num_purged
    }
}

pub(crate) struct MergeParam {
    entries: Vec<SegEntry>,
    tab_seg_num: usize,
    new_seg_rows: usize,
}

impl MergeParam {
    /// Atomically claim the merge slot and select a contiguous run of
    /// read-only segments worth merging. Returns `None` (releasing the
    /// claim) when nothing qualifies.
    pub fn can_merge(table: &SegmentedTable) -> Option<MergeParam> {
        Self::can_merge_with_min(table, table.schema.options.min_merge_seg_num)
    }

    /// Variant with an explicit run-length requirement; manual compaction
    /// passes the floor of 2.
    pub fn can_merge_with_min(table: &SegmentedTable, min_merge_seg_num: usize) -> Option<MergeParam> {
        if table.is_merging.load(Ordering::Acquire) {
            return None;
        }
        if *table.purge_status.lock() != PurgeStatus::None {
            return None;
        }
        let (mut entries, tab_seg_num) = {
            let inner = table.inner.write();
            if table.is_merging.load(Ordering::Acquire)
                || *table.purge_status.lock() != PurgeStatus::None
            {
                return None;
            }
            let mut entries = Vec::new();
            for (idx, seg) in inner.segments.iter().enumerate() {
                if seg.writable().is_some() {
                    break; // writable segments sit at the tail side
                }
                entries.push(SegEntry {
                    seg: seg.clone(),
                    idx,
                    new_is_purged: BitVec::new(),
                    old_num_purged: 0,
                    new_num_purged: 0,
                });
            }
            if entries.len() <= 1 {
                return None;
            }
            // frozen writable segments still await conversion; their queued
            // tasks address segments by index, so the array must not shift
            if entries.len() + 1 < inner.segments.len() {
                return None;
            }
            table.is_merging.store(true, Ordering::Release);
            (entries, inner.segments.len())
        };

        // longest contiguous run where no segment dwarfs the average
        let sum_rows: usize = entries.iter().map(|e| e.rows()).sum();
        let avg_rows = sum_rows / entries.len();
        let oversized = |e: &SegEntry| e.rows() > avg_rows * 7 / 4;
        let (mut rng_beg, mut rng_len) = (0usize, 0usize);
        let mut j = 0;
        while j < entries.len() {
            let mut k = j;
            while k < entries.len() && !oversized(&entries[k]) {
                k += 1;
            }
            if k - j > rng_len {
                rng_beg = j;
                rng_len = k - j;
            }
            j = k + 1;
        }
        entries.drain(..rng_beg);
        entries.truncate(rng_len);
        if rng_len < min_merge_seg_num {
            table.is_merging.store(false, Ordering::Release);
            return None;
        }
        let new_seg_rows = entries.iter().map(|e| e.rows()).sum();
        Some(MergeParam {
            entries,
            tab_seg_num,
            new_seg_rows,
        })
    }

    /// Decide which sources get purged and start their update journals.
    /// With the aggregate delete ratio past the threshold everything is
    /// purged; otherwise segments cross the threshold individually.
    fn sync_purge_bits(&mut self, table: &SegmentedTable) {
        let with_purge_bits = table.schema.options.with_purge_bits;
        let threshold = table.schema.options.purge_delete_threshold;
        let new_sum_delcnt: usize = self.entries.iter().map(|e| e.seg.delcnt()).sum();
        let purge_all = with_purge_bits
            && (new_sum_delcnt as f64) >= (self.new_seg_rows as f64) * threshold;

        for e in &mut self.entries {
            let ro = e.seg.readonly().expect("merge source must be read-only");
            e.old_num_purged = ro.is_purged.max_rank1();
            let (is_del, delcnt) = {
                let mut state = e.seg.state_mut();
                state.journal.book_updates = true;
                (state.is_del.clone(), state.delcnt)
            };
            let old_real_records = is_del.len() - e.old_num_purged;
            let new_mark_delcnt = delcnt - e.old_num_purged;
            let new_mark_del_ratio =
                new_mark_delcnt as f64 / (old_real_records as f64 + 0.1);
            if purge_all || (with_purge_bits && new_mark_del_ratio > threshold) {
                e.new_num_purged = is_del.count_ones();
                e.new_is_purged = is_del;
            } else {
                e.new_is_purged = ro.is_purged.as_bitvec().clone();
                e.new_num_purged = e.old_num_purged;
            }
        }
    }

    fn needs_purge_bits(&self) -> bool {
        self.entries.iter().any(|e| !e.new_is_purged.is_empty())
    }

    fn join_path_list(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("\t{}\n", e.seg.dir().display()))
            .join("")
    }
}

/// Stream every surviving record of `entry` into `emit(old_physical_id,
/// logical_id)`. Rows purged by the old bitmap are skipped entirely; rows
/// newly purged advance the physical cursor without being emitted.
fn for_each_surviving(
    entry: &SegEntry,
    mut emit: impl FnMut(usize, usize) -> StorageResult<()>,
) -> StorageResult<()> {
    let ro = entry.seg.readonly().unwrap();
    let old = &ro.is_purged;
    let rows = entry.rows();
    let mut old_phys = 0usize;
    for logic in 0..rows {
        if !old.is_empty() && old.get(logic) {
            continue;
        }
        if entry.new_is_purged.is_empty() || !entry.new_is_purged[logic] {
            emit(old_phys, logic)?;
        }
        old_phys += 1;
    }
    Ok(())
}

pub(crate) fn merge(table: &Arc<SegmentedTable>, mut param: MergeParam) -> StorageResult<()> {
    let dest_merge_dir = layout::merge_path(
        table.dir(),
        table.merge_seq_num.load(Ordering::Acquire) + 1,
    );
    if dest_merge_dir.exists() {
        table.is_merging.store(false, Ordering::Release);
        return Err(TracedStorageError::logic_error(format!(
            "dir: '{}' should not existed",
            dest_merge_dir.display()
        )));
    }
    let seg_path_list = param.join_path_list();
    let result = merge_impl(table, &mut param, &dest_merge_dir);
    match result {
        Ok(()) => {
            info!("merge segments:\n{}done", seg_path_list);
            Ok(())
        }
        Err(e) => {
            error!("merge segments:\n{}failed: {}, rollback", seg_path_list, e);
            for entry in &param.entries {
                entry.seg.state_mut().journal.book_updates = false;
            }
            if let Err(rm) = std::fs::remove_dir_all(&dest_merge_dir) {
                error!(dir = %dest_merge_dir.display(), error = %rm, "failed to remove merge dir");
            }
            table.is_merging.store(false, Ordering::Release);
            Err(e)
        }
    }
}

fn merge_impl(
    table: &Arc<SegmentedTable>,
    param: &mut MergeParam,
    dest_merge_dir: &Path,
) -> StorageResult<()> {
    let schema = table.schema.clone();
    let merge_seq = table.merge_seq_num.load(Ordering::Acquire);
    let dest_seg_dir = layout::seg_path(table.dir(), merge_seq + 1, "rd", param.entries[0].idx);
    info!(
        "merge segments:\n{}to\t{} ...",
        param.join_path_list(),
        dest_seg_dir.display()
    );
    std::fs::create_dir_all(&dest_seg_dir)?;
    let merging_lock = dest_merge_dir.join(MERGING_LOCK_FILE);
    std::fs::write(&merging_lock, b"")?;

    param.sync_purge_bits(table);

    // tombstones: concatenation of the sources, fixed up later by the drain
    let mut is_del = BitVec::new();
    for e in &param.entries {
        is_del.extend_from_bitslice(&e.seg.state().is_del);
    }
    debug_assert_eq!(is_del.len(), param.new_seg_rows);
    let delcnt = is_del.count_ones();

    // purge bitmap: concatenation with zero fillers for unpurged sources
    let is_purged = if param.needs_purge_bits() {
        let mut bits = BitVec::with_capacity(param.new_seg_rows);
        for e in &param.entries {
            if e.new_is_purged.is_empty() {
                bits.resize(bits.len() + e.rows(), false);
            } else {
                debug_assert_eq!(e.new_is_purged.len(), e.rows());
                bits.extend_from_bitslice(&e.new_is_purged);
            }
        }
        PurgeBits::from_bits(bits)
    } else {
        PurgeBits::new()
    };

    let mut builders = ColgroupBuilders::new(&schema, param.new_seg_rows);

    // index merge: stream keys in physical order, skipping purged rows
    for index_id in 0..schema.index_num() {
        let mut new_phys = 0u32;
        for e in &param.entries {
            let ro = e.seg.readonly().unwrap();
            let keys_store = &ro.colgroups[index_id];
            for_each_surviving(e, |old_phys, _logic| {
                let key = keys_store.get_value(old_phys)?;
                builders.push_key(index_id, &key);
                builders.push_entry(index_id, key, new_phys);
                new_phys += 1;
                Ok(())
            })?;
        }
        // an empty stream naturally becomes the empty-index sentinel
    }

    // colgroup merge
    for cg_idx in 0..schema.data_colgroup_num() {
        let cg_id = schema.index_num() + cg_idx;
        let cg = schema.data_colgroup(cg_idx);
        if cg.fixed_len > 0 {
            for e in &param.entries {
                let ro = e.seg.readonly().unwrap();
                let store = &ro.colgroups[cg_id];
                if !e.needs_re_purge() {
                    // purge bitmap unchanged: whole-store copy
                    if let Some(fixed) = store.as_fixed() {
                        builders.push_data_raw(cg_idx, &fixed.raw_copy());
                    }
                    continue;
                }
                for_each_surviving(e, |old_phys, _logic| {
                    let record = store.get_value(old_phys)?;
                    builders.push_data(cg_idx, &record);
                    Ok(())
                })?;
            }
        } else if cg.dict_zip {
            // multi-part view over the source stores, rebuilt through the
            // dictionary builder with the combined purge bits
            let stores: Vec<_> = param
                .entries
                .iter()
                .map(|e| &e.seg.readonly().unwrap().colgroups[cg_id])
                .collect();
            let multi = crate::store::MultiPartStore::new(stores);
            let mut part_base = 0usize;
            for e in &param.entries {
                for_each_surviving(e, |old_phys, _logic| {
                    let record = multi.get_value(part_base + old_phys)?;
                    builders.push_data(cg_idx, &record);
                    Ok(())
                })?;
                let ro = e.seg.readonly().unwrap();
                part_base += if ro.is_purged.is_empty() {
                    e.rows()
                } else {
                    ro.is_purged.max_rank0()
                };
            }
        } else {
            for e in &param.entries {
                let ro = e.seg.readonly().unwrap();
                let store = &ro.colgroups[cg_id];
                for_each_surviving(e, |old_phys, _logic| {
                    let record = store.get_value(old_phys)?;
                    builders.push_data(cg_idx, &record);
                    Ok(())
                })?;
            }
        }
    }

    let ro = builders.finish(&schema, is_purged);
    save_readonly_parts(&schema, &ro, &dest_seg_dir)?;
    std::fs::write(dest_seg_dir.join(ISDEL_FILE), bitvec_to_bytes(&is_del))?;

    let dseg = Segment::new_readonly(
        dest_seg_dir.clone(),
        schema.clone(),
        ro,
        SegmentState {
            is_del,
            delcnt,
            ..Default::default()
        },
    );

    // sources with base offsets for the journal drains
    let mut drain_sources = Vec::with_capacity(param.entries.len());
    let mut base = 0i64;
    for e in &param.entries {
        drain_sources.push((e.seg.clone(), base));
        base += e.rows() as i64;
    }

    // first drain absorbs the bulk of concurrent updates without the lock
    drain_journals(&schema, &drain_sources, &dseg)?;

    // rename untouched segments into the new generation before the swap;
    // `is_merging` keeps the array stable underneath us
    let last_merged = param.entries.last().unwrap().idx;
    let (new_segments, new_dirs, removed_dirs) = {
        let inner = table.inner.read();
        if inner.segments.len() != param.tab_seg_num {
            return Err(TracedStorageError::logic_error(format!(
                "unexpected: segments.len = {}, tabSegNum = {}",
                inner.segments.len(),
                param.tab_seg_num
            )));
        }
        let mut new_segments: Vec<Arc<Segment>> = Vec::with_capacity(inner.segments.len());
        let mut new_dirs: Vec<Option<std::path::PathBuf>> = Vec::new();
        let mut removed_dirs = Vec::new();

        for i in 0..param.entries[0].idx {
            let seg = inner.segments[i].clone();
            let new_dir = layout::seg_path(table.dir(), merge_seq + 1, "rd", new_segments.len());
            info!(from = %seg.dir().display(), to = %new_dir.display(), "rename");
            std::fs::rename(seg.dir(), &new_dir)?;
            new_segments.push(seg);
            new_dirs.push(Some(new_dir));
        }
        new_segments.push(dseg.clone());
        new_dirs.push(None); // already in place
        for i in last_merged + 1..inner.segments.len() {
            let seg = inner.segments[i].clone();
            if seg.writable().is_some() {
                // the writable tail stays where it is; a symlink carries it
                // into the new generation until the next freeze reduces it
                let link = layout::seg_path(table.dir(), merge_seq + 1, "wr", new_segments.len());
                let target = seg.dir();
                let rela = Path::new("..")
                    .join(target.parent().unwrap().file_name().unwrap())
                    .join(target.file_name().unwrap());
                layout::symlink_dir(&rela, &link)?;
                new_segments.push(seg);
                new_dirs.push(None);
            } else {
                let new_dir =
                    layout::seg_path(table.dir(), merge_seq + 1, "rd", new_segments.len());
                info!(from = %seg.dir().display(), to = %new_dir.display(), "rename");
                std::fs::rename(seg.dir(), &new_dir)?;
                new_segments.push(seg);
                new_dirs.push(Some(new_dir));
            }
        }
        for e in &param.entries {
            removed_dirs.push(e.seg.dir());
        }
        (new_segments, new_dirs, removed_dirs)
    };

    // atomic swap
    {
        let mut inner = table.inner.write();
        drain_journals(&schema, &drain_sources, &dseg)?;
        {
            let mut state = dseg.state_mut();
            state.delcnt = state.is_del.count_ones();
        }
        for e in &param.entries {
            e.seg.state_mut().journal.book_updates = false;
        }
        for (seg, new_dir) in new_segments.iter().zip(&new_dirs) {
            if let Some(new_dir) = new_dir {
                seg.set_dir(new_dir.clone());
            }
        }
        let mut row_num_vec = Vec::with_capacity(new_segments.len() + 1);
        row_num_vec.push(0);
        let mut rows = 0i64;
        for seg in &new_segments {
            rows += seg.num_data_rows() as i64;
            row_num_vec.push(rows);
        }
        // the live counter keeps running during the merge (tail inserts)
        let live = table.row_num.load(Ordering::Acquire);
        *row_num_vec.last_mut().unwrap() = live.max(rows);
        inner.segments = new_segments;
        inner.row_num_vec = row_num_vec;
        table.merge_seq_num.fetch_add(1, Ordering::AcqRel);
        table.seg_array_update_seq.fetch_add(1, Ordering::AcqRel);
        table.is_merging.store(false, Ordering::Release);
    }

    std::fs::remove_file(&merging_lock)?;
    for dir in removed_dirs {
        layout::remove_seg_dir(&dir);
    }
    // write the post-drain tombstones so a reopen sees them
    dseg.save_is_del(&dest_seg_dir)?;
    Ok(())
}

/// Replay journaled sub-ids of each source onto the merged output: deleted
/// rows become output tombstones, surviving rows get their updatable
/// colgroup records re-copied.
fn drain_journals(
    schema: &crate::schema::SchemaConfig,
    sources: &[(Arc<Segment>, i64)],
    dseg: &Segment,
) -> StorageResult<()> {
    for (sseg, base) in sources {
        let (list, bits) = sseg.state_mut().journal.take();
        let replay = |sub: usize| -> StorageResult<()> {
            sync_one_record(schema, dseg, sseg, *base, sub)
        };
        if bits.is_empty() {
            for sub in list {
                replay(sub as usize)?;
            }
        } else {
            for sub in bits.iter_ones() {
                replay(sub)?;
            }
        }
    }
    Ok(())
}

fn sync_one_record(
    schema: &crate::schema::SchemaConfig,
    dseg: &Segment,
    sseg: &Segment,
    base_logic_id: i64,
    sub_id: usize,
) -> StorageResult<()> {
    let dst_logic = base_logic_id as usize + sub_id;
    if sseg.is_del(sub_id) {
        let mut state = dseg.state_mut();
        state.is_del.set(dst_logic, true);
        return Ok(());
    }
    // single-record overwrite inside the output's mutable colgroups
    let src_ro = sseg.readonly().unwrap();
    let dst_ro = dseg.readonly().unwrap();
    let src_phys = sseg.get_physic_id(sub_id);
    let dst_phys = dseg.get_physic_id(dst_logic);
    for &cg_id in &schema.updatable_colgroups {
        let record = src_ro.colgroups[cg_id].get_value(src_phys)?;
        if let Some(fixed) = dst_ro.colgroups[cg_id].as_fixed() {
            fixed.update_record(dst_phys, &record);
        }
    }
    Ok(())
}

/// Degenerate one-segment merge: rewrite a read-only segment in place,
/// physically dropping its tombstoned rows. Uses the `.tmp`/`.backup-0`
/// rename dance so a crash resolves deterministically at the next open.
pub(crate) fn purge_segment(
    table: &Arc<SegmentedTable>,
    seg_idx: usize,
    seg: Arc<Segment>,
) -> StorageResult<()> {
    let schema = table.schema.clone();
    let rows = seg.num_data_rows();
    let new_is_purged = {
        let mut state = seg.state_mut();
        state.journal.book_updates = true;
        state.is_del.clone()
    };
    info!(dir = %seg.dir().display(), "purge deleted records");

    let ro = seg.readonly().unwrap();
    let entry = SegEntry {
        seg: seg.clone(),
        idx: seg_idx,
        old_num_purged: ro.is_purged.max_rank1(),
        new_num_purged: new_is_purged.count_ones(),
        new_is_purged,
    };

    let mut builders = ColgroupBuilders::new(&schema, rows);
    for index_id in 0..schema.index_num() {
        let mut new_phys = 0u32;
        let keys_store = &ro.colgroups[index_id];
        for_each_surviving(&entry, |old_phys, _logic| {
            let key = keys_store.get_value(old_phys)?;
            builders.push_key(index_id, &key);
            builders.push_entry(index_id, key, new_phys);
            new_phys += 1;
            Ok(())
        })?;
    }
    for cg_idx in 0..schema.data_colgroup_num() {
        let store = &ro.colgroups[schema.index_num() + cg_idx];
        for_each_surviving(&entry, |old_phys, _logic| {
            let record = store.get_value(old_phys)?;
            builders.push_data(cg_idx, &record);
            Ok(())
        })?;
    }

    let canonical_dir = seg.dir();
    let tmp_dir = canonical_dir.with_extension("tmp");
    let backup_dir = canonical_dir.with_extension("backup-0");
    std::fs::create_dir_all(&tmp_dir)?;

    let is_purged = PurgeBits::from_bits(entry.new_is_purged.clone());
    let new_ro = builders.finish(&schema, is_purged);
    save_readonly_parts(&schema, &new_ro, &tmp_dir)?;
    let state = {
        let old = seg.state();
        SegmentState {
            is_del: old.is_del.clone(),
            delcnt: old.delcnt,
            ..Default::default()
        }
    };
    std::fs::write(tmp_dir.join(ISDEL_FILE), bitvec_to_bytes(&state.is_del))?;
    let new_seg = Segment::new_readonly(canonical_dir.clone(), schema.clone(), new_ro, state);

    let drain_sources = [(seg.clone(), 0i64)];
    drain_journals(&schema, &drain_sources, &new_seg)?;

    {
        let mut inner = table.inner.write();
        let still_there = inner
            .segments
            .get(seg_idx)
            .map_or(false, |s| Arc::ptr_eq(s, &seg));
        if !still_there {
            // the array moved underneath us; give up quietly
            seg.state_mut().journal.book_updates = false;
            std::fs::remove_dir_all(&tmp_dir).ok();
            return Ok(());
        }
        drain_journals(&schema, &drain_sources, &new_seg)?;
        {
            let mut state = new_seg.state_mut();
            state.delcnt = state.is_del.count_ones();
        }
        seg.state_mut().journal.book_updates = false;
        std::fs::rename(&canonical_dir, &backup_dir)?;
        std::fs::rename(&tmp_dir, &canonical_dir)?;
        inner.segments[seg_idx] = new_seg.clone();
        table.seg_array_update_seq.fetch_add(1, Ordering::AcqRel);
    }
    new_seg.save_is_del(&canonical_dir)?;
    std::fs::remove_dir_all(&backup_dir)?;
    info!(dir = %canonical_dir.display(), "purge deleted records done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RowBuilder, SchemaConfig};

    fn schema() -> Arc<SchemaConfig> {
        SchemaConfig::from_json(
            r#"{
                "columns": [
                    {"name": "k", "type": "int64"},
                    {"name": "cnt", "type": "int64"},
                    {"name": "note", "type": "str"}
                ],
                "indices": [
                    {"name": "k_idx", "columns": ["k"], "ordered": true, "unique": true}
                ],
                "colgroups": [
                    {"name": "counters", "columns": ["cnt"]}
                ]
            }"#,
        )
        .unwrap()
    }

    /// A frozen writable segment with rows k=0..n, cnt=0.
    fn build_frozen(dir: &Path, schema: &Arc<SchemaConfig>, n: usize) -> Arc<Segment> {
        let seg = Segment::new_writable(dir.join("wr"), schema.clone()).unwrap();
        let wseg = seg.writable().unwrap();
        for i in 0..n {
            let row = RowBuilder::new(schema)
                .push_i64(i as i64)
                .push_i64(0)
                .push_str("note")
                .finish();
            let cols = schema.parse_row(&row).unwrap();
            let key = schema.select_index_key(0, &cols);
            wseg.store.write().upsert(i, row);
            wseg.indices[0].write().insert(&key, i as u32, true);
            seg.state_mut().is_del.push(false);
        }
        seg.freeze();
        seg
    }

    fn conv(seg: &Segment, dir: &Path) -> Arc<Segment> {
        let ro = seg.conv_from(dir).unwrap();
        let state = SegmentState {
            is_del: seg.state().is_del.clone(),
            delcnt: seg.state().delcnt,
            ..Default::default()
        };
        Segment::new_readonly(dir.to_path_buf(), seg.schema.clone(), ro, state)
    }

    #[test]
    fn drain_journal_replays_removes_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        let frozen = build_frozen(dir.path(), &schema, 4);
        let sseg = conv(&frozen, &dir.path().join("rd-src"));
        let dseg = conv(&frozen, &dir.path().join("rd-dst"));

        sseg.state_mut().journal.book_updates = true;

        // a remove lands on the source while the "merge" is reading it
        {
            let mut state = sseg.state_mut();
            state.is_del.set(1, true);
            state.delcnt += 1;
            let rows = state.is_del.len();
            state.journal.record(1, rows);
        }
        // so does an in-place counter update
        let cnt_col = schema.get_column_id("cnt").unwrap();
        let (cg_idx, _) = schema.column_colgroup(cnt_col);
        let offset = schema.column_offset_in_colgroup(cnt_col).unwrap();
        sseg.patch_fixed_column(2, cg_idx, offset, &42i64.to_le_bytes())
            .unwrap();
        {
            let mut state = sseg.state_mut();
            let rows = state.is_del.len();
            state.journal.record(2, rows);
        }

        drain_journals(&schema, &[(sseg.clone(), 0)], &dseg).unwrap();

        assert!(dseg.state().is_del[1]);
        let cnt = dseg.select_columns(2, &[cnt_col]).unwrap().pop().unwrap();
        assert_eq!(i64::from_le_bytes(cnt.as_slice().try_into().unwrap()), 42);
        // the journal was swapped out by the drain
        assert!(sseg.state().journal.update_list.is_empty());
    }
}
