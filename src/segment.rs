// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Segments: the unit of row storage. A segment is writable, frozen
//! (writable format, no further inserts) or read-only (encoded stores).
//! All variants share a shell carrying the tombstone bitmap, the writable
//! freelist and the update journal behind a short per-segment lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitvec::prelude::*;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use crate::error::{StorageResult, TracedStorageError};
use crate::index_store::{SegIndexIter, SortedIndexStore, WritableIndex};
use crate::purge_bits::{bitvec_from_bytes, bitvec_to_bytes, PurgeBits};
use crate::schema::{ColumnVec, IndexId, SchemaConfig};
use crate::store::{DictZipStoreBuilder, FixedLenStore, RecordStore, SlotStore, VarLenStore};

pub const ISDEL_FILE: &str = "isdel.bin";
pub const ISPURGED_FILE: &str = "ispurged.bin";
pub const ROW_STORE_FILE: &str = "store-rows.bin";

/// Once the in-memory list grows past this, the journal switches to a bitmap.
const JOURNAL_PROMOTE_LEN: usize = 1024;

/// Records mutations applied to a segment while it is the source of a
/// running merge or purge. Drained by swapping both containers out under the
/// segment lock.
#[derive(Default)]
pub struct UpdateJournal {
    pub book_updates: bool,
    pub update_list: Vec<u32>,
    pub update_bits: BitVec,
}

impl UpdateJournal {
    pub fn record(&mut self, sub_id: usize, seg_rows: usize) {
        if !self.book_updates {
            return;
        }
        if !self.update_bits.is_empty() {
            self.update_bits.set(sub_id, true);
            return;
        }
        if self.update_list.len() >= JOURNAL_PROMOTE_LEN {
            // One-way promotion to the bitmap representation.
            let mut bits = bitvec![0; seg_rows + 1];
            for &sub in &self.update_list {
                bits.set(sub as usize, true);
            }
            bits.set(sub_id, true);
            self.update_list.clear();
            self.update_bits = bits;
            return;
        }
        self.update_list.push(sub_id as u32);
    }

    pub fn take(&mut self) -> (Vec<u32>, BitVec) {
        (
            std::mem::take(&mut self.update_list),
            std::mem::take(&mut self.update_bits),
        )
    }
}

/// Mutable per-segment state guarded by the segment's short lock. Never held
/// across I/O.
#[derive(Default)]
pub struct SegmentState {
    pub is_del: BitVec,
    pub delcnt: usize,
    pub dirty: bool,
    /// Reusable tombstoned slots of a writable segment.
    pub deleted_wr_id_set: Vec<u32>,
    pub journal: UpdateJournal,
}

pub struct WritableSegment {
    pub store: RwLock<SlotStore>,
    pub indices: Vec<RwLock<WritableIndex>>,
}

impl WritableSegment {
    fn new(schema: &SchemaConfig) -> Self {
        Self {
            store: RwLock::new(SlotStore::default()),
            indices: schema
                .indices
                .iter()
                .map(|i| RwLock::new(WritableIndex::new(i.ordered)))
                .collect(),
        }
    }
}

pub struct ReadOnlySegment {
    pub indices: Vec<Arc<SortedIndexStore>>,
    /// `0..index_num`: per-index key stores addressed by physical id;
    /// `index_num..`: data colgroup stores.
    pub colgroups: Vec<RecordStore>,
    pub is_purged: PurgeBits,
}

pub enum SegmentKind {
    Writable(WritableSegment),
    ReadOnly(ReadOnlySegment),
}

pub struct Segment {
    pub schema: Arc<SchemaConfig>,
    dir: Mutex<PathBuf>,
    is_freezed: AtomicBool,
    state: RwLock<SegmentState>,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn new_writable(dir: PathBuf, schema: Arc<SchemaConfig>) -> StorageResult<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            kind: SegmentKind::Writable(WritableSegment::new(&schema)),
            schema,
            dir: Mutex::new(dir),
            is_freezed: AtomicBool::new(false),
            state: RwLock::new(SegmentState::default()),
        }))
    }

    pub fn new_readonly(
        dir: PathBuf,
        schema: Arc<SchemaConfig>,
        ro: ReadOnlySegment,
        state: SegmentState,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: SegmentKind::ReadOnly(ro),
            schema,
            dir: Mutex::new(dir),
            is_freezed: AtomicBool::new(true),
            state: RwLock::new(state),
        })
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.lock().clone()
    }

    pub fn set_dir(&self, dir: PathBuf) {
        *self.dir.lock() = dir;
    }

    pub fn is_freezed(&self) -> bool {
        self.is_freezed.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.is_freezed.store(true, Ordering::Release);
    }

    pub fn state(&self) -> RwLockReadGuard<'_, SegmentState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, SegmentState> {
        self.state.write()
    }

    pub fn writable(&self) -> Option<&WritableSegment> {
        match &self.kind {
            SegmentKind::Writable(w) => Some(w),
            SegmentKind::ReadOnly(_) => None,
        }
    }

    pub fn readonly(&self) -> Option<&ReadOnlySegment> {
        match &self.kind {
            SegmentKind::ReadOnly(r) => Some(r),
            SegmentKind::Writable(_) => None,
        }
    }

    /// Logical row count, tombstones included.
    pub fn num_data_rows(&self) -> usize {
        self.state.read().is_del.len()
    }

    pub fn delcnt(&self) -> usize {
        self.state.read().delcnt
    }

    pub fn is_del(&self, sub_id: usize) -> bool {
        self.state.read().is_del[sub_id]
    }

    /// Physical rows actually stored (read-only segments shrink on purge).
    pub fn physic_rows(&self) -> usize {
        match &self.kind {
            SegmentKind::Writable(_) => self.num_data_rows(),
            SegmentKind::ReadOnly(r) => {
                if r.is_purged.is_empty() {
                    self.num_data_rows()
                } else {
                    r.is_purged.max_rank0()
                }
            }
        }
    }

    pub fn get_physic_id(&self, logic_sub_id: usize) -> usize {
        match &self.kind {
            SegmentKind::ReadOnly(r) if !r.is_purged.is_empty() => r.is_purged.rank0(logic_sub_id),
            _ => logic_sub_id,
        }
    }

    pub fn get_logic_id(&self, physic_id: usize) -> usize {
        match &self.kind {
            SegmentKind::ReadOnly(r) if !r.is_purged.is_empty() => r.is_purged.select0(physic_id),
            _ => physic_id,
        }
    }

    pub fn data_storage_size(&self) -> u64 {
        match &self.kind {
            SegmentKind::Writable(w) => w.store.read().data_size(),
            SegmentKind::ReadOnly(r) => r.colgroups[self.schema.index_num()..]
                .iter()
                .map(|s| s.data_storage_size())
                .sum(),
        }
    }

    pub fn data_inflate_size(&self) -> u64 {
        match &self.kind {
            SegmentKind::Writable(w) => w.store.read().data_size(),
            SegmentKind::ReadOnly(r) => r.colgroups[self.schema.index_num()..]
                .iter()
                .map(|s| s.data_inflate_size())
                .sum(),
        }
    }

    pub fn index_storage_size(&self, index_id: IndexId) -> u64 {
        match &self.kind {
            SegmentKind::Writable(w) => w.indices[index_id].read().storage_size(),
            SegmentKind::ReadOnly(r) => {
                r.indices[index_id].storage_size() + r.colgroups[index_id].data_storage_size()
            }
        }
    }

    pub fn total_storage_size(&self) -> u64 {
        let indices: u64 = (0..self.schema.index_num())
            .map(|i| self.index_storage_size(i))
            .sum();
        indices + self.data_storage_size()
    }

    /// Whole-row read by logical sub id.
    pub fn get_value(&self, sub_id: usize) -> StorageResult<Vec<u8>> {
        match &self.kind {
            SegmentKind::Writable(w) => w
                .store
                .read()
                .get(sub_id)
                .map(|r| r.to_vec())
                .ok_or_else(|| {
                    TracedStorageError::read_record(
                        "getValue",
                        self.dir().display(),
                        0,
                        sub_id as i64,
                    )
                }),
            SegmentKind::ReadOnly(r) => {
                if !r.is_purged.is_empty() && r.is_purged.get(sub_id) {
                    return Err(TracedStorageError::read_record(
                        "getValue",
                        self.dir().display(),
                        0,
                        sub_id as i64,
                    ));
                }
                let phys = self.get_physic_id(sub_id);
                let schema = &self.schema;
                let mut cols: ColumnVec = vec![Vec::new(); schema.column_num()];
                for cg_idx in 0..schema.data_colgroup_num() {
                    let store = &r.colgroups[schema.index_num() + cg_idx];
                    let record = store.get_value(phys)?;
                    let values = schema.decode_colgroup(cg_idx, &record)?;
                    for (pos, &c) in schema.data_colgroup(cg_idx).columns.iter().enumerate() {
                        cols[c] = values[pos].clone();
                    }
                }
                Ok(schema.assemble_row(&cols))
            }
        }
    }

    /// Raw column values by logical sub id, in the order of `col_ids`.
    pub fn select_columns(
        &self,
        sub_id: usize,
        col_ids: &[usize],
    ) -> StorageResult<Vec<Vec<u8>>> {
        let schema = &self.schema;
        match &self.kind {
            SegmentKind::Writable(_) => {
                let row = self.get_value(sub_id)?;
                let cols = schema.parse_row(&row)?;
                Ok(col_ids.iter().map(|&c| cols[c].clone()).collect())
            }
            SegmentKind::ReadOnly(r) => {
                let phys = self.get_physic_id(sub_id);
                let mut out = Vec::with_capacity(col_ids.len());
                for &c in col_ids {
                    let (cg_idx, pos) = schema.column_colgroup(c);
                    let record = r.colgroups[schema.index_num() + cg_idx].get_value(phys)?;
                    let values = schema.decode_colgroup(cg_idx, &record)?;
                    out.push(values[pos].clone());
                }
                Ok(out)
            }
        }
    }

    /// Raw colgroup records by global colgroup id. Ids below `index_num`
    /// yield the index key of the row.
    pub fn select_colgroups(
        &self,
        sub_id: usize,
        cg_ids: &[usize],
    ) -> StorageResult<Vec<Vec<u8>>> {
        let schema = &self.schema;
        let index_num = schema.index_num();
        match &self.kind {
            SegmentKind::Writable(_) => {
                let row = self.get_value(sub_id)?;
                let cols = schema.parse_row(&row)?;
                cg_ids
                    .iter()
                    .map(|&cg| {
                        if cg >= schema.colgroup_num() {
                            return Err(TracedStorageError::invalid_argument(format!(
                                "colgroup id {} out of range {}",
                                cg,
                                schema.colgroup_num()
                            )));
                        }
                        Ok(if cg < index_num {
                            schema.select_index_key(cg, &cols)
                        } else {
                            schema.colgroup_project(cg - index_num, &cols)
                        })
                    })
                    .collect()
            }
            SegmentKind::ReadOnly(r) => {
                let phys = self.get_physic_id(sub_id);
                cg_ids
                    .iter()
                    .map(|&cg| {
                        if cg >= schema.colgroup_num() {
                            return Err(TracedStorageError::invalid_argument(format!(
                                "colgroup id {} out of range {}",
                                cg,
                                schema.colgroup_num()
                            )));
                        }
                        r.colgroups[cg].get_value(phys)
                    })
                    .collect()
            }
        }
    }

    /// Append matching *logical* sub ids of `key` in this segment.
    pub fn index_search_exact_append(&self, index_id: IndexId, key: &[u8], out: &mut Vec<i64>) {
        match &self.kind {
            SegmentKind::Writable(w) => {
                w.indices[index_id].read().search_exact_append(key, out);
            }
            SegmentKind::ReadOnly(r) => {
                let mut phys = Vec::new();
                r.indices[index_id].search_exact_append(key, &mut phys);
                out.extend(phys.iter().map(|&p| self.get_logic_id(p as usize) as i64));
            }
        }
    }

    /// Per-segment ordered index cursor. Writable segments are snapshotted.
    pub fn create_index_iter(&self, index_id: IndexId, backward: bool) -> SegIndexIter {
        match &self.kind {
            SegmentKind::Writable(w) => {
                SegIndexIter::from_writable(w.indices[index_id].read().sorted_entries(), backward)
            }
            SegmentKind::ReadOnly(r) => {
                SegIndexIter::from_readonly(r.indices[index_id].clone(), backward)
            }
        }
    }

    /// In-place patch of a fixed-width column. The caller has resolved the
    /// colgroup byte offset; journaling is the caller's duty.
    pub fn patch_fixed_column(
        &self,
        sub_id: usize,
        cg_idx: usize,
        offset: usize,
        bytes: &[u8],
    ) -> StorageResult<()> {
        match &self.kind {
            SegmentKind::ReadOnly(r) => {
                let phys = self.get_physic_id(sub_id);
                let store = r.colgroups[self.schema.index_num() + cg_idx]
                    .as_fixed()
                    .ok_or_else(|| {
                        TracedStorageError::invalid_argument(format!(
                            "colgroup {} is not fixed-length updatable",
                            self.schema.data_colgroup(cg_idx).name
                        ))
                    })?;
                store.patch(phys, offset, bytes);
                Ok(())
            }
            SegmentKind::Writable(w) => {
                // Rewrite the row slot; the writable store keeps whole rows.
                let row = self.get_value(sub_id)?;
                let mut cols = self.schema.parse_row(&row)?;
                let cg = self.schema.data_colgroup(cg_idx);
                // Locate the member column owning this byte range.
                let mut base = 0;
                for &c in &cg.columns {
                    let len = self.schema.columns[c].column_type.fixed_len();
                    if offset < base + len {
                        cols[c][offset - base..offset - base + bytes.len()]
                            .copy_from_slice(bytes);
                        break;
                    }
                    base += len;
                }
                let new_row = self.schema.assemble_row(&cols);
                w.store.write().upsert(sub_id, new_row);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn save_is_del(&self, dir: &Path) -> StorageResult<()> {
        let bytes = {
            let state = self.state.read();
            bitvec_to_bytes(&state.is_del)
        };
        std::fs::write(dir.join(ISDEL_FILE), bytes)?;
        Ok(())
    }

    pub fn save_record_store(&self, dir: &Path) -> StorageResult<()> {
        match &self.kind {
            SegmentKind::Writable(w) => w.store.read().save(dir.join(ROW_STORE_FILE)),
            SegmentKind::ReadOnly(r) => {
                for (cg_idx, store) in r.colgroups[self.schema.index_num()..].iter().enumerate() {
                    let name = &self.schema.data_colgroup(cg_idx).name;
                    store.save(dir.join(format!("colgroup-{}.bin", name)))?;
                }
                Ok(())
            }
        }
    }

    pub fn save_indices(&self, dir: &Path) -> StorageResult<()> {
        for (i, index) in self.schema.indices.iter().enumerate() {
            match &self.kind {
                SegmentKind::Writable(w) => {
                    w.indices[i]
                        .read()
                        .save(dir.join(format!("index-{}.bin", index.name)))?;
                }
                SegmentKind::ReadOnly(r) => {
                    r.indices[i].save(dir.join(format!("index-{}.bin", index.name)))?;
                    r.colgroups[i].save(dir.join(format!("ikeys-{}.bin", index.name)))?;
                }
            }
        }
        Ok(())
    }

    /// Persist a dirty writable segment.
    pub fn flush_segment(&self) -> StorageResult<()> {
        let dirty = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.dirty, false)
        };
        if !dirty {
            return Ok(());
        }
        let dir = self.dir();
        self.save_indices(&dir)?;
        self.save_record_store(&dir)?;
        self.save_is_del(&dir)
    }

    /// Load a writable segment saved by freeze-flush (or recovered at open).
    pub fn open_writable(dir: PathBuf, schema: Arc<SchemaConfig>) -> StorageResult<Arc<Self>> {
        let mut state = SegmentState::default();
        let isdel_path = dir.join(ISDEL_FILE);
        if isdel_path.exists() {
            state.is_del = bitvec_from_bytes(&std::fs::read(isdel_path)?)?;
            state.delcnt = state.is_del.count_ones();
            state.deleted_wr_id_set = state.is_del.iter_ones().map(|i| i as u32).collect();
        }
        let mut wseg = WritableSegment::new(&schema);
        let rows_path = dir.join(ROW_STORE_FILE);
        if rows_path.exists() {
            *wseg.store.get_mut() = SlotStore::load(rows_path)?;
        }
        for (i, index) in schema.indices.iter().enumerate() {
            let path = dir.join(format!("index-{}.bin", index.name));
            if path.exists() {
                *wseg.indices[i].get_mut() = WritableIndex::load(path, index.ordered)?;
            }
        }
        Ok(Arc::new(Self {
            kind: SegmentKind::Writable(wseg),
            schema,
            dir: Mutex::new(dir),
            is_freezed: AtomicBool::new(false),
            state: RwLock::new(state),
        }))
    }

    /// Load a read-only segment from its directory.
    pub fn load_readonly(dir: PathBuf, schema: Arc<SchemaConfig>) -> StorageResult<Arc<Self>> {
        let mut state = SegmentState::default();
        state.is_del = bitvec_from_bytes(&std::fs::read(dir.join(ISDEL_FILE))?)?;
        state.delcnt = state.is_del.count_ones();

        let ispurged_path = dir.join(ISPURGED_FILE);
        let is_purged = if ispurged_path.exists() {
            PurgeBits::from_bytes(&std::fs::read(ispurged_path)?)?
        } else {
            PurgeBits::new()
        };

        let mut indices = Vec::with_capacity(schema.index_num());
        let mut colgroups = Vec::with_capacity(schema.colgroup_num());
        for index in &schema.indices {
            indices.push(Arc::new(SortedIndexStore::load(
                dir.join(format!("index-{}.bin", index.name)),
            )?));
            colgroups.push(RecordStore::load(
                dir.join(format!("ikeys-{}.bin", index.name)),
            )?);
        }
        for cg_idx in 0..schema.data_colgroup_num() {
            let name = &schema.data_colgroup(cg_idx).name;
            colgroups.push(RecordStore::load(
                dir.join(format!("colgroup-{}.bin", name)),
            )?);
        }
        Ok(Arc::new(Self {
            kind: SegmentKind::ReadOnly(ReadOnlySegment {
                indices,
                colgroups,
                is_purged,
            }),
            schema,
            dir: Mutex::new(dir),
            is_freezed: AtomicBool::new(true),
            state: RwLock::new(state),
        }))
    }

    /// Build the read-only form of a frozen writable segment into `dest_dir`.
    /// Logical ids are preserved: tombstoned rows keep a physical placeholder
    /// until a later purge reclaims them.
    pub fn conv_from(&self, dest_dir: &Path) -> StorageResult<ReadOnlySegment> {
        let wseg = self
            .writable()
            .ok_or_else(|| TracedStorageError::invalid_argument("conv_from on read-only segment"))?;
        assert!(self.is_freezed());
        let schema = &self.schema;
        let rows = self.num_data_rows();
        let is_del = self.state.read().is_del.clone();

        let mut builders = ColgroupBuilders::new(schema, rows);
        {
            let store = wseg.store.read();
            for sub in 0..rows {
                let row = if is_del[sub] { None } else { store.get(sub) };
                match row {
                    Some(row) => {
                        let cols = schema.parse_row(row)?;
                        builders.push_live(schema, sub as u32, &cols);
                    }
                    None => builders.push_dead(schema),
                }
            }
        }
        std::fs::create_dir_all(dest_dir)?;
        let ro = builders.finish(schema, PurgeBits::new());
        save_readonly_parts(schema, &ro, dest_dir)?;
        // isdel is saved by the caller under the table lock after the swap
        // point is decided; write a snapshot now so the directory is complete.
        std::fs::write(dest_dir.join(ISDEL_FILE), bitvec_to_bytes(&is_del))?;
        info!(dir = %dest_dir.display(), rows, "built read-only segment");
        Ok(ro)
    }
}

pub(crate) fn save_readonly_parts(
    schema: &SchemaConfig,
    ro: &ReadOnlySegment,
    dir: &Path,
) -> StorageResult<()> {
    for (i, index) in schema.indices.iter().enumerate() {
        ro.indices[i].save(dir.join(format!("index-{}.bin", index.name)))?;
        ro.colgroups[i].save(dir.join(format!("ikeys-{}.bin", index.name)))?;
    }
    for cg_idx in 0..schema.data_colgroup_num() {
        let name = &schema.data_colgroup(cg_idx).name;
        ro.colgroups[schema.index_num() + cg_idx]
            .save(dir.join(format!("colgroup-{}.bin", name)))?;
    }
    if !ro.is_purged.is_empty() {
        std::fs::write(dir.join(ISPURGED_FILE), ro.is_purged.to_bytes())?;
    }
    Ok(())
}

/// Streaming builders for the stores of a read-only segment under
/// construction. One key store + entry list per index, one record store per
/// data colgroup. `push_dead` keeps physical alignment for rows whose data
/// is gone (tombstoned before the build).
pub(crate) struct ColgroupBuilders {
    index_keys: Vec<KeyStoreBuilder>,
    index_entries: Vec<Vec<(Vec<u8>, u32)>>,
    data: Vec<DataStoreBuilder>,
}

pub(crate) enum KeyStoreBuilder {
    Fixed(FixedLenStore),
    Var(VarLenStore),
}

pub(crate) enum DataStoreBuilder {
    Fixed(FixedLenStore),
    Var(VarLenStore),
    Dict(DictZipStoreBuilder),
}

impl ColgroupBuilders {
    pub fn new(schema: &SchemaConfig, rows_hint: usize) -> Self {
        let index_keys = schema
            .indices
            .iter()
            .map(|i| {
                if i.fixed_key_len > 0 {
                    KeyStoreBuilder::Fixed(FixedLenStore::with_capacity(i.fixed_key_len, rows_hint))
                } else {
                    KeyStoreBuilder::Var(VarLenStore::new())
                }
            })
            .collect();
        let data = (0..schema.data_colgroup_num())
            .map(|cg_idx| {
                let cg = schema.data_colgroup(cg_idx);
                if cg.fixed_len > 0 {
                    DataStoreBuilder::Fixed(FixedLenStore::with_capacity(cg.fixed_len, rows_hint))
                } else if cg.dict_zip {
                    DataStoreBuilder::Dict(DictZipStoreBuilder::default())
                } else {
                    DataStoreBuilder::Var(VarLenStore::new())
                }
            })
            .collect();
        Self {
            index_keys,
            index_entries: vec![Vec::new(); schema.index_num()],
            data,
        }
    }

    pub fn push_live(&mut self, schema: &SchemaConfig, phys_id: u32, cols: &ColumnVec) {
        for (i, _) in schema.indices.iter().enumerate() {
            let key = schema.select_index_key(i, cols);
            self.index_entries[i].push((key.clone(), phys_id));
            self.push_key(i, &key);
        }
        for cg_idx in 0..schema.data_colgroup_num() {
            let record = schema.colgroup_project(cg_idx, cols);
            self.push_data(cg_idx, &record);
        }
    }

    /// Pre-encoded variant used by the merge path, which streams colgroup
    /// records rather than whole rows.
    pub fn push_key(&mut self, index_id: usize, key: &[u8]) {
        match &mut self.index_keys[index_id] {
            KeyStoreBuilder::Fixed(s) => {
                if key.is_empty() {
                    s.push_record(&vec![0u8; s.fixlen()]);
                } else {
                    s.push_record(key);
                }
            }
            KeyStoreBuilder::Var(s) => s.push_record(key),
        }
    }

    pub fn push_entry(&mut self, index_id: usize, key: Vec<u8>, phys_id: u32) {
        self.index_entries[index_id].push((key, phys_id));
    }

    pub fn push_data(&mut self, cg_idx: usize, record: &[u8]) {
        match &mut self.data[cg_idx] {
            DataStoreBuilder::Fixed(s) => s.push_record(record),
            DataStoreBuilder::Var(s) => s.push_record(record),
            DataStoreBuilder::Dict(b) => b.push_record(record),
        }
    }

    pub fn push_data_raw(&mut self, cg_idx: usize, raw: &[u8]) {
        match &mut self.data[cg_idx] {
            DataStoreBuilder::Fixed(s) => s.push_raw(raw),
            _ => unreachable!("bulk copy is only valid for fixed-length colgroups"),
        }
    }

    pub fn push_dead(&mut self, schema: &SchemaConfig) {
        for i in 0..schema.index_num() {
            self.push_key(i, &[]);
        }
        for cg_idx in 0..schema.data_colgroup_num() {
            let cg = schema.data_colgroup(cg_idx);
            if cg.fixed_len > 0 {
                let zeros = vec![0u8; cg.fixed_len];
                self.push_data(cg_idx, &zeros);
            } else {
                self.push_data(cg_idx, &[]);
            }
        }
    }

    pub fn finish(self, schema: &SchemaConfig, is_purged: PurgeBits) -> ReadOnlySegment {
        let mut indices = Vec::with_capacity(schema.index_num());
        let mut colgroups = Vec::with_capacity(schema.colgroup_num());
        for (entries, keys) in self.index_entries.into_iter().zip(self.index_keys) {
            indices.push(Arc::new(SortedIndexStore::build(entries)));
            colgroups.push(match keys {
                KeyStoreBuilder::Fixed(s) => RecordStore::Fixed(s),
                KeyStoreBuilder::Var(s) => RecordStore::Var(s),
            });
        }
        for builder in self.data {
            colgroups.push(match builder {
                DataStoreBuilder::Fixed(s) => {
                    if s.rows() == 0 {
                        RecordStore::Empty
                    } else {
                        RecordStore::Fixed(s)
                    }
                }
                DataStoreBuilder::Var(s) => RecordStore::Var(s),
                DataStoreBuilder::Dict(b) => RecordStore::Dict(b.finish()),
            });
        }
        ReadOnlySegment {
            indices,
            colgroups,
            is_purged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RowBuilder;

    fn schema() -> Arc<SchemaConfig> {
        SchemaConfig::from_json(
            r#"{
                "columns": [
                    {"name": "k", "type": "int64"},
                    {"name": "v", "type": "str"}
                ],
                "indices": [
                    {"name": "k_idx", "columns": ["k"], "ordered": true, "unique": true}
                ]
            }"#,
        )
        .unwrap()
    }

    fn insert_raw(seg: &Segment, sub: usize, k: i64, v: &str) {
        let schema = seg.schema.clone();
        let row = RowBuilder::new(&schema).push_i64(k).push_str(v).finish();
        let cols = schema.parse_row(&row).unwrap();
        let key = schema.select_index_key(0, &cols);
        let wseg = seg.writable().unwrap();
        wseg.store.write().upsert(sub, row);
        wseg.indices[0].write().insert(&key, sub as u32, true);
        let mut state = seg.state_mut();
        while state.is_del.len() <= sub {
            state.is_del.push(false);
        }
    }

    #[test]
    fn test_conv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let wr_dir = dir.path().join("wr-0000");
        let seg = Segment::new_writable(wr_dir, schema()).unwrap();
        for i in 0..10 {
            insert_raw(&seg, i, i as i64 * 2, &format!("row-{}", i));
        }
        // tombstone row 3
        {
            let mut state = seg.state_mut();
            state.is_del.set(3, true);
            state.delcnt = 1;
            let wseg = seg.writable().unwrap();
            wseg.store.write().remove(3);
        }
        seg.freeze();

        let rd_dir = dir.path().join("rd-0000");
        let ro = seg.conv_from(&rd_dir).unwrap();
        let state = SegmentState {
            is_del: seg.state().is_del.clone(),
            delcnt: seg.state().delcnt,
            ..Default::default()
        };
        let ro_seg = Segment::new_readonly(rd_dir.clone(), seg.schema.clone(), ro, state);

        assert_eq!(ro_seg.num_data_rows(), 10);
        assert_eq!(ro_seg.physic_rows(), 10);
        for i in [0usize, 1, 2, 4, 9] {
            let row = ro_seg.get_value(i).unwrap();
            let cols = ro_seg.schema.parse_row(&row).unwrap();
            assert_eq!(cols[1], format!("row-{}", i).into_bytes());
        }
        let mut out = vec![];
        ro_seg.index_search_exact_append(0, &key_of(&ro_seg.schema, 8), &mut out);
        assert_eq!(out, vec![4]);

        // reload from disk
        let loaded = Segment::load_readonly(rd_dir, seg.schema.clone()).unwrap();
        assert_eq!(loaded.num_data_rows(), 10);
        assert!(loaded.is_del(3));
        let row = loaded.get_value(9).unwrap();
        let cols = loaded.schema.parse_row(&row).unwrap();
        assert_eq!(cols[1], b"row-9");
    }

    fn key_of(schema: &SchemaConfig, k: i64) -> Vec<u8> {
        let row = RowBuilder::new(schema).push_i64(k).push_str("").finish();
        schema.select_index_key(0, &schema.parse_row(&row).unwrap())
    }

    #[test]
    fn test_journal_promotion() {
        let mut journal = UpdateJournal {
            book_updates: true,
            ..Default::default()
        };
        for i in 0..JOURNAL_PROMOTE_LEN + 5 {
            journal.record(i % 2000, 2000);
        }
        assert!(journal.update_list.is_empty());
        assert!(!journal.update_bits.is_empty());
        let (list, bits) = journal.take();
        assert!(list.is_empty());
        assert_eq!(bits.count_ones(), JOURNAL_PROMOTE_LEN + 5);
        assert!(journal.update_bits.is_empty());
    }
}
