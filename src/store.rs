// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Default record stores backing segments.
//!
//! Read-only segments keep one [`RecordStore`] per column-group, addressed by
//! *physical* row id. `FixedLenStore` retains a narrow in-place write path so
//! merged segments can absorb concurrent fixed-column updates. Writable
//! segments keep whole rows in a [`SlotStore`].

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut};
use parking_lot::RwLock;

use crate::error::{StorageResult, TracedStorageError};

const STORE_TAG_EMPTY: u8 = 0;
const STORE_TAG_FIXED: u8 = 1;
const STORE_TAG_VAR: u8 = 2;
const STORE_TAG_DICT: u8 = 3;

/// Fixed-width records in one contiguous buffer. The only store kind with a
/// mutable base: single-record overwrites and sub-record patches are allowed
/// after the store is built.
pub struct FixedLenStore {
    fixlen: usize,
    rows: usize,
    data: RwLock<Vec<u8>>,
}

impl FixedLenStore {
    pub fn with_capacity(fixlen: usize, rows: usize) -> Self {
        assert!(fixlen > 0);
        Self {
            fixlen,
            rows: 0,
            data: RwLock::new(Vec::with_capacity(fixlen * rows)),
        }
    }

    pub fn fixlen(&self) -> usize {
        self.fixlen
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn push_record(&mut self, record: &[u8]) {
        assert_eq!(record.len(), self.fixlen);
        self.data.get_mut().extend_from_slice(record);
        self.rows += 1;
    }

    /// Bulk append of another store's raw records.
    pub fn push_raw(&mut self, raw: &[u8]) {
        assert_eq!(raw.len() % self.fixlen, 0);
        self.data.get_mut().extend_from_slice(raw);
        self.rows += raw.len() / self.fixlen;
    }

    pub fn raw_copy(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn get(&self, phys_id: usize) -> Vec<u8> {
        let data = self.data.read();
        data[phys_id * self.fixlen..(phys_id + 1) * self.fixlen].to_vec()
    }

    /// Overwrite a whole record in place.
    pub fn update_record(&self, phys_id: usize, record: &[u8]) {
        assert_eq!(record.len(), self.fixlen);
        let mut data = self.data.write();
        data[phys_id * self.fixlen..(phys_id + 1) * self.fixlen].copy_from_slice(record);
    }

    /// Patch `bytes` at `offset` inside a record.
    pub fn patch(&self, phys_id: usize, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.fixlen);
        let mut data = self.data.write();
        let base = phys_id * self.fixlen + offset;
        data[base..base + bytes.len()].copy_from_slice(bytes);
    }

    /// Read-modify-write of a sub-record slice.
    pub fn with_slice_mut<R>(&self, phys_id: usize, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write();
        let base = phys_id * self.fixlen + offset;
        f(&mut data[base..base + len])
    }
}

/// Variable-length records: an offset table over a shared pool.
#[derive(Default)]
pub struct VarLenStore {
    offsets: Vec<u32>,
    pool: Vec<u8>,
}

impl VarLenStore {
    pub fn new() -> Self {
        Self {
            offsets: vec![0],
            pool: Vec::new(),
        }
    }

    pub fn push_record(&mut self, record: &[u8]) {
        self.pool.extend_from_slice(record);
        self.offsets.push(self.pool.len() as u32);
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, phys_id: usize) -> &[u8] {
        &self.pool[self.offsets[phys_id] as usize..self.offsets[phys_id + 1] as usize]
    }
}

/// Dictionary-deduplicated records: distinct values in a pool, a u32 value id
/// per row.
#[derive(Default)]
pub struct DictZipStore {
    dict: VarLenStore,
    row_ids: Vec<u32>,
    inflate: u64,
}

impl DictZipStore {
    pub fn get(&self, phys_id: usize) -> &[u8] {
        self.dict.get(self.row_ids[phys_id] as usize)
    }

    pub fn len(&self) -> usize {
        self.row_ids.len()
    }
}

/// Builder for [`DictZipStore`], deduplicating through a value → id map.
#[derive(Default)]
pub struct DictZipStoreBuilder {
    store: DictZipStore,
    value_ids: std::collections::HashMap<Vec<u8>, u32>,
}

impl DictZipStoreBuilder {
    pub fn push_record(&mut self, record: &[u8]) {
        let next = self.value_ids.len() as u32;
        let id = *self
            .value_ids
            .entry(record.to_vec())
            .or_insert_with(|| {
                self.store.dict.push_record(record);
                next
            });
        self.store.row_ids.push(id);
        self.store.inflate += record.len() as u64;
    }

    pub fn finish(self) -> DictZipStore {
        self.store
    }
}

/// Tagged record store of a read-only column-group.
pub enum RecordStore {
    Fixed(FixedLenStore),
    Var(VarLenStore),
    Dict(DictZipStore),
    /// Sentinel installed when every record of a colgroup was purged.
    Empty,
}

impl RecordStore {
    pub fn num_data_rows(&self) -> usize {
        match self {
            RecordStore::Fixed(s) => s.rows,
            RecordStore::Var(s) => s.len(),
            RecordStore::Dict(s) => s.len(),
            RecordStore::Empty => 0,
        }
    }

    pub fn data_storage_size(&self) -> u64 {
        match self {
            RecordStore::Fixed(s) => (s.rows * s.fixlen) as u64,
            RecordStore::Var(s) => (s.pool.len() + self.num_data_rows() * 4) as u64,
            RecordStore::Dict(s) => (s.dict.pool.len() + s.row_ids.len() * 4) as u64,
            RecordStore::Empty => 0,
        }
    }

    pub fn data_inflate_size(&self) -> u64 {
        match self {
            RecordStore::Fixed(s) => (s.rows * s.fixlen) as u64,
            RecordStore::Var(s) => s.pool.len() as u64,
            RecordStore::Dict(s) => s.inflate,
            RecordStore::Empty => 0,
        }
    }

    pub fn get_value(&self, phys_id: usize) -> StorageResult<Vec<u8>> {
        if phys_id >= self.num_data_rows() {
            return Err(TracedStorageError::invalid_argument(format!(
                "physical id {} out of range {}",
                phys_id,
                self.num_data_rows()
            )));
        }
        Ok(match self {
            RecordStore::Fixed(s) => s.get(phys_id),
            RecordStore::Var(s) => s.get(phys_id).to_vec(),
            RecordStore::Dict(s) => s.get(phys_id).to_vec(),
            RecordStore::Empty => unreachable!(),
        })
    }

    pub fn as_fixed(&self) -> Option<&FixedLenStore> {
        match self {
            RecordStore::Fixed(s) => Some(s),
            _ => None,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let mut out = Vec::new();
        match self {
            RecordStore::Empty => out.put_u8(STORE_TAG_EMPTY),
            RecordStore::Fixed(s) => {
                out.put_u8(STORE_TAG_FIXED);
                out.put_u32_le(s.fixlen as u32);
                out.put_u64_le(s.rows as u64);
                out.extend_from_slice(&s.data.read());
            }
            RecordStore::Var(s) => {
                out.put_u8(STORE_TAG_VAR);
                out.put_u64_le(s.len() as u64);
                for &off in &s.offsets {
                    out.put_u32_le(off);
                }
                out.extend_from_slice(&s.pool);
            }
            RecordStore::Dict(s) => {
                out.put_u8(STORE_TAG_DICT);
                out.put_u64_le(s.dict.len() as u64);
                for &off in &s.dict.offsets {
                    out.put_u32_le(off);
                }
                out.extend_from_slice(&s.dict.pool);
                out.put_u64_le(s.row_ids.len() as u64);
                for &id in &s.row_ids {
                    out.put_u32_le(id);
                }
                out.put_u64_le(s.inflate);
            }
        }
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let data = fs::read(path.as_ref())?;
        let mut buf = &data[..];
        if !buf.has_remaining() {
            return Err(TracedStorageError::decode("store file is empty"));
        }
        match buf.get_u8() {
            STORE_TAG_EMPTY => Ok(RecordStore::Empty),
            STORE_TAG_FIXED => {
                let fixlen = buf.get_u32_le() as usize;
                let rows = buf.get_u64_le() as usize;
                if buf.remaining() != fixlen * rows {
                    return Err(TracedStorageError::decode("fixed store truncated"));
                }
                Ok(RecordStore::Fixed(FixedLenStore {
                    fixlen,
                    rows,
                    data: RwLock::new(buf.to_vec()),
                }))
            }
            STORE_TAG_VAR => {
                let rows = buf.get_u64_le() as usize;
                let offsets = read_u32_vec(&mut buf, rows + 1)?;
                let pool_len = *offsets.last().unwrap() as usize;
                if buf.remaining() != pool_len {
                    return Err(TracedStorageError::decode("var store truncated"));
                }
                Ok(RecordStore::Var(VarLenStore {
                    offsets,
                    pool: buf.to_vec(),
                }))
            }
            STORE_TAG_DICT => {
                let dict_rows = buf.get_u64_le() as usize;
                let dict_offsets = read_u32_vec(&mut buf, dict_rows + 1)?;
                let dict_pool_len = *dict_offsets.last().unwrap() as usize;
                if buf.remaining() < dict_pool_len {
                    return Err(TracedStorageError::decode("dict store truncated"));
                }
                let dict_pool = buf[..dict_pool_len].to_vec();
                buf.advance(dict_pool_len);
                let rows = buf.get_u64_le() as usize;
                let row_ids = read_u32_vec(&mut buf, rows)?;
                let inflate = buf.get_u64_le();
                Ok(RecordStore::Dict(DictZipStore {
                    dict: VarLenStore {
                        offsets: dict_offsets,
                        pool: dict_pool,
                    },
                    row_ids,
                    inflate,
                }))
            }
            tag => Err(TracedStorageError::decode(format!(
                "unknown store tag: {}",
                tag
            ))),
        }
    }
}

fn read_u32_vec(buf: &mut &[u8], n: usize) -> StorageResult<Vec<u32>> {
    if buf.remaining() < n * 4 {
        return Err(TracedStorageError::decode("store file truncated"));
    }
    Ok((0..n).map(|_| buf.get_u32_le()).collect())
}

/// Concatenation view over several stores, used when rebuilding a
/// dictionary-compressed colgroup from its merge sources.
pub struct MultiPartStore<'a> {
    parts: Vec<&'a RecordStore>,
    base: Vec<usize>,
}

impl<'a> MultiPartStore<'a> {
    pub fn new(parts: Vec<&'a RecordStore>) -> Self {
        let mut base = Vec::with_capacity(parts.len() + 1);
        base.push(0);
        for p in &parts {
            base.push(base.last().unwrap() + p.num_data_rows());
        }
        Self { parts, base }
    }

    pub fn num_data_rows(&self) -> usize {
        *self.base.last().unwrap()
    }

    pub fn get_value(&self, phys_id: usize) -> StorageResult<Vec<u8>> {
        let part = self.base.partition_point(|&b| b <= phys_id) - 1;
        self.parts[part].get_value(phys_id - self.base[part])
    }
}

/// Row store of a writable segment: whole rows in sub-id-addressed slots.
/// Tombstoned slots are cleared by the transaction's `store_remove`.
#[derive(Default)]
pub struct SlotStore {
    slots: Vec<Option<Vec<u8>>>,
    data_size: u64,
}

impl SlotStore {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn get(&self, sub_id: usize) -> Option<&[u8]> {
        self.slots.get(sub_id).and_then(|s| s.as_deref())
    }

    /// Returns the previous contents of the slot.
    pub fn upsert(&mut self, sub_id: usize, row: Vec<u8>) -> Option<Vec<u8>> {
        if sub_id >= self.slots.len() {
            self.slots.resize(sub_id + 1, None);
        }
        self.data_size += row.len() as u64;
        let old = self.slots[sub_id].replace(row);
        if let Some(old) = &old {
            self.data_size -= old.len() as u64;
        }
        old
    }

    pub fn remove(&mut self, sub_id: usize) -> Option<Vec<u8>> {
        let old = self.slots.get_mut(sub_id)?.take();
        if let Some(old) = &old {
            self.data_size -= old.len() as u64;
        }
        old
    }

    /// Restore a slot to a prior state (transaction rollback).
    pub fn restore(&mut self, sub_id: usize, old: Option<Vec<u8>>) {
        if sub_id >= self.slots.len() {
            self.slots.resize(sub_id + 1, None);
        }
        if let Some(cur) = &self.slots[sub_id] {
            self.data_size -= cur.len() as u64;
        }
        if let Some(old) = &old {
            self.data_size += old.len() as u64;
        }
        self.slots[sub_id] = old;
    }

    pub fn truncate(&mut self, len: usize) {
        for slot in &self.slots[len.min(self.slots.len())..] {
            if let Some(row) = slot {
                self.data_size -= row.len() as u64;
            }
        }
        self.slots.truncate(len);
    }

    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let mut out = Vec::new();
        out.put_u64_le(self.slots.len() as u64);
        for slot in &self.slots {
            match slot {
                Some(row) => {
                    out.put_u32_le(row.len() as u32);
                    out.extend_from_slice(row);
                }
                None => out.put_u32_le(u32::MAX),
            }
        }
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let data = fs::read(path.as_ref())?;
        let mut buf = &data[..];
        if buf.remaining() < 8 {
            return Err(TracedStorageError::decode("row store truncated"));
        }
        let rows = buf.get_u64_le() as usize;
        let mut store = SlotStore::default();
        for _ in 0..rows {
            if buf.remaining() < 4 {
                return Err(TracedStorageError::decode("row store truncated"));
            }
            let len = buf.get_u32_le();
            if len == u32::MAX {
                store.slots.push(None);
            } else {
                let len = len as usize;
                if buf.remaining() < len {
                    return Err(TracedStorageError::decode("row store truncated"));
                }
                store.data_size += len as u64;
                store.slots.push(Some(buf[..len].to_vec()));
                buf.advance(len);
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_store_patch() {
        let mut store = FixedLenStore::with_capacity(4, 2);
        store.push_record(&[1, 2, 3, 4]);
        store.push_record(&[5, 6, 7, 8]);
        store.patch(1, 2, &[9, 9]);
        assert_eq!(store.get(1), vec![5, 6, 9, 9]);
        store.update_record(0, &[0, 0, 0, 0]);
        assert_eq!(store.get(0), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_store_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut var = VarLenStore::new();
        var.push_record(b"hello");
        var.push_record(b"");
        var.push_record(b"world");
        let store = RecordStore::Var(var);
        let path = dir.path().join("cg.bin");
        store.save(&path).unwrap();
        let loaded = RecordStore::load(&path).unwrap();
        assert_eq!(loaded.num_data_rows(), 3);
        assert_eq!(loaded.get_value(0).unwrap(), b"hello");
        assert_eq!(loaded.get_value(1).unwrap(), b"");
        assert_eq!(loaded.get_value(2).unwrap(), b"world");
    }

    #[test]
    fn test_dict_store_dedup() {
        let mut builder = DictZipStoreBuilder::default();
        for v in [b"aa".as_ref(), b"bb", b"aa", b"aa"] {
            builder.push_record(v);
        }
        let store = builder.finish();
        assert_eq!(store.dict.len(), 2);
        assert_eq!(store.get(2), b"aa");
        let rs = RecordStore::Dict(store);
        assert_eq!(rs.data_inflate_size(), 8);
    }

    #[test]
    fn test_multi_part_store() {
        let mut a = VarLenStore::new();
        a.push_record(b"1");
        let mut b = VarLenStore::new();
        b.push_record(b"2");
        b.push_record(b"3");
        let (a, b) = (RecordStore::Var(a), RecordStore::Var(b));
        let multi = MultiPartStore::new(vec![&a, &b]);
        assert_eq!(multi.num_data_rows(), 3);
        assert_eq!(multi.get_value(2).unwrap(), b"3");
    }

    #[test]
    fn test_slot_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SlotStore::default();
        store.upsert(0, b"a".to_vec());
        store.upsert(2, b"ccc".to_vec());
        store.remove(0);
        let path = dir.path().join("rows.bin");
        store.save(&path).unwrap();
        let loaded = SlotStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.get(0).is_none());
        assert!(loaded.get(1).is_none());
        assert_eq!(loaded.get(2).unwrap(), b"ccc");
        assert_eq!(loaded.data_size(), 3);
    }
}
