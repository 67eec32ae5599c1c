// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Index stores. Writable segments keep mutable map-backed indices keyed by
//! the memcomparable key encoding; read-only segments keep a sorted entry
//! run supporting exact search and lower-bound iteration. Entry ids are
//! segment-local: sub ids in writable segments, physical ids in read-only
//! segments.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use smallvec::SmallVec;

use crate::error::{StorageResult, TracedStorageError};

type IdList = SmallVec<[u32; 2]>;

pub enum WritableIndex {
    Ordered(BTreeMap<Vec<u8>, IdList>),
    Unordered(HashMap<Vec<u8>, IdList>),
}

impl WritableIndex {
    pub fn new(ordered: bool) -> Self {
        if ordered {
            WritableIndex::Ordered(BTreeMap::new())
        } else {
            WritableIndex::Unordered(HashMap::new())
        }
    }

    fn ids_mut(&mut self, key: &[u8]) -> &mut IdList {
        match self {
            WritableIndex::Ordered(m) => m.entry(key.to_vec()).or_default(),
            WritableIndex::Unordered(m) => m.entry(key.to_vec()).or_default(),
        }
    }

    fn ids(&self, key: &[u8]) -> Option<&IdList> {
        match self {
            WritableIndex::Ordered(m) => m.get(key),
            WritableIndex::Unordered(m) => m.get(key),
        }
    }

    /// Insert an entry. With `unique`, fails (returns false) when the key
    /// already holds any id.
    pub fn insert(&mut self, key: &[u8], sub_id: u32, unique: bool) -> bool {
        if unique {
            if let Some(ids) = self.ids(key) {
                if !ids.is_empty() {
                    return false;
                }
            }
        }
        let ids = self.ids_mut(key);
        if ids.contains(&sub_id) {
            return false;
        }
        ids.push(sub_id);
        true
    }

    pub fn remove(&mut self, key: &[u8], sub_id: u32) -> bool {
        let removed = match self {
            WritableIndex::Ordered(m) => remove_in(m.get_mut(key), sub_id),
            WritableIndex::Unordered(m) => remove_in(m.get_mut(key), sub_id),
        };
        if removed {
            let empty = self.ids(key).map(|ids| ids.is_empty()).unwrap_or(false);
            if empty {
                match self {
                    WritableIndex::Ordered(m) => {
                        m.remove(key);
                    }
                    WritableIndex::Unordered(m) => {
                        m.remove(key);
                    }
                }
            }
        }
        removed
    }

    pub fn replace(&mut self, key: &[u8], old_id: u32, new_id: u32) -> bool {
        if !self.remove(key, old_id) {
            return false;
        }
        self.ids_mut(key).push(new_id);
        true
    }

    pub fn search_exact_append(&self, key: &[u8], out: &mut Vec<i64>) {
        if let Some(ids) = self.ids(key) {
            out.extend(ids.iter().map(|&id| id as i64));
        }
    }

    pub fn entry_count(&self) -> usize {
        match self {
            WritableIndex::Ordered(m) => m.values().map(|v| v.len()).sum(),
            WritableIndex::Unordered(m) => m.values().map(|v| v.len()).sum(),
        }
    }

    pub fn storage_size(&self) -> u64 {
        let keys: usize = match self {
            WritableIndex::Ordered(m) => m.keys().map(|k| k.len()).sum(),
            WritableIndex::Unordered(m) => m.keys().map(|k| k.len()).sum(),
        };
        (keys + self.entry_count() * 4) as u64
    }

    /// Snapshot of all entries sorted by (key, id). Used by iterators and by
    /// freeze-flush.
    pub fn sorted_entries(&self) -> Vec<(Vec<u8>, u32)> {
        let mut entries: Vec<(Vec<u8>, u32)> = match self {
            WritableIndex::Ordered(m) => m
                .iter()
                .flat_map(|(k, ids)| ids.iter().map(|&id| (k.clone(), id)))
                .collect(),
            WritableIndex::Unordered(m) => m
                .iter()
                .flat_map(|(k, ids)| ids.iter().map(|&id| (k.clone(), id)))
                .collect(),
        };
        entries.sort();
        entries
    }

    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let entries = self.sorted_entries();
        let mut out = Vec::new();
        out.put_u64_le(entries.len() as u64);
        for (key, id) in &entries {
            out.put_u32_le(key.len() as u32);
            out.extend_from_slice(key);
            out.put_u32_le(*id);
        }
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, ordered: bool) -> StorageResult<Self> {
        let data = fs::read(path.as_ref())?;
        let mut buf = &data[..];
        if buf.remaining() < 8 {
            return Err(TracedStorageError::decode("index file truncated"));
        }
        let n = buf.get_u64_le() as usize;
        let mut index = WritableIndex::new(ordered);
        for _ in 0..n {
            if buf.remaining() < 4 {
                return Err(TracedStorageError::decode("index file truncated"));
            }
            let klen = buf.get_u32_le() as usize;
            if buf.remaining() < klen + 4 {
                return Err(TracedStorageError::decode("index file truncated"));
            }
            let key = buf[..klen].to_vec();
            buf.advance(klen);
            let id = buf.get_u32_le();
            index.ids_mut(&key).push(id);
        }
        Ok(index)
    }
}

fn remove_in(ids: Option<&mut IdList>, sub_id: u32) -> bool {
    if let Some(ids) = ids {
        if let Some(pos) = ids.iter().position(|&id| id == sub_id) {
            ids.remove(pos);
            return true;
        }
    }
    false
}

/// Immutable index of a read-only segment: entries sorted by (key, physical
/// id), keys pooled.
#[derive(Default)]
pub struct SortedIndexStore {
    key_offsets: Vec<u32>,
    key_pool: Vec<u8>,
    ids: Vec<u32>,
}

impl SortedIndexStore {
    pub fn build(mut pairs: Vec<(Vec<u8>, u32)>) -> Self {
        pairs.sort();
        let mut store = Self {
            key_offsets: vec![0],
            key_pool: Vec::new(),
            ids: Vec::with_capacity(pairs.len()),
        };
        for (key, id) in pairs {
            store.key_pool.extend_from_slice(&key);
            store.key_offsets.push(store.key_pool.len() as u32);
            store.ids.push(id);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn key(&self, entry: usize) -> &[u8] {
        &self.key_pool[self.key_offsets[entry] as usize..self.key_offsets[entry + 1] as usize]
    }

    pub fn id(&self, entry: usize) -> u32 {
        self.ids[entry]
    }

    /// First entry whose key is >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.partition(|k| k < key)
    }

    /// First entry whose key is > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.partition(|k| k <= key)
    }

    fn partition(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if pred(self.key(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Append physical ids of all entries equal to `key`.
    pub fn search_exact_append(&self, key: &[u8], out: &mut Vec<i64>) {
        let mut entry = self.lower_bound(key);
        while entry < self.len() && self.key(entry) == key {
            out.push(self.ids[entry] as i64);
            entry += 1;
        }
    }

    pub fn storage_size(&self) -> u64 {
        (self.key_pool.len() + self.ids.len() * 8) as u64
    }

    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let mut out = Vec::new();
        out.put_u64_le(self.len() as u64);
        for &off in &self.key_offsets {
            out.put_u32_le(off);
        }
        for &id in &self.ids {
            out.put_u32_le(id);
        }
        out.extend_from_slice(&self.key_pool);
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let data = fs::read(path.as_ref())?;
        let mut buf = &data[..];
        if buf.remaining() < 8 {
            return Err(TracedStorageError::decode("sorted index truncated"));
        }
        let n = buf.get_u64_le() as usize;
        if buf.remaining() < (n + 1) * 4 + n * 4 {
            return Err(TracedStorageError::decode("sorted index truncated"));
        }
        let key_offsets: Vec<u32> = (0..=n).map(|_| buf.get_u32_le()).collect();
        let ids: Vec<u32> = (0..n).map(|_| buf.get_u32_le()).collect();
        let pool_len = *key_offsets.last().unwrap() as usize;
        if buf.remaining() != pool_len {
            return Err(TracedStorageError::decode("sorted index truncated"));
        }
        Ok(Self {
            key_offsets,
            ids,
            key_pool: buf.to_vec(),
        })
    }
}

enum EntrySrc {
    /// Snapshot of a writable index taken at iterator creation or seek.
    Wr(Vec<(Vec<u8>, u32)>),
    Ro(Arc<SortedIndexStore>),
}

impl EntrySrc {
    fn len(&self) -> usize {
        match self {
            EntrySrc::Wr(v) => v.len(),
            EntrySrc::Ro(s) => s.len(),
        }
    }

    fn entry(&self, i: usize) -> (&[u8], u32) {
        match self {
            EntrySrc::Wr(v) => (&v[i].0, v[i].1),
            EntrySrc::Ro(s) => (s.key(i), s.id(i)),
        }
    }

    fn lower_bound(&self, key: &[u8]) -> usize {
        match self {
            EntrySrc::Wr(v) => v.partition_point(|(k, _)| k.as_slice() < key),
            EntrySrc::Ro(s) => s.lower_bound(key),
        }
    }

    fn upper_bound(&self, key: &[u8]) -> usize {
        match self {
            EntrySrc::Wr(v) => v.partition_point(|(k, _)| k.as_slice() <= key),
            EntrySrc::Ro(s) => s.upper_bound(key),
        }
    }
}

/// Cursor over one segment's ordered index entries, forward or backward.
/// Yields (key, segment-local id).
pub struct SegIndexIter {
    entries: EntrySrc,
    backward: bool,
    /// Forward: next entry to yield. Backward: number of entries left.
    pos: usize,
}

impl SegIndexIter {
    pub fn from_writable(entries: Vec<(Vec<u8>, u32)>, backward: bool) -> Self {
        let pos = if backward { entries.len() } else { 0 };
        Self {
            entries: EntrySrc::Wr(entries),
            backward,
            pos,
        }
    }

    pub fn from_readonly(store: Arc<SortedIndexStore>, backward: bool) -> Self {
        let pos = if backward { store.len() } else { 0 };
        Self {
            entries: EntrySrc::Ro(store),
            backward,
            pos,
        }
    }

    pub fn reset(&mut self) {
        self.pos = if self.backward { self.entries.len() } else { 0 };
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, u32)> {
        if self.backward {
            if self.pos == 0 {
                return None;
            }
            self.pos -= 1;
            let (k, id) = self.entries.entry(self.pos);
            Some((k.to_vec(), id))
        } else {
            if self.pos >= self.entries.len() {
                return None;
            }
            let (k, id) = self.entries.entry(self.pos);
            self.pos += 1;
            Some((k.to_vec(), id))
        }
    }

    /// Position so that the next `next()` call yields the first entry with
    /// key >= `key` (forward) or the last entry with key <= `key` (backward).
    pub fn seek_lower_bound(&mut self, key: &[u8]) {
        self.pos = if self.backward {
            self.entries.upper_bound(key)
        } else {
            self.entries.lower_bound(key)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_insert() {
        let mut index = WritableIndex::new(true);
        assert!(index.insert(b"k1", 0, true));
        assert!(!index.insert(b"k1", 1, true));
        assert!(index.remove(b"k1", 0));
        assert!(index.insert(b"k1", 1, true));
        let mut out = vec![];
        index.search_exact_append(b"k1", &mut out);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn test_non_unique_multi() {
        let mut index = WritableIndex::new(true);
        assert!(index.insert(b"k", 3, false));
        assert!(index.insert(b"k", 1, false));
        assert!(!index.insert(b"k", 1, false));
        let entries = index.sorted_entries();
        assert_eq!(entries, vec![(b"k".to_vec(), 1), (b"k".to_vec(), 3)]);
    }

    #[test]
    fn test_sorted_store_search() {
        let store = SortedIndexStore::build(vec![
            (b"b".to_vec(), 1),
            (b"a".to_vec(), 0),
            (b"b".to_vec(), 4),
            (b"d".to_vec(), 2),
        ]);
        let mut out = vec![];
        store.search_exact_append(b"b", &mut out);
        assert_eq!(out, vec![1, 4]);
        assert_eq!(store.lower_bound(b"c"), 3);
        assert_eq!(store.lower_bound(b"e"), 4);
    }

    #[test]
    fn test_sorted_store_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SortedIndexStore::build(vec![(b"x".to_vec(), 7), (b"y".to_vec(), 8)]);
        let path = dir.path().join("index.bin");
        store.save(&path).unwrap();
        let loaded = SortedIndexStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.key(0), b"x");
        assert_eq!(loaded.id(1), 8);
    }

    #[test]
    fn test_seg_index_iter_directions() {
        let store = Arc::new(SortedIndexStore::build(vec![
            (b"a".to_vec(), 0),
            (b"b".to_vec(), 1),
            (b"c".to_vec(), 2),
        ]));
        let mut fwd = SegIndexIter::from_readonly(store.clone(), false);
        fwd.seek_lower_bound(b"b");
        assert_eq!(fwd.next().unwrap().0, b"b");
        assert_eq!(fwd.next().unwrap().0, b"c");
        assert!(fwd.next().is_none());

        let mut bwd = SegIndexIter::from_readonly(store, true);
        bwd.seek_lower_bound(b"b");
        assert_eq!(bwd.next().unwrap().0, b"b");
        assert_eq!(bwd.next().unwrap().0, b"a");
        assert!(bwd.next().is_none());
    }
}
