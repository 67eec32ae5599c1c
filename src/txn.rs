// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

use tracing::warn;

use crate::error::{StorageResult, TracedStorageError};
use crate::schema::IndexId;
use crate::segment::Segment;

enum UndoOp {
    IndexInsert {
        index_id: IndexId,
        key: Vec<u8>,
        sub_id: u32,
    },
    IndexRemove {
        index_id: IndexId,
        key: Vec<u8>,
        sub_id: u32,
    },
    StoreWrite {
        sub_id: usize,
        old: Option<Vec<u8>>,
    },
}

/// Scoped transaction over one writable segment. Rolls back on every exit
/// path that did not observe an explicit [`commit`](TransactionGuard::commit).
pub struct TransactionGuard<'a> {
    seg: &'a Segment,
    undo: Vec<UndoOp>,
    finished: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn new(seg: &'a Segment) -> Self {
        debug_assert!(seg.writable().is_some());
        Self {
            seg,
            undo: Vec::new(),
            finished: false,
        }
    }

    pub fn store_get_row(&self, sub_id: usize) -> StorageResult<Vec<u8>> {
        let wseg = self.seg.writable().unwrap();
        wseg.store
            .read()
            .get(sub_id)
            .map(|r| r.to_vec())
            .ok_or_else(|| {
                TracedStorageError::read_record(
                    "storeGetRow",
                    self.seg.dir().display(),
                    0,
                    sub_id as i64,
                )
            })
    }

    pub fn store_upsert(&mut self, sub_id: usize, row: &[u8]) {
        let wseg = self.seg.writable().unwrap();
        let old = wseg.store.write().upsert(sub_id, row.to_vec());
        self.undo.push(UndoOp::StoreWrite { sub_id, old });
    }

    pub fn store_remove(&mut self, sub_id: usize) {
        let wseg = self.seg.writable().unwrap();
        let old = wseg.store.write().remove(sub_id);
        self.undo.push(UndoOp::StoreWrite { sub_id, old });
    }

    /// Insert an index entry. Returns false on a unique-key conflict; the
    /// transaction stays usable so the caller can roll back earlier work.
    pub fn index_insert(&mut self, index_id: IndexId, key: &[u8], sub_id: usize) -> bool {
        let wseg = self.seg.writable().unwrap();
        let unique = self.seg.schema.get_index_schema(index_id).unique;
        if !wseg.indices[index_id]
            .write()
            .insert(key, sub_id as u32, unique)
        {
            return false;
        }
        self.undo.push(UndoOp::IndexInsert {
            index_id,
            key: key.to_vec(),
            sub_id: sub_id as u32,
        });
        true
    }

    pub fn index_remove(&mut self, index_id: IndexId, key: &[u8], sub_id: usize) -> bool {
        let wseg = self.seg.writable().unwrap();
        if !wseg.indices[index_id].write().remove(key, sub_id as u32) {
            return false;
        }
        self.undo.push(UndoOp::IndexRemove {
            index_id,
            key: key.to_vec(),
            sub_id: sub_id as u32,
        });
        true
    }

    pub fn commit(mut self) -> StorageResult<()> {
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.apply_undo();
        self.finished = true;
    }

    fn apply_undo(&mut self) {
        let wseg = self.seg.writable().unwrap();
        for op in self.undo.drain(..).rev() {
            match op {
                UndoOp::IndexInsert {
                    index_id,
                    key,
                    sub_id,
                } => {
                    wseg.indices[index_id].write().remove(&key, sub_id);
                }
                UndoOp::IndexRemove {
                    index_id,
                    key,
                    sub_id,
                } => {
                    let unique = self.seg.schema.get_index_schema(index_id).unique;
                    wseg.indices[index_id].write().insert(&key, sub_id, unique);
                }
                UndoOp::StoreWrite { sub_id, old } => {
                    wseg.store.write().restore(sub_id, old);
                }
            }
        }
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                seg = %self.seg.dir().display(),
                "transaction dropped without committing or aborting"
            );
            self.apply_undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RowBuilder, SchemaConfig};
    use std::sync::Arc;

    fn schema() -> Arc<SchemaConfig> {
        SchemaConfig::from_json(
            r#"{
                "columns": [{"name": "a", "type": "int32"}],
                "indices": [{"name": "a_idx", "columns": ["a"], "unique": true}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_rollback_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::new_writable(dir.path().join("wr-0000"), schema()).unwrap();
        let row = RowBuilder::new(&seg.schema).push_i32(1).finish();
        let key = seg
            .schema
            .select_index_key(0, &seg.schema.parse_row(&row).unwrap());

        let mut txn = TransactionGuard::new(&seg);
        assert!(txn.index_insert(0, &key, 0));
        txn.store_upsert(0, &row);
        txn.rollback();

        let wseg = seg.writable().unwrap();
        assert!(wseg.store.read().get(0).is_none());
        let mut out = vec![];
        wseg.indices[0].read().search_exact_append(&key, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_commit_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::new_writable(dir.path().join("wr-0000"), schema()).unwrap();
        let row = RowBuilder::new(&seg.schema).push_i32(2).finish();
        let key = seg
            .schema
            .select_index_key(0, &seg.schema.parse_row(&row).unwrap());

        let mut txn = TransactionGuard::new(&seg);
        assert!(txn.index_insert(0, &key, 0));
        txn.store_upsert(0, &row);
        txn.commit().unwrap();

        let wseg = seg.writable().unwrap();
        assert_eq!(wseg.store.read().get(0).unwrap(), row.as_slice());
    }

    #[test]
    fn test_unique_conflict_reported() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::new_writable(dir.path().join("wr-0000"), schema()).unwrap();
        let row = RowBuilder::new(&seg.schema).push_i32(3).finish();
        let key = seg
            .schema
            .select_index_key(0, &seg.schema.parse_row(&row).unwrap());

        let mut txn = TransactionGuard::new(&seg);
        assert!(txn.index_insert(0, &key, 0));
        txn.store_upsert(0, &row);
        txn.commit().unwrap();

        let mut txn = TransactionGuard::new(&seg);
        assert!(!txn.index_insert(0, &key, 1));
        txn.rollback();
    }
}
