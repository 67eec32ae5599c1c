use std::sync::Arc;

use segstore::{RowBuilder, SegmentedTable, StorageError};

const PAD: &str = "xxxxxxxxxxxxxxxxx"; // row = 4 + 4 + 17 = 25 bytes

fn meta(max_seg_size: u64) -> String {
    format!(
        r#"{{
            "columns": [
                {{"name": "a", "type": "int32"}},
                {{"name": "pad", "type": "str"}}
            ],
            "indices": [
                {{"name": "a_idx", "columns": ["a"], "ordered": true, "unique": true}}
            ],
            "options": {{
                "max_writing_segment_size": {},
                "min_merge_seg_num": 100,
                "compression_threads": 2
            }}
        }}"#,
        max_seg_size
    )
}

fn row(table: &SegmentedTable, a: i32, pad: &str) -> Vec<u8> {
    RowBuilder::new(table.schema()).push_i32(a).push_str(pad).finish()
}

fn key(table: &SegmentedTable, a: i32) -> Vec<u8> {
    let row = row(table, a, "");
    let cols = table.schema().parse_row(&row).unwrap();
    table.schema().select_index_key(0, &cols)
}

fn col_a(table: &SegmentedTable, row: &[u8]) -> i32 {
    let cols = table.schema().parse_row(row).unwrap();
    i32::from_le_bytes(cols[0].as_slice().try_into().unwrap())
}

fn open(dir: &std::path::Path, max_seg_size: u64) -> Arc<SegmentedTable> {
    SegmentedTable::create(dir.join("t"), &meta(max_seg_size)).unwrap()
}

#[test]
fn insert_delete_reinsert_same_unique_key() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 1 << 20);
    let mut ctx = table.new_context();

    let id0 = table.insert_row(&row(&table, 1, PAD), &mut ctx).unwrap();
    assert!(table.remove_row(id0, &mut ctx).unwrap());
    assert!(!table.exists(id0));

    let id1 = table.insert_row(&row(&table, 1, PAD), &mut ctx).unwrap();
    assert!(table.exists(id1));
    let live = table
        .index_search_exact_live(0, &key(&table, 1), &mut ctx)
        .unwrap();
    assert_eq!(live, vec![id1]);
    if id1 != id0 {
        assert!(!table.exists(id0));
    }
}

#[test]
fn duplicate_key_rejected_in_writable_segment() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 1 << 20);
    let mut ctx = table.new_context();

    table.insert_row(&row(&table, 7, PAD), &mut ctx).unwrap();
    let err = table.insert_row(&row(&table, 7, PAD), &mut ctx).unwrap_err();
    assert!(matches!(err.kind(), StorageError::DupKey { .. }));
    // a failed insert must not leak a row
    assert_eq!(table.num_data_rows(), 1);
}

#[test]
fn duplicate_key_rejected_across_frozen_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 64);
    let mut ctx = table.new_context();

    for a in [10, 20, 30, 40] {
        table.insert_row(&row(&table, a, PAD), &mut ctx).unwrap();
    }
    // rows 10..30 are frozen now; 10 must still collide
    let err = table.insert_row(&row(&table, 10, PAD), &mut ctx).unwrap_err();
    assert!(matches!(err.kind(), StorageError::DupKey { .. }));
}

#[test]
fn upsert_across_frozen_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 64);
    let mut ctx = table.new_context();

    for a in [10, 20, 30, 40] {
        table.insert_row(&row(&table, a, PAD), &mut ctx).unwrap();
    }
    assert!(table.segment_count() >= 2);

    // key 10 lives in the frozen segment: tombstone-old-and-insert-new
    let new_id = table.upsert_row(&row(&table, 10, "updated"), &mut ctx).unwrap();
    assert_eq!(ctx.is_upsert_overwritten, 2);
    assert!(new_id > 0);
    assert!(!table.exists(0));
    assert!(table.exists(new_id));
    let live = table
        .index_search_exact_live(0, &key(&table, 10), &mut ctx)
        .unwrap();
    assert_eq!(live, vec![new_id]);

    // key 40 lives in the writable tail: in-place rewrite, id kept
    let id40 = table
        .index_search_exact_live(0, &key(&table, 40), &mut ctx)
        .unwrap()[0];
    let same_id = table.upsert_row(&row(&table, 40, "inplace"), &mut ctx).unwrap();
    assert_eq!(ctx.is_upsert_overwritten, 1);
    assert_eq!(same_id, id40);

    // fresh key: plain insert
    let fresh = table.upsert_row(&row(&table, 99, PAD), &mut ctx).unwrap();
    assert_eq!(ctx.is_upsert_overwritten, 0);
    assert!(table.exists(fresh));
}

#[test]
fn update_row_in_writable_preserves_id() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 1 << 20);
    let mut ctx = table.new_context();

    let id = table.insert_row(&row(&table, 5, PAD), &mut ctx).unwrap();
    let same = table.update_row(id, &row(&table, 5, "changed"), &mut ctx).unwrap();
    assert_eq!(same, id);
    let got = table.get_value(id, &mut ctx).unwrap();
    let cols = table.schema().parse_row(&got).unwrap();
    assert_eq!(cols[1], b"changed");
}

#[test]
fn update_row_across_frozen_boundary_changes_id() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 64);
    let mut ctx = table.new_context();

    for a in [10, 20, 30, 40] {
        table.insert_row(&row(&table, a, PAD), &mut ctx).unwrap();
    }
    let new_id = table.update_row(0, &row(&table, 10, "moved"), &mut ctx).unwrap();
    assert_ne!(new_id, 0);
    assert!(!table.exists(0));
    let got = table.get_value(new_id, &mut ctx).unwrap();
    assert_eq!(col_a(&table, &got), 10);
}

#[test]
fn remove_row_twice_reports_false() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 1 << 20);
    let mut ctx = table.new_context();

    let id = table.insert_row(&row(&table, 1, PAD), &mut ctx).unwrap();
    assert!(table.remove_row(id, &mut ctx).unwrap());
    assert!(!table.remove_row(id, &mut ctx).unwrap());
}

#[test]
fn full_scan_skips_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), 64);
    let mut ctx = table.new_context();

    for a in 0..8 {
        table.insert_row(&row(&table, a, PAD), &mut ctx).unwrap();
    }
    table.remove_row(2, &mut ctx).unwrap();
    table.remove_row(5, &mut ctx).unwrap();

    let mut iter = table.create_store_iter_forward();
    let mut seen = vec![];
    while let Some((id, row)) = iter.next() {
        assert!(table.exists(id));
        seen.push(col_a(&table, &row));
    }
    assert_eq!(seen, vec![0, 1, 3, 4, 6, 7]);

    let mut iter = table.create_store_iter_backward();
    let mut seen = vec![];
    while let Some((_, row)) = iter.next() {
        seen.push(col_a(&table, &row));
    }
    assert_eq!(seen, vec![7, 6, 4, 3, 1, 0]);

    assert!(iter.seek_exact(2).is_none());
    let hit = iter.seek_exact(3).unwrap();
    assert_eq!(col_a(&table, &hit), 3);
}
