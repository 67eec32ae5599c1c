use std::sync::Arc;

use segstore::{RowBuilder, SegmentedTable};

const PAD: &str = "xxxxxxxxxxxxxxxxx"; // row = 25 bytes, 3 rows per segment

fn meta() -> String {
    r#"{
        "columns": [
            {"name": "a", "type": "int32"},
            {"name": "pad", "type": "str"}
        ],
        "indices": [
            {"name": "a_idx", "columns": ["a"], "ordered": true, "unique": false}
        ],
        "options": {
            "max_writing_segment_size": 64,
            "min_merge_seg_num": 100,
            "compression_threads": 2
        }
    }"#
    .to_string()
}

fn row(table: &SegmentedTable, a: i32) -> Vec<u8> {
    RowBuilder::new(table.schema()).push_i32(a).push_str(PAD).finish()
}

fn key(table: &SegmentedTable, a: i32) -> Vec<u8> {
    let r = row(table, a);
    let cols = table.schema().parse_row(&r).unwrap();
    table.schema().select_index_key(0, &cols)
}

fn col_a(table: &SegmentedTable, id: i64) -> i32 {
    let mut ctx = table.new_context();
    let row = table.get_value(id, &mut ctx).unwrap();
    let cols = table.schema().parse_row(&row).unwrap();
    i32::from_le_bytes(cols[0].as_slice().try_into().unwrap())
}

/// `[3,1,4] [1,5,9] [2,6]` across three segments, forced by segment-size
/// freezes.
fn fill(dir: &std::path::Path) -> Arc<SegmentedTable> {
    let table = SegmentedTable::create(dir.join("t"), &meta()).unwrap();
    let mut ctx = table.new_context();
    for a in [3, 1, 4, 1, 5, 9, 2, 6] {
        table.insert_row(&row(&table, a), &mut ctx).unwrap();
    }
    assert_eq!(table.segment_count(), 3);
    table
}

#[test]
fn forward_k_way_scan_is_sorted_with_stable_ties() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill(dir.path());

    let mut iter = table.create_index_iter_forward(0).unwrap();
    let mut ids = vec![];
    let mut values = vec![];
    while let Some(entry) = iter.next() {
        values.push(col_a(&table, entry.id));
        ids.push(entry.id);
    }
    assert_eq!(values, vec![1, 1, 2, 3, 4, 5, 6, 9]);
    // the duplicate key resolves segment 0 (id 1) before segment 1 (id 3)
    assert_eq!(&ids[..2], &[1, 3]);
}

#[test]
fn backward_k_way_scan_is_reverse_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill(dir.path());

    let mut iter = table.create_index_iter_backward(0).unwrap();
    let mut values = vec![];
    let mut ids = vec![];
    while let Some(entry) = iter.next() {
        values.push(col_a(&table, entry.id));
        ids.push(entry.id);
    }
    assert_eq!(values, vec![9, 6, 5, 4, 3, 2, 1, 1]);
    // backward ties resolve the higher segment first
    assert_eq!(&ids[6..], &[3, 1]);
}

#[test]
fn seek_lower_bound_exact_and_between() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill(dir.path());

    let mut iter = table.create_index_iter_forward(0).unwrap();
    let (entry, exact) = iter.seek_lower_bound(&key(&table, 4)).unwrap().unwrap();
    assert!(exact);
    assert_eq!(col_a(&table, entry.id), 4);
    let next = iter.next().unwrap();
    assert_eq!(col_a(&table, next.id), 5);

    // between keys: 7 lands on 9
    let (entry, exact) = iter.seek_lower_bound(&key(&table, 7)).unwrap().unwrap();
    assert!(!exact);
    assert_eq!(col_a(&table, entry.id), 9);
    assert!(iter.next().is_none());

    // past the end
    assert!(iter.seek_lower_bound(&key(&table, 100)).unwrap().is_none());

    // empty key rewinds to the minimum
    let (entry, _) = iter.seek_lower_bound(&[]).unwrap().unwrap();
    assert_eq!(col_a(&table, entry.id), 1);
}

#[test]
fn scan_skips_deleted_entries() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill(dir.path());
    let mut ctx = table.new_context();

    // remove one of the duplicate 1s (segment 1, id 3) and the 9
    table.remove_row(3, &mut ctx).unwrap();
    table.remove_row(5, &mut ctx).unwrap();

    let mut iter = table.create_index_iter_forward(0).unwrap();
    let mut values = vec![];
    while let Some(entry) = iter.next() {
        values.push(col_a(&table, entry.id));
    }
    assert_eq!(values, vec![1, 2, 3, 4, 6]);
}

#[test]
fn scan_survives_background_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill(dir.path());
    table.wait_background_idle();

    // segments are read-only now; order and ids are unchanged
    let mut iter = table.create_index_iter_forward(0).unwrap();
    let mut values = vec![];
    while let Some(entry) = iter.next() {
        values.push(col_a(&table, entry.id));
    }
    assert_eq!(values, vec![1, 1, 2, 3, 4, 5, 6, 9]);
}
