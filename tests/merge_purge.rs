use std::sync::Arc;

use segstore::{RowBuilder, SegmentedTable};

const PAD: &str = "xxxxxxxxx"; // row = 4 + 8 + 4 + 9 = 25 bytes

fn meta() -> String {
    r#"{
        "columns": [
            {"name": "a", "type": "int32"},
            {"name": "cnt", "type": "int64"},
            {"name": "pad", "type": "str"}
        ],
        "indices": [
            {"name": "a_idx", "columns": ["a"], "ordered": true, "unique": true}
        ],
        "colgroups": [
            {"name": "counters", "columns": ["cnt"]}
        ],
        "options": {
            "max_writing_segment_size": 64,
            "min_merge_seg_num": 100,
            "purge_delete_threshold": 0.5,
            "compression_threads": 2
        }
    }"#
    .to_string()
}

fn row(table: &SegmentedTable, a: i32, cnt: i64) -> Vec<u8> {
    RowBuilder::new(table.schema())
        .push_i32(a)
        .push_i64(cnt)
        .push_str(PAD)
        .finish()
}

fn col_a(table: &SegmentedTable, row: &[u8]) -> i32 {
    let cols = table.schema().parse_row(row).unwrap();
    i32::from_le_bytes(cols[0].as_slice().try_into().unwrap())
}

/// 12 rows across three frozen segments (3 rows each) plus a writable tail.
fn fill_four_segments(dir: &std::path::Path) -> Arc<SegmentedTable> {
    let table = SegmentedTable::create(dir.join("t"), &meta()).unwrap();
    let mut ctx = table.new_context();
    for i in 0..12 {
        let id = table.insert_row(&row(&table, i * 10, 0), &mut ctx).unwrap();
        assert_eq!(id, i as i64);
    }
    assert_eq!(table.segment_count(), 4);
    table
}

#[test]
fn merge_with_purge_keeps_logical_ids() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill_four_segments(dir.path());
    let mut ctx = table.new_context();

    // 2 of 3 rows deleted in each frozen segment: past the 0.5 threshold
    for id in [0i64, 1, 3, 4, 6, 7] {
        assert!(table.remove_row(id, &mut ctx).unwrap());
    }
    table.wait_background_idle();
    assert!(table.compact().unwrap());

    // three read-only segments became one, the writable tail survives
    assert_eq!(table.segment_count(), 2);
    let stats = table.segment_stats();
    assert_eq!(stats[0].logical_rows, 9);
    assert!(stats[0].purged_rows > 0);
    assert!(stats[0].physical_rows < 9);
    assert_eq!(stats[0].physical_rows, 3);

    // live rows keep their original logical ids and bytes
    for id in [2i64, 5, 8] {
        assert!(table.exists(id));
        let got = table.get_value(id, &mut ctx).unwrap();
        assert_eq!(col_a(&table, &got), id as i32 * 10);
    }
    for id in [0i64, 1, 3, 4, 6, 7] {
        assert!(!table.exists(id));
    }
    assert_eq!(table.num_data_rows(), 12);

    // the index still resolves through the purge mapping
    let key = {
        let r = row(&table, 50, 0);
        let cols = table.schema().parse_row(&r).unwrap();
        table.schema().select_index_key(0, &cols)
    };
    let live = table.index_search_exact_live(0, &key, &mut ctx).unwrap();
    assert_eq!(live, vec![5]);
}

#[test]
fn compact_without_deletions_preserves_everything() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill_four_segments(dir.path());
    let mut ctx = table.new_context();

    table.wait_background_idle();
    assert!(table.compact().unwrap());
    assert_eq!(table.segment_count(), 2);
    for i in 0..12i64 {
        let got = table.get_value(i, &mut ctx).unwrap();
        assert_eq!(col_a(&table, &got), i as i32 * 10);
    }
}

#[test]
fn mutations_during_merge_are_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill_four_segments(dir.path());
    table.wait_background_idle();

    // race a compaction against removes and an in-place counter update;
    // whatever the interleaving, the update journal keeps them visible
    let compacting = {
        let table = table.clone();
        std::thread::spawn(move || {
            table.compact().unwrap();
        })
    };
    let mut ctx = table.new_context();
    table.remove_row(3, &mut ctx).unwrap();
    table.remove_row(4, &mut ctx).unwrap();
    let cnt_col = table.schema().get_column_id("cnt").unwrap();
    table
        .update_column_integer(
            6,
            cnt_col,
            |v| {
                *v += 7;
                true
            },
            &mut ctx,
        )
        .unwrap();
    compacting.join().unwrap();
    table.wait_background_idle();

    assert!(!table.exists(3));
    assert!(!table.exists(4));
    let cnt = table.select_one_column(6, cnt_col, &mut ctx).unwrap();
    assert_eq!(i64::from_le_bytes(cnt.as_slice().try_into().unwrap()), 7);
    for id in [0i64, 1, 2, 5, 7, 8, 9, 10, 11] {
        assert!(table.exists(id), "row {} lost", id);
    }
}

#[test]
fn counter_updates_stick_on_frozen_segments() {
    let dir = tempfile::tempdir().unwrap();
    let table = fill_four_segments(dir.path());
    let mut ctx = table.new_context();
    table.wait_background_idle();

    let cnt_col = table.schema().get_column_id("cnt").unwrap();
    // id 0 is in a read-only segment by now, id 11 in the writable tail
    for id in [0i64, 11] {
        table.increment_column_value(id, cnt_col, 3, &mut ctx).unwrap();
        table.increment_column_value(id, cnt_col, 4, &mut ctx).unwrap();
        let cnt = table.select_one_column(id, cnt_col, &mut ctx).unwrap();
        assert_eq!(i64::from_le_bytes(cnt.as_slice().try_into().unwrap()), 7);
    }
}
