use segstore::{RowBuilder, SegmentedTable, StorageError};

const PAD: &str = "xxxxxxxxxxxxxxxxx";

fn meta() -> String {
    r#"{
        "columns": [
            {"name": "a", "type": "int32"},
            {"name": "pad", "type": "str"}
        ],
        "indices": [
            {"name": "a_idx", "columns": ["a"], "ordered": true, "unique": true}
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

#[test]
fn reopen_preserves_rows_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("t");
    {
        let table = SegmentedTable::create(&root, &meta()).unwrap();
        let mut ctx = table.new_context();
        for a in 0..8 {
            table.insert_row(&row(&table, a), &mut ctx).unwrap();
        }
        table.remove_row(1, &mut ctx).unwrap();
        table.remove_row(6, &mut ctx).unwrap();
        table.wait_background_idle();
        table.flush().unwrap();
    } // close

    let table = SegmentedTable::open(&root).unwrap();
    let mut ctx = table.new_context();
    assert_eq!(table.num_data_rows(), 8);
    for a in [0i32, 2, 3, 4, 5, 7] {
        let id = a as i64;
        assert!(table.exists(id), "row {} missing after reopen", a);
        let got = table.get_value(id, &mut ctx).unwrap();
        let cols = table.schema().parse_row(&got).unwrap();
        assert_eq!(cols[0], a.to_le_bytes().to_vec());
    }
    assert!(!table.exists(1));
    assert!(!table.exists(6));

    // the unique index survives the reopen
    let key = {
        let r = row(&table, 3);
        let cols = table.schema().parse_row(&r).unwrap();
        table.schema().select_index_key(0, &cols)
    };
    assert!(table.index_key_exists(0, &key, &mut ctx).unwrap());
}

#[test]
fn crashed_merge_refuses_open_until_operator_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("t");
    {
        let table = SegmentedTable::create(&root, &meta()).unwrap();
        let mut ctx = table.new_context();
        for a in 0..5 {
            table.insert_row(&row(&table, a), &mut ctx).unwrap();
        }
        table.wait_background_idle();
    }

    // simulate a merge that died mid-way into the next generation
    let crashed = root.join("g-0001");
    std::fs::create_dir_all(crashed.join("rd-0000")).unwrap();
    std::fs::write(crashed.join("merging.lock"), b"").unwrap();
    std::fs::write(crashed.join("rd-0000").join("partial.bin"), b"junk").unwrap();

    let err = SegmentedTable::open(&root).unwrap_err();
    assert!(matches!(err.kind(), StorageError::LogicError(_)));
    assert!(err.to_string().contains("merging.lock"));
    assert!(err.to_string().contains("g-0001"));

    // operator removes the crashed generation; the previous one is intact
    std::fs::remove_dir_all(&crashed).unwrap();
    let table = SegmentedTable::open(&root).unwrap();
    assert_eq!(table.num_data_rows(), 5);
    for a in 0..5i64 {
        assert!(table.exists(a));
    }
}

#[test]
fn empty_table_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("t");
    {
        SegmentedTable::create(&root, &meta()).unwrap();
    }
    let table = SegmentedTable::open(&root).unwrap();
    assert_eq!(table.num_data_rows(), 0);
    let mut iter = table.create_store_iter_forward();
    assert!(iter.next().is_none());
}
