use std::{
    ops::Bound,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use lumbung::{
    storage::{
        btree::{KeyRange, ScanDirection},
        config::DatabaseConfig,
        schema::{ColumnSchema, TableSchemaBuilder},
    },
    types::{
        entry::RowRef,
        error::DatabaseError,
        value::{DataType, LobKind, Value},
    },
    utils::mock::TempDatabase,
};
use parking_lot::Mutex;

fn users_table() -> lumbung::storage::schema::TableSchema {
    TableSchemaBuilder::new("users")
        .column(ColumnSchema::new("id", DataType::Integer).primary_key())
        .column(ColumnSchema::new("name", DataType::Text).not_null())
        .column(ColumnSchema::new("age", DataType::Integer).with_default(Value::Integer(18)))
        .column(ColumnSchema::new("bio", DataType::Clob))
        .build()
        .unwrap()
}

fn user(id: i64, name: &str, age: Option<i64>) -> Vec<Value> {
    vec![
        Value::Integer(id),
        Value::Text(name.to_string()),
        age.map_or(Value::Null, Value::Integer),
    ]
}

#[test]
fn test_create_table_registers_primary_index() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    let schema = db.create_table(users_table()).unwrap();

    assert_eq!(schema.name, "users");
    assert_eq!(schema.column_names(), vec!["id", "name", "age", "bio"]);
    let pk = schema.get_index("users_pk").unwrap();
    assert!(pk.unique && pk.primary);
    assert_eq!(pk.columns, vec![0]);
    assert_ne!(schema.table_id, pk.index_id);

    assert!(matches!(
        db.create_table(users_table()),
        Err(DatabaseError::TableExists { .. })
    ));
    assert!(matches!(
        db.table("missing"),
        Err(DatabaseError::TableNotFound { .. })
    ));
}

#[test]
fn test_insert_applies_defaults_and_constraints() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();

    let row_ref = db.insert("users", user(1, "Alice", None)).unwrap();
    let row = db.get("users", row_ref).unwrap();
    assert_eq!(row.values[2], Value::Integer(18));
    assert_eq!(row.values[3], Value::Null);
    assert!(row.row_id.is_some());

    assert!(matches!(
        db.insert("users", vec![Value::Integer(2), Value::Null]),
        Err(DatabaseError::ConstraintViolation { .. })
    ));
    assert!(matches!(
        db.insert("users", vec![Value::Integer(3), Value::Integer(5)]),
        Err(DatabaseError::TypeMismatch { .. })
    ));
    assert!(matches!(
        db.insert("users", vec![Value::Null; 5]),
        Err(DatabaseError::ConstraintViolation { .. })
    ));
    assert!(matches!(
        db.insert("users", user(1, "Again", None)),
        Err(DatabaseError::DuplicateKey { .. })
    ));

    // Failed inserts leave nothing behind.
    assert_eq!(db.scan_table("users").unwrap().len(), 1);
    assert_eq!(db.page_store().active_transactions(), 0);
}

#[test]
fn test_row_ids_are_monotonic() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();
    for id in 0..20 {
        db.insert("users", user(id, "u", Some(id))).unwrap();
    }
    let ids: Vec<u64> = db
        .scan_table("users")
        .unwrap()
        .into_iter()
        .filter_map(|(_, row)| row.row_id)
        .collect();
    assert_eq!(ids.len(), 20);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_large_rows_spill_to_overflow() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(
        TableSchemaBuilder::new("docs")
            .column(ColumnSchema::new("body", DataType::Text))
            .build()
            .unwrap(),
    )
    .unwrap();

    let body = "lorem ipsum ".repeat(2000);
    let row_ref = db.insert("docs", vec![Value::Text(body.clone())]).unwrap();
    assert_eq!(db.get("docs", row_ref).unwrap().values[0], Value::Text(body));

    let free_before = db.page_store().header().freelist_length;
    db.delete("docs", row_ref).unwrap();
    assert!(db.page_store().header().freelist_length > free_before);
    assert!(db.scan_table("docs").unwrap().is_empty());
}

#[test]
fn test_lob_columns_spill_to_lob_store() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp
        .open(DatabaseConfig::default().with_lob_inline_threshold(64))
        .unwrap();
    db.create_table(users_table()).unwrap();

    let short = "short bio".to_string();
    let long = "é".repeat(10_000);
    let mut small = user(1, "Ann", Some(30));
    small.push(Value::Text(short.clone()));
    let mut large = user(2, "Bea", Some(31));
    large.push(Value::Text(long.clone()));

    let small_ref = db.insert("users", small).unwrap();
    let large_ref = db.insert("users", large).unwrap();

    let stored = db.get("users", small_ref).unwrap();
    assert_eq!(stored.values[3], Value::Text(short));

    let stored = db.get("users", large_ref).unwrap();
    let Value::Lob(lob) = stored.values[3] else {
        panic!("expected a LOB reference, got {:?}", stored.values[3]);
    };
    assert_eq!(lob.kind, LobKind::Clob);
    assert_eq!(lob.length, long.len() as u64);
    assert_eq!(db.read_lob(&lob).unwrap(), long.as_bytes());

    let materialized = db.materialize(&stored).unwrap();
    assert_eq!(materialized.values[3], Value::Text(long));
    assert_eq!(materialized.row_id, stored.row_id);

    // Deleting the row frees its chunks.
    let free_before = db.page_store().header().freelist_length;
    db.delete("users", large_ref).unwrap();
    assert!(db.page_store().header().freelist_length >= free_before + 5);
}

#[test]
fn test_store_lob_directly() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    let content: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
    let lob = db.store_lob(content.as_slice(), LobKind::Blob).unwrap();
    let mut reader = db.lob_reader(&lob);
    let mut read = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut read).unwrap();
    assert_eq!(read, content);
}

#[test]
fn test_secondary_index_backfill_and_scan() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();
    for id in 0..100 {
        db.insert("users", user(id, &format!("user{:03}", id), Some(id % 10)))
            .unwrap();
    }

    db.create_index("users", "users_age", &["age"], false)
        .unwrap();
    for id in 100..120 {
        db.insert("users", user(id, "late", Some(3))).unwrap();
    }

    let threes = db
        .index_scan(
            "users",
            "users_age",
            KeyRange::eq(vec![Value::Integer(3)]),
            ScanDirection::Ascending,
        )
        .unwrap();
    assert_eq!(threes.len(), 30);
    assert!(threes.iter().all(|(_, row)| row.values[2] == Value::Integer(3)));

    let top = db
        .index_scan(
            "users",
            "users_pk",
            KeyRange::new(Bound::Included(vec![Value::Integer(115)]), Bound::Unbounded),
            ScanDirection::Descending,
        )
        .unwrap();
    let ids: Vec<_> = top.iter().map(|(_, row)| row.values[0].clone()).collect();
    assert_eq!(
        ids,
        (115..120).rev().map(Value::Integer).collect::<Vec<_>>()
    );

    let (_, row) = db
        .find("users", "users_pk", &[Value::Integer(42)])
        .unwrap()
        .unwrap();
    assert_eq!(row.values[1], Value::Text("user042".to_string()));
    assert!(db
        .find("users", "users_pk", &[Value::Integer(1000)])
        .unwrap()
        .is_none());

    assert!(matches!(
        db.create_index("users", "users_age", &["name"], false),
        Err(DatabaseError::ConstraintViolation { .. })
    ));
    assert!(matches!(
        db.create_index("users", "users_x", &["nope"], false),
        Err(DatabaseError::ColumnNotFound { .. })
    ));
    assert!(matches!(
        db.index("users", "nope"),
        Err(DatabaseError::IndexNotFound { .. })
    ));
}

#[test]
fn test_unique_index_over_existing_duplicates_fails() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();
    db.insert("users", user(1, "same", None)).unwrap();
    db.insert("users", user(2, "same", None)).unwrap();

    assert!(matches!(
        db.create_index("users", "users_name", &["name"], true),
        Err(DatabaseError::DuplicateKey { .. })
    ));
    assert!(db.table("users").unwrap().get_index("users_name").is_none());
}

#[test]
fn test_delete_removes_index_entries() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();
    let refs: Vec<_> = (0..10)
        .map(|id| db.insert("users", user(id, "x", None)).unwrap())
        .collect();

    db.delete("users", refs[4]).unwrap();
    assert!(db
        .find("users", "users_pk", &[Value::Integer(4)])
        .unwrap()
        .is_none());
    assert_eq!(db.scan_table("users").unwrap().len(), 9);
    assert!(db.get("users", refs[4]).is_err());

    // The key is free again.
    db.insert("users", user(4, "back", None)).unwrap();
}

#[test]
fn test_explicit_transaction_rollback() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();
    db.insert("users", user(1, "kept", None)).unwrap();

    let txn = db.begin();
    db.insert_in(txn, "users", user(2, "dropped", None)).unwrap();
    db.create_table_in(
        txn,
        TableSchemaBuilder::new("scratch")
            .column(ColumnSchema::new("v", DataType::Integer))
            .build()
            .unwrap(),
    )
    .unwrap();
    assert!(db.table("scratch").is_ok());
    db.rollback(txn).unwrap();

    assert!(db.table("scratch").is_err());
    let rows = db.scan_table("users").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.values[1], Value::Text("kept".to_string()));
    assert!(db
        .find("users", "users_pk", &[Value::Integer(2)])
        .unwrap()
        .is_none());
}

#[test]
fn test_failed_operation_aborts_its_transaction() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(users_table()).unwrap();

    let txn = db.begin();
    db.insert_in(txn, "users", user(1, "first", None)).unwrap();
    assert!(db.insert_in(txn, "users", user(1, "clash", None)).is_err());
    assert!(!db.page_store().is_active(txn));
    assert!(db.commit(txn).is_err());
    assert!(db.scan_table("users").unwrap().is_empty());
}

#[test]
fn test_reopen_after_close_and_crash() {
    let mut temp = TempDatabase::with_prefix("reopen").unwrap();
    {
        let db = temp.open(DatabaseConfig::default()).unwrap();
        assert_eq!(db.name(), "reopen");
        db.create_table(users_table()).unwrap();
        db.insert("users", user(1, "closed", None)).unwrap();
    }
    temp.close().unwrap();

    {
        let db = temp.open(DatabaseConfig::default()).unwrap();
        assert_eq!(db.scan_table("users").unwrap().len(), 1);
        db.insert("users", user(2, "crashed", None)).unwrap();
        let txn = db.begin();
        db.insert_in(txn, "users", user(3, "uncommitted", None))
            .unwrap();
    }
    temp.crash();

    let db = temp.open(DatabaseConfig::default()).unwrap();
    let names: Vec<_> = db
        .scan_table("users")
        .unwrap()
        .into_iter()
        .map(|(_, row)| row.values[1].clone())
        .collect();
    assert_eq!(
        names,
        vec![
            Value::Text("closed".to_string()),
            Value::Text("crashed".to_string())
        ]
    );
    assert!(db
        .find("users", "users_pk", &[Value::Integer(3)])
        .unwrap()
        .is_none());
    db.insert("users", user(3, "after", None)).unwrap();
}

fn labels_table(name: &str) -> lumbung::storage::schema::TableSchema {
    TableSchemaBuilder::new(name)
        .column(ColumnSchema::new("id", DataType::Integer).primary_key())
        .column(ColumnSchema::new("label", DataType::Text))
        .build()
        .unwrap()
}

fn label(id: i64) -> Vec<Value> {
    vec![Value::Integer(id), Value::Text(format!("label {}", id))]
}

#[test]
fn test_transactions_on_different_tables_do_not_conflict() {
    let mut temp = TempDatabase::new().unwrap();
    let db = temp.open(DatabaseConfig::default()).unwrap();
    db.create_table(labels_table("a")).unwrap();
    db.create_table(labels_table("b")).unwrap();

    let t1 = db.begin();
    let t2 = db.begin();
    for id in 0..20 {
        db.insert_in(t1, "a", label(id)).unwrap();
        db.insert_in(t2, "b", label(id)).unwrap();
    }
    db.commit(t2).unwrap();
    db.commit(t1).unwrap();

    let t3 = db.begin();
    let t4 = db.begin();
    db.insert_in(t3, "a", label(100)).unwrap();
    db.insert_in(t4, "b", label(100)).unwrap();
    db.rollback(t3).unwrap();
    db.commit(t4).unwrap();

    assert_eq!(db.scan_table("a").unwrap().len(), 20);
    assert_eq!(db.scan_table("b").unwrap().len(), 21);
    assert!(db.find("a", "a_pk", &[Value::Integer(100)]).unwrap().is_none());
    assert!(db.find("b", "b_pk", &[Value::Integer(100)]).unwrap().is_some());

    let mut row_ids: Vec<_> = ["a", "b"]
        .iter()
        .flat_map(|table| db.scan_table(table).unwrap())
        .map(|(_, row)| row.row_id)
        .collect();
    row_ids.sort_unstable();
    row_ids.dedup();
    assert_eq!(row_ids.len(), 41);

    // Writes to the same table still conflict on its pages.
    let t5 = db.begin();
    let t6 = db.begin();
    db.insert_in(t5, "a", label(200)).unwrap();
    assert!(matches!(
        db.insert_in(t6, "a", label(201)),
        Err(DatabaseError::PageLocked { .. })
    ));
    assert!(!db.page_store().is_active(t6));
    db.commit(t5).unwrap();
}

#[test]
fn test_threaded_inserts_across_tables() {
    const TABLES: usize = 4;
    const BATCHES: i64 = 10;
    const BATCH_ROWS: i64 = 10;

    let mut temp = TempDatabase::new().unwrap();
    let committed: Mutex<Vec<(String, RowRef, i64)>> = Mutex::new(Vec::new());
    {
        let db = temp.open(DatabaseConfig::default()).unwrap();
        for table in 0..TABLES {
            db.create_table(labels_table(&format!("t{}", table))).unwrap();
        }
        let writers_done = AtomicBool::new(false);

        thread::scope(|scope| {
            let writers: Vec<_> = (0..TABLES)
                .map(|table| {
                    let committed = &committed;
                    scope.spawn(move || {
                        let name = format!("t{}", table);
                        for batch in 0..BATCHES {
                            let txn = db.begin();
                            let mut refs = Vec::new();
                            for offset in 0..BATCH_ROWS {
                                let id = batch * BATCH_ROWS + offset;
                                refs.push((db.insert_in(txn, &name, label(id)).unwrap(), id));
                            }
                            db.commit(txn).unwrap();
                            let mut committed = committed.lock();
                            for (row_ref, id) in refs {
                                committed.push((name.clone(), row_ref, id));
                            }
                        }
                    })
                })
                .collect();

            let reader = {
                let committed = &committed;
                let writers_done = &writers_done;
                scope.spawn(move || {
                    while !writers_done.load(Ordering::Acquire) {
                        let sample = {
                            let committed = committed.lock();
                            (!committed.is_empty())
                                .then(|| committed[fastrand::usize(..committed.len())].clone())
                        };
                        if let Some((table, row_ref, id)) = sample {
                            assert_eq!(db.get(&table, row_ref).unwrap().values, label(id));
                        }
                        thread::yield_now();
                    }
                })
            };

            let checkpointer = {
                let writers_done = &writers_done;
                scope.spawn(move || {
                    while !writers_done.load(Ordering::Acquire) {
                        match db.checkpoint() {
                            Ok(()) | Err(DatabaseError::TransactionsActive { .. }) => {}
                            Err(err) => panic!("checkpoint failed: {:?}", err),
                        }
                        thread::yield_now();
                    }
                })
            };

            for writer in writers {
                writer.join().unwrap();
            }
            writers_done.store(true, Ordering::Release);
            reader.join().unwrap();
            checkpointer.join().unwrap();
        });
    }

    let db = temp.open(DatabaseConfig::default()).unwrap();
    let committed = committed.into_inner();
    assert_eq!(committed.len(), TABLES * (BATCHES * BATCH_ROWS) as usize);
    for table in 0..TABLES {
        let name = format!("t{}", table);
        let mut ids: Vec<i64> = db
            .scan_table(&name)
            .unwrap()
            .into_iter()
            .map(|(_, row)| match row.values[0] {
                Value::Integer(id) => id,
                ref other => panic!("unexpected id {:?}", other),
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..BATCHES * BATCH_ROWS).collect::<Vec<_>>());
    }
    for (table, row_ref, id) in &committed {
        assert_eq!(db.get(table, *row_ref).unwrap().values, label(*id));
    }
}
