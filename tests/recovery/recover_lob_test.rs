use lumbung::{
    recovery::recover,
    script::ScriptRunner,
    storage::{
        config::DatabaseConfig,
        schema::{ColumnSchema, TableSchemaBuilder},
    },
    types::value::{DataType, Value},
    utils::mock::TempDatabase,
};

const ALPHABET: &[char] = &['a', 'b', '\'', '✓', 'z', '\n', 'é'];

// `chars` characters, with multi-byte ones landing on chunk boundaries.
fn clob_text(seed: usize, chars: usize) -> String {
    (0..chars)
        .map(|i| ALPHABET[(i * 7 + seed) % ALPHABET.len()])
        .collect()
}

#[test]
fn test_clob_lengths_survive_recovery() {
    let mut source = TempDatabase::with_prefix("recover_lob").unwrap();
    {
        let db = source.open(DatabaseConfig::default()).unwrap();
        db.create_table(
            TableSchemaBuilder::new("test")
                .column(ColumnSchema::new("id", DataType::Integer).primary_key())
                .column(ColumnSchema::new("data", DataType::Clob))
                .build()
                .unwrap(),
        )
        .unwrap();
        for id in 1..=8 {
            let text = clob_text(id, 10_000 * id);
            db.insert("test", vec![Value::Integer(id as i64), Value::Text(text)])
                .unwrap();
        }
    }
    source.close().unwrap();

    let report = recover(&source.recovery_config()).unwrap();
    assert!(report.is_clean(), "unexpected warnings: {:?}", report.warnings);
    assert_eq!(report.tables, vec!["test".to_string()]);
    assert_eq!(report.rows_per_table["test"], 8);
    assert_eq!(report.lobs, 8);
    assert_eq!(
        report.script_path,
        source.dir().join("recover_lob.lumbung.sql")
    );

    let mut target = TempDatabase::with_prefix("recover_lob_replay").unwrap();
    let db = target.open(DatabaseConfig::default()).unwrap();
    let stats = ScriptRunner::new(db).run_file(&report.script_path).unwrap();
    assert_eq!(stats.tables, 1);
    assert_eq!(stats.rows, 8);

    for id in 1..=8usize {
        let (_, row) = db
            .find("test", "test_pk", &[Value::Integer(id as i64)])
            .unwrap()
            .unwrap();
        let row = db.materialize(&row).unwrap();
        let Value::Text(text) = &row.values[1] else {
            panic!("row {} holds {:?}", id, row.values[1]);
        };
        assert_eq!(text.chars().count(), 10_000 * id);
        assert_eq!(text, &clob_text(id, 10_000 * id));
    }
}

#[test]
fn test_blob_and_empty_lobs() {
    let mut source = TempDatabase::with_prefix("recover_blob").unwrap();
    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0x00],
        (0..=255u8).collect(),
        (0..50_000u32).map(|i| (i % 253) as u8).collect(),
    ];
    {
        let db = source
            .open(DatabaseConfig::default().with_lob_inline_threshold(0))
            .unwrap();
        db.create_table(
            TableSchemaBuilder::new("files")
                .column(ColumnSchema::new("n", DataType::Integer))
                .column(ColumnSchema::new("content", DataType::Blob))
                .column(ColumnSchema::new("notes", DataType::Clob))
                .build()
                .unwrap(),
        )
        .unwrap();
        for (n, payload) in payloads.iter().enumerate() {
            db.insert(
                "files",
                vec![
                    Value::Integer(n as i64),
                    Value::Blob(payload.clone()),
                    Value::Text(String::new()),
                ],
            )
            .unwrap();
        }
    }
    source.close().unwrap();

    let report = recover(&source.recovery_config()).unwrap();
    assert!(report.is_clean(), "unexpected warnings: {:?}", report.warnings);
    let script = std::fs::read_to_string(&report.script_path).unwrap();
    assert!(script.contains("INSERT INTO \"files\" VALUES(1, X'00', '');"));

    let mut target = TempDatabase::with_prefix("recover_blob_replay").unwrap();
    let db = target.open(DatabaseConfig::default()).unwrap();
    ScriptRunner::new(db).run_file(&report.script_path).unwrap();
    let rows = db.scan_table("files").unwrap();
    assert_eq!(rows.len(), payloads.len());
    for ((_, row), payload) in rows.iter().zip(&payloads) {
        let row = db.materialize(row).unwrap();
        assert_eq!(row.values[1], Value::Blob(payload.clone()));
        assert_eq!(row.values[2], Value::Text(String::new()));
    }
}

#[test]
fn test_clob_lengths_survive_recovery_without_a_key() {
    let mut source = TempDatabase::with_prefix("recover_lob_heap").unwrap();
    {
        let db = source.open(DatabaseConfig::default()).unwrap();
        db.create_table(
            TableSchemaBuilder::new("test")
                .column(ColumnSchema::new("id", DataType::Integer))
                .column(ColumnSchema::new("data", DataType::Clob))
                .build()
                .unwrap(),
        )
        .unwrap();
        for id in 1..=8 {
            let text = clob_text(id, 10_000 * id);
            db.insert("test", vec![Value::Integer(id as i64), Value::Text(text)])
                .unwrap();
        }
    }
    source.close().unwrap();

    let report = recover(&source.recovery_config()).unwrap();
    assert!(report.is_clean(), "unexpected warnings: {:?}", report.warnings);
    assert_eq!(report.rows_per_table["test"], 8);
    assert_eq!(report.lobs, 8);

    let mut target = TempDatabase::with_prefix("recover_lob_heap_replay").unwrap();
    let db = target.open(DatabaseConfig::default()).unwrap();
    let stats = ScriptRunner::new(db).run_file(&report.script_path).unwrap();
    assert_eq!(stats.rows, 8);
    assert!(db.table("test").unwrap().indexes.is_empty());

    let mut lengths: Vec<(i64, usize)> = db
        .scan_table("test")
        .unwrap()
        .iter()
        .map(|(_, row)| {
            let row = db.materialize(row).unwrap();
            match (&row.values[0], &row.values[1]) {
                (Value::Integer(id), Value::Text(text)) => {
                    assert_eq!(text, &clob_text(*id as usize, 10_000 * *id as usize));
                    (*id, text.chars().count())
                }
                other => panic!("unexpected row {:?}", other),
            }
        })
        .collect();
    lengths.sort_unstable();
    assert_eq!(
        lengths,
        (1..=8).map(|id| (id, 10_000 * id as usize)).collect::<Vec<_>>()
    );
}
