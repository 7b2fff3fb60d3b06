use lumbung::types::{
    entry::{Entry, InteriorEntry, RowRef, compare_keys},
    error::DatabaseError,
    row::Row,
    value::{LobKind, LobRef, Value},
};

fn create_user_row(id: i64, name: &str, email: &str) -> Row {
    Row::new(vec![
        Value::Integer(id),
        Value::Text(name.to_string()),
        Value::Text(email.to_string()),
    ])
}

#[test]
fn test_row_roundtrip_with_every_type() {
    let row = Row::new(vec![
        Value::Null,
        Value::Integer(-42),
        Value::Real(3.25),
        Value::Boolean(true),
        Value::Text("héllo".to_string()),
        Value::Blob(vec![0, 1, 2, 255]),
        Value::Timestamp(1_640_995_200),
        Value::Lob(LobRef {
            lob_id: 9,
            first_page: 17,
            length: 80_000,
            kind: LobKind::Clob,
        }),
    ]);
    let bytes = row.to_bytes();
    assert_eq!(bytes.len(), row.size());

    let decoded = Row::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, row);
    assert_eq!(decoded.row_id, None);
}

#[test]
fn test_row_with_row_id() {
    let row = Row::with_row_id(7, vec![Value::Integer(1)]);
    assert_eq!(row.row_id, Some(7));
    assert_eq!(row.get_value(0), Some(&Value::Integer(1)));
    assert_eq!(row.get_value(1), None);
}

#[test]
fn test_set_value_bounds() {
    let mut row = create_user_row(1, "Alice", "alice@example.com");
    row.set_value(1, Value::Text("Alicia".to_string())).unwrap();
    assert_eq!(row.get_value(1), Some(&Value::Text("Alicia".to_string())));
    assert!(matches!(
        row.set_value(3, Value::Null),
        Err(DatabaseError::ColumnIndexOutOfBounds { index: 3 })
    ));
}

#[test]
fn test_empty_row() {
    let row = Row::new(Vec::new());
    let decoded = Row::from_bytes(&row.to_bytes()).unwrap();
    assert!(decoded.values.is_empty());
}

#[test]
fn test_truncated_payload_is_rejected() {
    let bytes = create_user_row(1, "Alice", "alice@example.com").to_bytes();
    for cut in [0, 3, 5, bytes.len() - 1] {
        assert!(
            Row::from_bytes(&bytes[..cut]).is_err(),
            "cut at {} decoded",
            cut
        );
    }
}

#[test]
fn test_trailing_bytes_are_rejected() {
    let mut bytes = create_user_row(2, "Bob", "bob@example.com").to_bytes();
    bytes.push(0);
    assert!(matches!(
        Row::from_bytes(&bytes),
        Err(DatabaseError::SerializationError { .. })
    ));
}

#[test]
fn test_absurd_value_count_is_rejected() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&u32::MAX.to_le_bytes());
    bytes.push(0);
    assert!(Row::from_bytes(&bytes).is_err());
}

#[test]
fn test_entry_roundtrip_and_size() {
    let entry = Entry::new(
        vec![Value::Integer(5), Value::Text("k".to_string())],
        RowRef::new(12, 3),
    );
    let bytes = entry.to_bytes();
    assert_eq!(bytes.len(), entry.serialized_size());
    let (decoded, consumed) = Entry::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, entry);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn test_entry_order_breaks_ties_by_row() {
    let a = Entry::new(vec![Value::Integer(1)], RowRef::new(4, 9));
    let b = Entry::new(vec![Value::Integer(1)], RowRef::new(5, 0));
    let c = Entry::new(vec![Value::Integer(2)], RowRef::new(1, 0));
    assert!(a.compare(&b).is_lt());
    assert!(b.compare(&c).is_lt());
    assert!(a.compare(&a).is_eq());
}

#[test]
fn test_key_prefix_sorts_first() {
    let short = vec![Value::Integer(1)];
    let long = vec![Value::Integer(1), Value::Null];
    assert!(compare_keys(&short, &long).is_lt());
}

#[test]
fn test_interior_entry_roundtrip() {
    let bounded = InteriorEntry {
        child: 33,
        separator: Some(Entry::new(vec![Value::Integer(10)], RowRef::new(2, 1))),
    };
    let rightmost = InteriorEntry {
        child: 34,
        separator: None,
    };
    assert_eq!(InteriorEntry::from_bytes(&bounded.to_bytes()).unwrap(), bounded);
    assert_eq!(
        InteriorEntry::from_bytes(&rightmost.to_bytes()).unwrap(),
        rightmost
    );
    assert_eq!(rightmost.to_bytes().len(), rightmost.serialized_size());
}
