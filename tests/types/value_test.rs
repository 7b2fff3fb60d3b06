use std::cmp::Ordering;

use lumbung::types::{
    error::DatabaseError,
    value::{
        DataType, LobKind, LobRef, Value, format_timestamp, hex_decode, hex_encode,
        parse_timestamp, quote_text,
    },
};

#[test]
fn test_value_data_types() {
    assert_eq!(Value::Null.data_type(), None);
    assert_eq!(Value::Integer(42).data_type(), Some(DataType::Integer));
    assert_eq!(Value::Real(3.5).data_type(), Some(DataType::Real));
    assert_eq!(Value::Text("hello".into()).data_type(), Some(DataType::Text));
    assert_eq!(Value::Blob(vec![1, 2]).data_type(), Some(DataType::Blob));
    assert_eq!(Value::Boolean(true).data_type(), Some(DataType::Boolean));
    assert_eq!(Value::Timestamp(0).data_type(), Some(DataType::Timestamp));
    let lob = LobRef {
        lob_id: 1,
        first_page: 2,
        length: 3,
        kind: LobKind::Blob,
    };
    assert_eq!(Value::Lob(lob).data_type(), Some(DataType::Blob));
}

#[test]
fn test_type_names() {
    assert_eq!(DataType::from_string("int").unwrap(), DataType::Integer);
    assert_eq!(DataType::from_string("BIGINT").unwrap(), DataType::Integer);
    assert_eq!(DataType::from_string("double").unwrap(), DataType::Real);
    assert_eq!(DataType::from_string("VARCHAR(255)").unwrap(), DataType::Text);
    assert_eq!(DataType::from_string("clob").unwrap(), DataType::Clob);
    assert_eq!(DataType::from_string("BLOB").unwrap(), DataType::Blob);
    assert_eq!(DataType::from_string("timestamp").unwrap(), DataType::Timestamp);
    assert!(matches!(
        DataType::from_string("GEOMETRY"),
        Err(DatabaseError::TypeMismatch { .. })
    ));

    for data_type in [
        DataType::Integer,
        DataType::Real,
        DataType::Boolean,
        DataType::Text,
        DataType::Clob,
        DataType::Blob,
        DataType::Timestamp,
    ] {
        assert_eq!(DataType::from_string(&data_type.to_string()).unwrap(), data_type);
    }
}

#[test]
fn test_value_comparison_for_indexing() {
    assert_eq!(Value::Integer(5).compare(&Value::Integer(10)), Ordering::Less);
    assert_eq!(Value::Integer(5).compare(&Value::Real(5.5)), Ordering::Less);
    assert_eq!(Value::Real(3.5).compare(&Value::Integer(4)), Ordering::Less);
    assert_eq!(
        Value::Text("apple".into()).compare(&Value::Text("banana".into())),
        Ordering::Less
    );
    assert_eq!(Value::Null.compare(&Value::Integer(0)), Ordering::Less);
    assert_eq!(Value::Null.compare(&Value::Null), Ordering::Equal);
    assert_eq!(
        Value::Timestamp(1_640_995_200).compare(&Value::Timestamp(1_672_531_200)),
        Ordering::Less
    );
}

#[test]
fn test_compare_is_total_for_reals() {
    let nan = Value::Real(f64::NAN);
    assert_eq!(nan.compare(&nan), Ordering::Equal);
    assert_ne!(nan.compare(&Value::Real(1.0)), Ordering::Equal);
}

#[test]
fn test_coercion() {
    assert_eq!(
        Value::Integer(2).coerce_to(&DataType::Real).unwrap(),
        Value::Real(2.0)
    );
    assert_eq!(
        Value::Text("2022-01-01 00:00:00".into())
            .coerce_to(&DataType::Timestamp)
            .unwrap(),
        Value::Timestamp(1_640_995_200)
    );
    assert_eq!(
        Value::Text("abc".into()).coerce_to(&DataType::Clob).unwrap(),
        Value::Text("abc".into())
    );
    assert_eq!(Value::Null.coerce_to(&DataType::Blob).unwrap(), Value::Null);
    assert!(matches!(
        Value::Text("abc".into()).coerce_to(&DataType::Integer),
        Err(DatabaseError::TypeMismatch { .. })
    ));
}

#[test]
fn test_lob_compatibility_follows_kind() {
    let clob = Value::Lob(LobRef {
        lob_id: 1,
        first_page: 5,
        length: 10,
        kind: LobKind::Clob,
    });
    assert!(clob.is_compatible_with_type(&DataType::Clob));
    assert!(!clob.is_compatible_with_type(&DataType::Blob));
    assert!(!clob.is_compatible_with_type(&DataType::Text));
}

#[test]
fn test_sql_literals() {
    assert_eq!(Value::Null.to_sql_literal(), "NULL");
    assert_eq!(Value::Integer(-3).to_sql_literal(), "-3");
    assert_eq!(Value::Real(2.0).to_sql_literal(), "2.0");
    assert_eq!(Value::Boolean(false).to_sql_literal(), "FALSE");
    assert_eq!(Value::Text("O'Brien".into()).to_sql_literal(), "'O''Brien'");
    assert_eq!(Value::Blob(vec![0xde, 0xad]).to_sql_literal(), "X'DEAD'");
    assert_eq!(
        Value::Timestamp(1_640_995_200).to_sql_literal(),
        "'2022-01-01 00:00:00'"
    );
}

#[test]
fn test_literal_helpers() {
    assert_eq!(quote_text(""), "''");
    assert_eq!(hex_encode(&[0x00, 0x0f, 0xf0]), "000FF0");
    assert_eq!(hex_decode("000ff0").unwrap(), vec![0x00, 0x0f, 0xf0]);
    assert!(hex_decode("abc").is_err());
    assert!(hex_decode("zz").is_err());
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    assert_eq!(parse_timestamp("1970-01-01 00:01:00").unwrap(), 60);
    assert_eq!(parse_timestamp("86400").unwrap(), 86_400);
}

#[test]
fn test_decode_rejects_unknown_tag() {
    assert!(matches!(
        Value::decode(&[0x7f, 0, 0]),
        Err(DatabaseError::SerializationError { .. })
    ));
    assert!(Value::decode(&[]).is_err());
}
