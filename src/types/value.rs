use std::{cmp::Ordering, fmt};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::types::{LobId, PageId, error::DatabaseError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Real,
    Boolean,
    Text,
    Clob,
    Blob,
    Timestamp,
}

impl DataType {
    pub fn from_string(type_name: &str) -> Result<Self, DatabaseError> {
        let upper = type_name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" => Ok(DataType::Integer),
            "REAL" | "DOUBLE" | "FLOAT" | "DECIMAL" | "NUMERIC" | "DOUBLE PRECISION" => {
                Ok(DataType::Real)
            }
            "BOOL" | "BOOLEAN" => Ok(DataType::Boolean),
            "TEXT" | "VARCHAR" | "CHAR" | "CHARACTER" | "STRING" => Ok(DataType::Text),
            "CLOB" => Ok(DataType::Clob),
            "BLOB" | "BINARY" | "VARBINARY" | "BYTEA" => Ok(DataType::Blob),
            "TIMESTAMP" | "DATETIME" => Ok(DataType::Timestamp),
            _ => Err(DatabaseError::TypeMismatch {
                expected: "a supported column type".to_string(),
                actual: type_name.to_string(),
            }),
        }
    }

    pub fn is_lob(&self) -> bool {
        matches!(self, DataType::Clob | DataType::Blob)
    }

    pub fn lob_kind(&self) -> Option<LobKind> {
        match self {
            DataType::Clob => Some(LobKind::Clob),
            DataType::Blob => Some(LobKind::Blob),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Boolean => "BOOLEAN",
            DataType::Text => "VARCHAR",
            DataType::Clob => "CLOB",
            DataType::Blob => "BLOB",
            DataType::Timestamp => "TIMESTAMP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LobKind {
    Clob,
    Blob,
}

impl LobKind {
    fn as_u8(&self) -> u8 {
        match self {
            LobKind::Clob => 0,
            LobKind::Blob => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DatabaseError> {
        match value {
            0 => Ok(LobKind::Clob),
            1 => Ok(LobKind::Blob),
            _ => Err(DatabaseError::SerializationError {
                details: format!("Unknown LOB kind: {}", value),
            }),
        }
    }
}

/// Reference planted in a row in place of a value that lives in the LOB store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LobRef {
    pub lob_id: LobId,
    pub first_page: PageId,
    /// Length in bytes of the stored stream.
    pub length: u64,
    pub kind: LobKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(i64),
    Lob(LobRef),
}

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;
const TAG_BOOLEAN: u8 = 5;
const TAG_TIMESTAMP: u8 = 6;
const TAG_LOB: u8 = 7;

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(DataType::Integer),
            Value::Real(_) => Some(DataType::Real),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Text(_) => Some(DataType::Text),
            Value::Blob(_) => Some(DataType::Blob),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Lob(lob) => Some(match lob.kind {
                LobKind::Clob => DataType::Clob,
                LobKind::Blob => DataType::Blob,
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_compatible_with_type(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Value::Null, _) => true,
            (Value::Integer(_), DataType::Integer) => true,
            (Value::Integer(_) | Value::Real(_), DataType::Real) => true,
            (Value::Boolean(_), DataType::Boolean) => true,
            (Value::Text(_), DataType::Text | DataType::Clob) => true,
            (Value::Blob(_), DataType::Blob) => true,
            (Value::Timestamp(_), DataType::Timestamp) => true,
            (Value::Lob(lob), DataType::Clob) => lob.kind == LobKind::Clob,
            (Value::Lob(lob), DataType::Blob) => lob.kind == LobKind::Blob,
            _ => false,
        }
    }

    /// Convert a literal into the representation a column of `data_type` stores.
    pub fn coerce_to(self, data_type: &DataType) -> Result<Value, DatabaseError> {
        let mismatch = |value: &Value| DatabaseError::TypeMismatch {
            expected: data_type.to_string(),
            actual: format!("{:?}", value),
        };
        match (self, data_type) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Integer(i), DataType::Real) => Ok(Value::Real(i as f64)),
            (Value::Integer(i), DataType::Boolean) => Ok(Value::Boolean(i != 0)),
            (Value::Integer(i), DataType::Timestamp) => Ok(Value::Timestamp(i)),
            (Value::Text(s), DataType::Timestamp) => Ok(Value::Timestamp(parse_timestamp(&s)?)),
            (Value::Text(s), DataType::Real) => {
                let parsed = s.trim().parse::<f64>();
                match parsed {
                    Ok(r) => Ok(Value::Real(r)),
                    Err(_) => Err(mismatch(&Value::Text(s))),
                }
            }
            (Value::Text(s), DataType::Blob) => Ok(Value::Blob(s.into_bytes())),
            (value, data_type) if value.is_compatible_with_type(data_type) => Ok(value),
            (value, _) => Err(mismatch(&value)),
        }
    }

    /// Total order used by index keys: NULL < BOOLEAN < numbers < TIMESTAMP < text < binary < LOB refs.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).total_cmp(b),
            (Value::Real(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Lob(a), Value::Lob(b)) => a.lob_id.cmp(&b.lob_id),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Real(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
            Value::Blob(_) => 5,
            Value::Lob(_) => 6,
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Integer(_) | Value::Real(_) | Value::Timestamp(_) => 1 + 8,
            Value::Boolean(_) => 1 + 1,
            Value::Text(s) => 1 + 4 + s.len(),
            Value::Blob(b) => 1 + 4 + b.len(),
            Value::Lob(_) => 1 + 8 + 8 + 8 + 1,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut buffer);
        buffer
    }

    pub fn write_to(&self, buffer: &mut Vec<u8>) {
        match self {
            Value::Null => buffer.push(TAG_NULL),
            Value::Integer(i) => {
                buffer.push(TAG_INTEGER);
                buffer.extend_from_slice(&i.to_le_bytes());
            }
            Value::Real(r) => {
                buffer.push(TAG_REAL);
                buffer.extend_from_slice(&r.to_le_bytes());
            }
            Value::Text(s) => {
                buffer.push(TAG_TEXT);
                buffer.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buffer.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buffer.push(TAG_BLOB);
                buffer.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buffer.extend_from_slice(b);
            }
            Value::Boolean(b) => {
                buffer.push(TAG_BOOLEAN);
                buffer.push(*b as u8);
            }
            Value::Timestamp(t) => {
                buffer.push(TAG_TIMESTAMP);
                buffer.extend_from_slice(&t.to_le_bytes());
            }
            Value::Lob(lob) => {
                buffer.push(TAG_LOB);
                buffer.extend_from_slice(&lob.lob_id.to_le_bytes());
                buffer.extend_from_slice(&lob.first_page.to_le_bytes());
                buffer.extend_from_slice(&lob.length.to_le_bytes());
                buffer.push(lob.kind.as_u8());
            }
        }
    }

    /// Decode one value from the front of `bytes`, returning it with the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Value, usize), DatabaseError> {
        let Some(&tag) = bytes.first() else {
            return Err(DatabaseError::SerializationError {
                details: "Empty value bytes".to_string(),
            });
        };
        let body = &bytes[1..];
        let (value, body_len) = match tag {
            TAG_NULL => (Value::Null, 0),
            TAG_INTEGER => (Value::Integer(i64::from_le_bytes(take_array(body, "integer")?)), 8),
            TAG_REAL => (Value::Real(f64::from_le_bytes(take_array(body, "real")?)), 8),
            TAG_TIMESTAMP => (
                Value::Timestamp(i64::from_le_bytes(take_array(body, "timestamp")?)),
                8,
            ),
            TAG_BOOLEAN => {
                let [b] = take_array::<1>(body, "boolean")?;
                (Value::Boolean(b != 0), 1)
            }
            TAG_TEXT | TAG_BLOB => {
                let length = u32::from_le_bytes(take_array(body, "length")?) as usize;
                if body.len() < 4 + length {
                    return Err(DatabaseError::SerializationError {
                        details: format!(
                            "Insufficient bytes for value type {}: expected {}, got {}",
                            tag,
                            4 + length,
                            body.len()
                        ),
                    });
                }
                let data = &body[4..4 + length];
                let value = if tag == TAG_TEXT {
                    Value::Text(String::from_utf8(data.to_vec()).map_err(|_| {
                        DatabaseError::SerializationError {
                            details: "Invalid UTF-8 in text value".to_string(),
                        }
                    })?)
                } else {
                    Value::Blob(data.to_vec())
                };
                (value, 4 + length)
            }
            TAG_LOB => {
                if body.len() < 25 {
                    return Err(DatabaseError::SerializationError {
                        details: "Incomplete LOB reference".to_string(),
                    });
                }
                let lob = LobRef {
                    lob_id: u64::from_le_bytes(take_array(&body[0..], "lob id")?),
                    first_page: u64::from_le_bytes(take_array(&body[8..], "lob page")?),
                    length: u64::from_le_bytes(take_array(&body[16..], "lob length")?),
                    kind: LobKind::from_u8(body[24])?,
                };
                (Value::Lob(lob), 25)
            }
            _ => {
                return Err(DatabaseError::SerializationError {
                    details: format!("Unknown type discriminant: {}", tag),
                });
            }
        };
        Ok((value, 1 + body_len))
    }

    /// Render as a SQL literal for the recovery script.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(r) if r.is_finite() => format!("{:?}", r),
            Value::Real(r) => quote_text(&r.to_string()),
            Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Text(s) => quote_text(s),
            Value::Blob(b) => format!("X'{}'", hex_encode(b)),
            Value::Timestamp(t) => quote_text(&format_timestamp(*t)),
            // LOB references are inlined by the script writer; this is the fallback.
            Value::Lob(_) => "NULL".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "X'{}'", hex_encode(b)),
            Value::Timestamp(t) => write!(f, "{}", format_timestamp(*t)),
            Value::Lob(lob) => write!(f, "<lob {} ({} bytes)>", lob.lob_id, lob.length),
        }
    }
}

fn take_array<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], DatabaseError> {
    bytes
        .get(..N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| DatabaseError::SerializationError {
            details: format!("Incomplete {}", what),
        })
}

pub fn quote_text(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for ch in text.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn hex_decode(text: &str) -> Result<Vec<u8>, DatabaseError> {
    if text.len() % 2 != 0 {
        return Err(DatabaseError::SerializationError {
            details: "Hex literal has an odd number of digits".to_string(),
        });
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| {
                DatabaseError::SerializationError {
                    details: format!("Invalid hex digits: {}", &text[i..i + 2]),
                }
            })
        })
        .collect()
}

pub fn format_timestamp(seconds: i64) -> String {
    match DateTime::from_timestamp(seconds, 0) {
        Some(datetime) => datetime.format(TIMESTAMP_FORMAT).to_string(),
        None => seconds.to_string(),
    }
}

pub fn parse_timestamp(text: &str) -> Result<i64, DatabaseError> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<i64>() {
        return Ok(seconds);
    }
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|datetime| datetime.and_utc().timestamp())
        .map_err(|_| DatabaseError::TypeMismatch {
            expected: "TIMESTAMP".to_string(),
            actual: text.to_string(),
        })
}
