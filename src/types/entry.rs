use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::{
    PageId,
    error::DatabaseError,
    page::{read_u16, read_u64},
    value::Value,
};

/// Location of a row: its data page and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowRef {
    pub page_id: PageId,
    pub slot: u16,
}

impl RowRef {
    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

pub fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (left, right) in a.iter().zip(b) {
        match left.compare(right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// A leaf entry: index key plus the row it points at. The row reference
/// breaks ties between equal keys so every entry is unique.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Vec<Value>,
    pub row_ref: RowRef,
}

impl Entry {
    pub fn new(key: Vec<Value>, row_ref: RowRef) -> Self {
        Self { key, row_ref }
    }

    pub fn compare(&self, other: &Entry) -> Ordering {
        compare_keys(&self.key, &other.key).then(self.row_ref.cmp(&other.row_ref))
    }

    pub fn serialized_size(&self) -> usize {
        2 + self.key.iter().map(Value::serialized_size).sum::<usize>() + 8 + 2
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        for value in &self.key {
            value.write_to(bytes);
        }
        bytes.extend_from_slice(&self.row_ref.page_id.to_le_bytes());
        bytes.extend_from_slice(&self.row_ref.slot.to_le_bytes());
    }

    /// Deserialize entry from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), DatabaseError> {
        if bytes.len() < 2 {
            return Err(DatabaseError::SerializationError {
                details: "Empty bytes for Entry".to_string(),
            });
        }
        let key_len = read_u16(bytes, 0) as usize;
        let mut offset = 2;
        let mut key = Vec::with_capacity(key_len);
        for _ in 0..key_len {
            let (value, consumed) = Value::decode(&bytes[offset..])?;
            key.push(value);
            offset += consumed;
        }
        if bytes.len() < offset + 10 {
            return Err(DatabaseError::SerializationError {
                details: "Insufficient bytes for row reference".to_string(),
            });
        }
        let row_ref = RowRef::new(read_u64(bytes, offset), read_u16(bytes, offset + 8));
        offset += 10;
        Ok((Self::new(key, row_ref), offset))
    }
}

/// Interior node cell: a child pointer with the separator that bounds it from
/// above. The rightmost child carries no separator.
#[derive(Debug, Clone, PartialEq)]
pub struct InteriorEntry {
    pub child: PageId,
    pub separator: Option<Entry>,
}

impl InteriorEntry {
    pub fn serialized_size(&self) -> usize {
        8 + 1 + self.separator.as_ref().map_or(0, Entry::serialized_size)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        bytes.extend_from_slice(&self.child.to_le_bytes());
        match &self.separator {
            Some(entry) => {
                bytes.push(1);
                entry.write_to(&mut bytes);
            }
            None => bytes.push(0),
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < 9 {
            return Err(DatabaseError::SerializationError {
                details: "Interior entry too short".to_string(),
            });
        }
        let child = read_u64(bytes, 0);
        let separator = match bytes[8] {
            0 => None,
            _ => Some(Entry::from_bytes(&bytes[9..])?.0),
        };
        Ok(Self { child, separator })
    }
}
