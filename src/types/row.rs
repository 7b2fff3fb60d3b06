use serde::{Deserialize, Serialize};

use crate::types::{RowId, error::DatabaseError, value::Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_id: Option<RowId>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            row_id: None,
            values,
        }
    }

    pub fn with_row_id(row_id: RowId, values: Vec<Value>) -> Self {
        Self {
            row_id: Some(row_id),
            values,
        }
    }

    pub fn get_value(&self, column_index: usize) -> Option<&Value> {
        self.values.get(column_index)
    }

    pub fn set_value(&mut self, column_index: usize, value: Value) -> Result<(), DatabaseError> {
        if column_index >= self.values.len() {
            return Err(DatabaseError::ColumnIndexOutOfBounds {
                index: column_index,
            });
        }
        self.values[column_index] = value;
        Ok(())
    }

    /// Encoded size of the value payload; the row id travels in the cell header.
    pub fn size(&self) -> usize {
        4 + self.values.iter().map(Value::serialized_size).sum::<usize>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.size());
        buffer.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for value in &self.values {
            value.write_to(&mut buffer);
        }
        buffer
    }

    /// Decode a complete row payload. Trailing bytes are rejected so a
    /// truncated or spliced payload never yields a partial row.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < 4 {
            return Err(DatabaseError::SerializationError {
                details: "Incomplete value count".to_string(),
            });
        }
        let value_count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let mut cursor = 4;

        // Every value needs at least its tag byte.
        if value_count > bytes.len() - cursor {
            return Err(DatabaseError::SerializationError {
                details: format!("Value count {} exceeds payload size", value_count),
            });
        }

        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let (value, consumed) = Value::decode(&bytes[cursor..])?;
            values.push(value);
            cursor += consumed;
        }

        if cursor != bytes.len() {
            return Err(DatabaseError::SerializationError {
                details: format!("{} trailing bytes after row", bytes.len() - cursor),
            });
        }

        Ok(Row {
            row_id: None,
            values,
        })
    }
}
