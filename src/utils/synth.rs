//! Seeded generator of random schemas and rows. Everything it produces goes
//! through the public `Database` operations, and the same seed always yields
//! the same database.

use fastrand::Rng;
use tracing::debug;

use crate::{
    storage::{
        database::Database,
        schema::{ColumnSchema, TableSchema, TableSchemaBuilder},
    },
    types::{
        error::DatabaseError,
        value::{DataType, Value},
    },
};

const TYPES: [DataType; 7] = [
    DataType::Integer,
    DataType::Real,
    DataType::Boolean,
    DataType::Text,
    DataType::Clob,
    DataType::Blob,
    DataType::Timestamp,
];

const TEXT_ALPHABET: &[char] = &[
    'a', 'b', 'c', 'x', 'y', 'z', 'A', 'Q', '0', '7', ' ', '\'', '"', '-', ';', '\n', 'é', 'ß',
    '✓', '漢',
];

#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    pub seed: u64,
    pub tables: usize,
    pub max_columns: usize,
    pub rows_per_table: usize,
    /// Upper bound in characters for TEXT and CLOB values, in bytes for BLOBs.
    pub max_text_len: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tables: 3,
            max_columns: 6,
            rows_per_table: 20,
            max_text_len: 12_000,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SynthSummary {
    pub tables: Vec<String>,
    pub rows: usize,
    pub indexes: usize,
}

pub struct Synth {
    rng: Rng,
    config: SynthConfig,
}

impl Synth {
    pub fn new(config: SynthConfig) -> Self {
        Self {
            rng: Rng::with_seed(config.seed),
            config,
        }
    }

    /// A random table: an optional integer primary key followed by
    /// 1..=max_columns columns of random types.
    pub fn schema(&mut self, table_number: usize) -> Result<TableSchema, DatabaseError> {
        let mut builder = TableSchemaBuilder::new(format!("t{}", table_number));
        if self.rng.bool() {
            builder = builder.column(ColumnSchema::new("id", DataType::Integer).primary_key());
        }
        let columns = self.rng.usize(1..=self.config.max_columns.max(1));
        for column_number in 0..columns {
            let data_type = TYPES[self.rng.usize(..TYPES.len())];
            let mut column = ColumnSchema::new(format!("c{}", column_number), data_type);
            if self.rng.u8(..10) == 0 {
                column = column.not_null();
            }
            builder = builder.column(column);
        }
        builder.build()
    }

    /// Values for one row. The primary key, when present, is `row_number`.
    pub fn row(&mut self, schema: &TableSchema, row_number: usize) -> Vec<Value> {
        schema
            .columns
            .iter()
            .map(|column| {
                if column.primary_key {
                    Value::Integer(row_number as i64)
                } else if column.nullable && self.rng.u8(..10) == 0 {
                    Value::Null
                } else {
                    self.value(column.data_type)
                }
            })
            .collect()
    }

    fn value(&mut self, data_type: DataType) -> Value {
        match data_type {
            DataType::Integer => Value::Integer(self.rng.i64(..)),
            DataType::Real => Value::Real((self.rng.f64() - 0.5) * 1e9),
            DataType::Boolean => Value::Boolean(self.rng.bool()),
            DataType::Text => Value::Text(self.text(self.config.max_text_len.min(200))),
            DataType::Clob => Value::Text(self.text(self.config.max_text_len)),
            DataType::Blob => {
                let len = self.rng.usize(..=self.config.max_text_len);
                Value::Blob(std::iter::repeat_with(|| self.rng.u8(..)).take(len).collect())
            }
            DataType::Timestamp => Value::Timestamp(self.rng.i64(0..4_102_444_800)),
        }
    }

    fn text(&mut self, max_len: usize) -> String {
        let len = self.rng.usize(..=max_len);
        (0..len)
            .map(|_| TEXT_ALPHABET[self.rng.usize(..TEXT_ALPHABET.len())])
            .collect()
    }

    /// Create every table, maybe an index per table, and fill them.
    pub fn populate(&mut self, db: &Database) -> Result<SynthSummary, DatabaseError> {
        let mut summary = SynthSummary::default();
        for table_number in 0..self.config.tables {
            let schema = db.create_table(self.schema(table_number)?)?;

            // Only fixed-size columns are indexed so every key fits a node.
            let indexable: Vec<&ColumnSchema> = schema
                .columns
                .iter()
                .filter(|column| {
                    !column.primary_key
                        && matches!(
                            column.data_type,
                            DataType::Integer
                                | DataType::Real
                                | DataType::Boolean
                                | DataType::Timestamp
                        )
                })
                .collect();
            if !indexable.is_empty() && self.rng.bool() {
                let column = indexable[self.rng.usize(..indexable.len())];
                let name = format!("{}_{}_idx", schema.name, column.name);
                db.create_index(&schema.name, &name, &[column.name.as_str()], false)?;
                summary.indexes += 1;
            }

            for row_number in 0..self.config.rows_per_table {
                let values = self.row(&schema, row_number);
                db.insert(&schema.name, values)?;
                summary.rows += 1;
            }
            debug!(table = %schema.name, rows = self.config.rows_per_table, "synthetic table filled");
            summary.tables.push(schema.name.clone());
        }
        Ok(summary)
    }
}
