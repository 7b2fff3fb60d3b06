//! Rendering of the recovery script. Output depends only on its inputs, so
//! the same recovered state always yields the same bytes.

use std::io::Write;

use crate::{
    recovery::report::RecoveryWarning,
    storage::schema::{IndexSchema, TableSchema},
    types::{
        error::DatabaseError,
        value::{LobKind, Value, hex_encode},
    },
};

/// Double-quoted SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Decodes UTF-8 arriving in arbitrary slices, holding back a sequence that
/// is split across two slices.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid = start + err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Whatever is still held back, replaced by U+FFFD if incomplete.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

pub struct ScriptWriter<W: Write> {
    out: W,
    values_written: usize,
}

impl<W: Write> ScriptWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            values_written: 0,
        }
    }

    pub fn header(&mut self, name: &str, page_size: usize, pages: u64) -> Result<(), DatabaseError> {
        writeln!(self.out, "-- lumbung recovery script")?;
        writeln!(self.out, "-- database: {}", name)?;
        writeln!(self.out, "-- page size: {}, pages: {}", page_size, pages)?;
        Ok(())
    }

    pub fn create_table(&mut self, schema: &TableSchema) -> Result<(), DatabaseError> {
        let key_columns = schema.primary_key_columns();
        let mut definitions = Vec::with_capacity(schema.columns.len() + 1);
        for column in &schema.columns {
            let mut definition = format!("{} {}", quote_ident(&column.name), column.data_type);
            if key_columns.len() == 1 && column.primary_key {
                definition.push_str(" PRIMARY KEY");
            } else if !column.nullable {
                definition.push_str(" NOT NULL");
            }
            if let Some(default_value) = &column.default_value {
                definition.push_str(" DEFAULT ");
                definition.push_str(&default_value.to_sql_literal());
            }
            definitions.push(definition);
        }
        if key_columns.len() > 1 {
            let names: Vec<String> = key_columns
                .iter()
                .filter_map(|&position| schema.columns.get(position))
                .map(|column| quote_ident(&column.name))
                .collect();
            definitions.push(format!("PRIMARY KEY({})", names.join(", ")));
        }
        writeln!(
            self.out,
            "CREATE TABLE {}({});",
            quote_ident(&schema.name),
            definitions.join(", ")
        )?;
        Ok(())
    }

    /// Primary key indexes come back with the table and are not written.
    pub fn create_index(
        &mut self,
        schema: &TableSchema,
        index: &IndexSchema,
    ) -> Result<(), DatabaseError> {
        if index.primary {
            return Ok(());
        }
        let columns: Vec<String> = index
            .columns
            .iter()
            .filter_map(|&position| schema.columns.get(position))
            .map(|column| quote_ident(&column.name))
            .collect();
        writeln!(
            self.out,
            "CREATE {}INDEX {} ON {}({});",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            quote_ident(&schema.name),
            columns.join(", ")
        )?;
        Ok(())
    }

    pub fn begin_insert(&mut self, table: &str) -> Result<(), DatabaseError> {
        self.values_written = 0;
        write!(self.out, "INSERT INTO {} VALUES(", quote_ident(table))?;
        Ok(())
    }

    fn separator(&mut self) -> Result<(), DatabaseError> {
        if self.values_written > 0 {
            self.out.write_all(b", ")?;
        }
        self.values_written += 1;
        Ok(())
    }

    pub fn value(&mut self, value: &Value) -> Result<(), DatabaseError> {
        self.separator()?;
        self.out.write_all(value.to_sql_literal().as_bytes())?;
        Ok(())
    }

    /// Write a LOB literal from its chunks without holding the whole value.
    /// Returns the number of bytes taken from `chunks`.
    pub fn lob<I>(&mut self, kind: LobKind, chunks: I) -> Result<u64, DatabaseError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.separator()?;
        let mut written = 0u64;
        match kind {
            LobKind::Clob => {
                self.out.write_all(b"'")?;
                let mut carry = Utf8Carry::default();
                for chunk in chunks {
                    written += chunk.len() as u64;
                    let text = carry.push(&chunk);
                    self.out.write_all(text.replace('\'', "''").as_bytes())?;
                }
                let tail = carry.finish();
                self.out.write_all(tail.replace('\'', "''").as_bytes())?;
                self.out.write_all(b"'")?;
            }
            LobKind::Blob => {
                self.out.write_all(b"X'")?;
                for chunk in chunks {
                    written += chunk.len() as u64;
                    self.out.write_all(hex_encode(&chunk).as_bytes())?;
                }
                self.out.write_all(b"'")?;
            }
        }
        Ok(written)
    }

    pub fn end_insert(&mut self) -> Result<(), DatabaseError> {
        self.out.write_all(b");\n")?;
        Ok(())
    }

    pub fn warnings(&mut self, warnings: &[RecoveryWarning]) -> Result<(), DatabaseError> {
        if warnings.is_empty() {
            return Ok(());
        }
        writeln!(self.out, "-- {} warning(s):", warnings.len())?;
        for warning in warnings {
            let line = warning.to_string().replace(['\r', '\n'], " ");
            writeln!(self.out, "-- {}", line)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, DatabaseError> {
        self.out.flush()?;
        Ok(self.out)
    }
}
