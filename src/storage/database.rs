//! The resolved-operation surface of the engine: tables, rows, indexes and
//! LOBs over one page file.
//!
//! Every `*_in` operation runs inside a caller-supplied transaction and rolls
//! that transaction back if it fails. The plain variants wrap a single
//! operation in its own transaction.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    storage::{
        btree::{BTreeIndex, KeyRange, ScanDirection},
        config::{DATA_FILE_SUFFIX, DatabaseConfig, data_file_path},
        heap::TableHeap,
        lob::{LobReader, LobStore},
        page_store::PageStore,
        schema::{Catalog, IndexSchema, TableSchema},
    },
    types::{
        TransactionId,
        entry::RowRef,
        error::DatabaseError,
        row::Row,
        value::{DataType, LobKind, LobRef, Value},
    },
};

pub struct Database {
    name: String,
    pages: Arc<PageStore>,
    heap: TableHeap,
    lobs: LobStore,
    catalog: RwLock<Catalog>,
}

impl Database {
    /// Open `<dir>/<name>.lumbung.db`, creating it if needed.
    pub fn open(dir: &Path, name: &str, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        Self::open_path(data_file_path(dir, name), config)
    }

    pub fn open_path<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = file_name
            .strip_suffix(&format!(".{}", DATA_FILE_SUFFIX))
            .unwrap_or(&file_name)
            .to_string();

        let pages = Arc::new(PageStore::open(path, config)?);
        let catalog = Catalog::load(&pages)?;
        info!(database = %name, tables = catalog.tables().len(), "database ready");
        Ok(Self {
            name,
            heap: TableHeap::new(Arc::clone(&pages)),
            lobs: LobStore::new(Arc::clone(&pages)),
            pages,
            catalog: RwLock::new(catalog),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        self.pages.path().to_path_buf()
    }

    pub fn page_store(&self) -> &PageStore {
        &self.pages
    }

    pub fn config(&self) -> &DatabaseConfig {
        self.pages.config()
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableSchema>, DatabaseError> {
        self.catalog
            .read()
            .get(name)
            .ok_or_else(|| DatabaseError::TableNotFound {
                name: name.to_string(),
            })
    }

    /// Tables in creation order.
    pub fn tables(&self) -> Vec<Arc<TableSchema>> {
        self.catalog.read().tables()
    }

    pub fn begin(&self) -> TransactionId {
        self.pages.begin()
    }

    pub fn commit(&self, txn: TransactionId) -> Result<(), DatabaseError> {
        self.pages.commit(txn)
    }

    /// Undo `txn` and drop any catalog changes it made.
    pub fn rollback(&self, txn: TransactionId) -> Result<(), DatabaseError> {
        self.pages.rollback(txn)?;
        *self.catalog.write() = Catalog::load(&self.pages)?;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<(), DatabaseError> {
        self.pages.checkpoint()
    }

    /// Checkpoint and close. Dropping without closing leaves recovery to the
    /// next open.
    pub fn close(self) -> Result<(), DatabaseError> {
        info!(database = %self.name, "closing database");
        let Database { heap, lobs, pages, .. } = self;
        drop(heap);
        drop(lobs);
        match Arc::try_unwrap(pages) {
            Ok(pages) => pages.close(),
            Err(pages) => pages.checkpoint(),
        }
    }

    fn within<T>(
        &self,
        txn: TransactionId,
        operation: impl FnOnce() -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        match operation() {
            Ok(value) => Ok(value),
            Err(err) => {
                // Nested operations share the transaction; only the innermost rolls back.
                if self.pages.is_active(txn) {
                    warn!(txn, error = %err, "operation failed, rolling back");
                    if let Err(rollback_err) = self.rollback(txn) {
                        warn!(txn, error = %rollback_err, "rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn autocommit<T>(
        &self,
        operation: impl FnOnce(TransactionId) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let txn = self.begin();
        let value = self.within(txn, || operation(txn))?;
        self.commit(txn)?;
        Ok(value)
    }

    fn next_object_id(&self, txn: TransactionId) -> Result<u64, DatabaseError> {
        self.pages.update_header(txn, |header| {
            let id = header.next_table_id;
            header.next_table_id += 1;
            id
        })
    }

    fn open_index(&self, index: &IndexSchema) -> BTreeIndex {
        BTreeIndex::open(
            Arc::clone(&self.pages),
            index.name.clone(),
            index.index_id,
            index.root_page,
            index.unique,
        )
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>, DatabaseError> {
        self.autocommit(|txn| self.create_table_in(txn, schema))
    }

    /// Register a table built with `TableSchemaBuilder`. A primary key gets
    /// a unique index named `<table>_pk`.
    pub fn create_table_in(
        &self,
        txn: TransactionId,
        schema: TableSchema,
    ) -> Result<Arc<TableSchema>, DatabaseError> {
        self.within(txn, || {
            let mut catalog = self.catalog.write();
            if catalog.contains(&schema.name) {
                return Err(DatabaseError::TableExists { name: schema.name });
            }
            let table_id = self.next_object_id(txn)?;
            let first_page = self.heap.create(txn, table_id)?;
            let mut schema = schema.with_storage(table_id, first_page);

            let key_columns = schema.primary_key_columns();
            if !key_columns.is_empty() {
                let index_id = self.next_object_id(txn)?;
                let root_page = BTreeIndex::create(&self.pages, txn, index_id)?;
                schema = schema.with_index(IndexSchema {
                    name: format!("{}_pk", schema.name),
                    index_id,
                    columns: key_columns,
                    unique: true,
                    primary: true,
                    root_page,
                });
            }
            info!(table = %schema.name, table_id, "table created");
            catalog.persist(&self.pages, txn, schema)
        })
    }

    pub fn create_index(
        &self,
        table: &str,
        name: &str,
        columns: &[&str],
        unique: bool,
    ) -> Result<Arc<TableSchema>, DatabaseError> {
        self.autocommit(|txn| self.create_index_in(txn, table, name, columns, unique))
    }

    /// Build an index over existing rows and record it in the table's schema.
    pub fn create_index_in(
        &self,
        txn: TransactionId,
        table: &str,
        name: &str,
        columns: &[&str],
        unique: bool,
    ) -> Result<Arc<TableSchema>, DatabaseError> {
        self.within(txn, || {
            let mut catalog = self.catalog.write();
            let schema = catalog.get(table).ok_or_else(|| DatabaseError::TableNotFound {
                name: table.to_string(),
            })?;
            if catalog
                .tables()
                .iter()
                .any(|other| other.get_index(name).is_some())
            {
                return Err(DatabaseError::ConstraintViolation {
                    details: format!("index '{}' already exists", name),
                });
            }
            let positions = columns
                .iter()
                .map(|column| {
                    schema
                        .get_column_index(column)
                        .ok_or_else(|| DatabaseError::ColumnNotFound {
                            name: column.to_string(),
                            table: table.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let index_id = self.next_object_id(txn)?;
            let index = IndexSchema {
                name: name.to_string(),
                index_id,
                columns: positions,
                unique,
                primary: false,
                root_page: BTreeIndex::create(&self.pages, txn, index_id)?,
            };

            let tree = self.open_index(&index);
            let mut backfilled = 0;
            for (row_ref, _, payload) in self.heap.scan(schema.table_id, schema.first_page)? {
                let row = Row::from_bytes(&payload)?;
                tree.insert(txn, schema.index_key(&index, &row.values), row_ref)?;
                backfilled += 1;
            }
            info!(table, index = name, backfilled, "index created");
            catalog.persist(&self.pages, txn, schema.with_index(index))
        })
    }

    pub fn insert(&self, table: &str, values: Vec<Value>) -> Result<RowRef, DatabaseError> {
        self.autocommit(|txn| self.insert_in(txn, table, values))
    }

    pub fn insert_in(
        &self,
        txn: TransactionId,
        table: &str,
        values: Vec<Value>,
    ) -> Result<RowRef, DatabaseError> {
        self.within(txn, || {
            let schema = self.table(table)?;
            let mut values = values;
            if values.len() > schema.columns.len() {
                return Err(DatabaseError::ConstraintViolation {
                    details: format!(
                        "Row has {} values but table '{}' expects {} columns",
                        values.len(),
                        schema.name,
                        schema.columns.len()
                    ),
                });
            }
            schema.apply_defaults(&mut values);
            let values = schema
                .columns
                .iter()
                .zip(values)
                .map(|(column, value)| {
                    let value = value.coerce_to(&column.data_type)?;
                    self.spill_lob(txn, &column.data_type, value)
                })
                .collect::<Result<Vec<_>, _>>()?;
            schema.validate_row(&values)?;

            let row_id = self.pages.update_header(txn, |header| {
                let id = header.next_row_id;
                header.next_row_id += 1;
                id
            })?;
            let payload = Row::new(values).to_bytes();
            let row_ref =
                self.heap
                    .insert(txn, schema.table_id, schema.first_page, row_id, &payload)?;

            let row = Row::from_bytes(&payload)?;
            for index in &schema.indexes {
                self.open_index(index)
                    .insert(txn, schema.index_key(index, &row.values), row_ref)?;
            }
            Ok(row_ref)
        })
    }

    // LOB-typed values above the inline threshold move to the LOB store.
    fn spill_lob(
        &self,
        txn: TransactionId,
        data_type: &DataType,
        value: Value,
    ) -> Result<Value, DatabaseError> {
        let threshold = self.config().lob_inline_threshold;
        match (data_type, value) {
            (DataType::Clob, Value::Text(text)) if text.len() > threshold => Ok(Value::Lob(
                self.lobs.store(txn, text.as_bytes(), LobKind::Clob)?,
            )),
            (DataType::Blob, Value::Blob(bytes)) if bytes.len() > threshold => Ok(Value::Lob(
                self.lobs.store(txn, bytes.as_slice(), LobKind::Blob)?,
            )),
            (_, value) => Ok(value),
        }
    }

    pub fn get(&self, table: &str, row_ref: RowRef) -> Result<Row, DatabaseError> {
        let schema = self.table(table)?;
        let (row_id, payload) = self.heap.get(schema.table_id, row_ref)?;
        let row = Row::from_bytes(&payload)?;
        Ok(Row::with_row_id(row_id, row.values))
    }

    pub fn delete(&self, table: &str, row_ref: RowRef) -> Result<(), DatabaseError> {
        self.autocommit(|txn| self.delete_in(txn, table, row_ref))
    }

    /// Remove a row, its index entries and the LOBs it references.
    pub fn delete_in(
        &self,
        txn: TransactionId,
        table: &str,
        row_ref: RowRef,
    ) -> Result<(), DatabaseError> {
        self.within(txn, || {
            let schema = self.table(table)?;
            let row = self.get(table, row_ref)?;
            self.heap.delete(txn, schema.table_id, row_ref)?;
            for index in &schema.indexes {
                self.open_index(index)
                    .delete(txn, schema.index_key(index, &row.values), row_ref)?;
            }
            for value in &row.values {
                if let Value::Lob(lob) = value {
                    self.lobs.delete(txn, lob)?;
                }
            }
            Ok(())
        })
    }

    /// Every live row in storage order.
    pub fn scan_table(&self, table: &str) -> Result<Vec<(RowRef, Row)>, DatabaseError> {
        let schema = self.table(table)?;
        self.heap
            .scan(schema.table_id, schema.first_page)?
            .into_iter()
            .map(|(row_ref, row_id, payload)| {
                let row = Row::from_bytes(&payload)?;
                Ok((row_ref, Row::with_row_id(row_id, row.values)))
            })
            .collect()
    }

    /// Handle on one of the table's indexes, for lazy scans.
    pub fn index(&self, table: &str, index: &str) -> Result<BTreeIndex, DatabaseError> {
        let schema = self.table(table)?;
        let index = schema
            .get_index(index)
            .ok_or_else(|| DatabaseError::IndexNotFound {
                name: index.to_string(),
                table: table.to_string(),
            })?;
        Ok(self.open_index(index))
    }

    pub fn index_scan(
        &self,
        table: &str,
        index: &str,
        range: KeyRange,
        direction: ScanDirection,
    ) -> Result<Vec<(RowRef, Row)>, DatabaseError> {
        self.index(table, index)?
            .scan(range, direction)
            .map(|entry| {
                let entry = entry?;
                Ok((entry.row_ref, self.get(table, entry.row_ref)?))
            })
            .collect()
    }

    pub fn find(
        &self,
        table: &str,
        index: &str,
        key: &[Value],
    ) -> Result<Option<(RowRef, Row)>, DatabaseError> {
        match self.index(table, index)?.find(key)? {
            Some(row_ref) => Ok(Some((row_ref, self.get(table, row_ref)?))),
            None => Ok(None),
        }
    }

    pub fn lob_reader(&self, lob: &LobRef) -> LobReader {
        self.lobs.retrieve(lob)
    }

    pub fn read_lob(&self, lob: &LobRef) -> Result<Vec<u8>, DatabaseError> {
        self.lobs.read_to_vec(lob)
    }

    pub fn store_lob<R: std::io::Read>(
        &self,
        source: R,
        kind: LobKind,
    ) -> Result<LobRef, DatabaseError> {
        self.autocommit(|txn| self.lobs.store(txn, source, kind))
    }

    /// Replace LOB references with their content.
    pub fn materialize(&self, row: &Row) -> Result<Row, DatabaseError> {
        let values = row
            .values
            .iter()
            .map(|value| match value {
                Value::Lob(lob) => {
                    let bytes = self.read_lob(lob)?;
                    match lob.kind {
                        LobKind::Blob => Ok(Value::Blob(bytes)),
                        LobKind::Clob => String::from_utf8(bytes).map(Value::Text).map_err(|err| {
                            DatabaseError::SerializationError {
                                details: format!("CLOB {} is not UTF-8: {}", lob.lob_id, err),
                            }
                        }),
                    }
                }
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        Ok(Row {
            row_id: row.row_id,
            values,
        })
    }
}
