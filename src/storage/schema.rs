use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    storage::page_store::PageStore,
    types::{
        NO_PAGE, PAGE_CAPACITY, PageId, SLOT_DIRECTORY_ENTRY_SIZE, TableId, TransactionId,
        error::DatabaseError,
        page::{Page, PageType},
        value::{DataType, Value},
    },
};

/// Represents a column definition in a table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub position: usize,
    pub nullable: bool,
    pub default_value: Option<Value>,
    pub primary_key: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            position: 0,
            nullable: true,
            default_value: None,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default_value: Value) -> Self {
        self.default_value = Some(default_value);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false; // Primary keys are always NOT NULL
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub index_id: u64,
    /// Key column positions, in key order.
    pub columns: Vec<usize>,
    pub unique: bool,
    /// Created implicitly for the primary key.
    pub primary: bool,
    pub root_page: PageId,
}

/// Represents a complete table schema. Values are immutable once built;
/// changes produce a new schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: TableId,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
    pub first_page: PageId,
}

impl TableSchema {
    /// Get column by name
    pub fn get_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|col| col.name == name)
    }

    /// Get column index by name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|col| col.name.as_str()).collect()
    }

    pub fn primary_key_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .filter(|col| col.primary_key)
            .map(|col| col.position)
            .collect()
    }

    pub fn get_index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }

    pub fn with_index(&self, index: IndexSchema) -> TableSchema {
        let mut schema = self.clone();
        schema.indexes.push(index);
        schema
    }

    pub(crate) fn with_storage(mut self, table_id: TableId, first_page: PageId) -> TableSchema {
        self.table_id = table_id;
        self.first_page = first_page;
        self
    }

    /// Fill in defaults for missing trailing values and NULLs.
    pub fn apply_defaults(&self, values: &mut Vec<Value>) {
        while values.len() < self.columns.len() {
            values.push(Value::Null);
        }
        for column in &self.columns {
            if let (Some(default_value), Some(slot)) =
                (&column.default_value, values.get_mut(column.position))
            {
                if slot.is_null() {
                    *slot = default_value.clone();
                }
            }
        }
    }

    /// Check column count, NOT NULL and type compatibility.
    pub fn validate_row(&self, values: &[Value]) -> Result<(), DatabaseError> {
        if values.len() != self.columns.len() {
            return Err(DatabaseError::ConstraintViolation {
                details: format!(
                    "Row has {} values but table '{}' expects {} columns",
                    values.len(),
                    self.name,
                    self.columns.len()
                ),
            });
        }

        for (column, value) in self.columns.iter().zip(values) {
            if !column.nullable && value.is_null() {
                return Err(DatabaseError::ConstraintViolation {
                    details: format!("Column '{}' cannot be NULL", column.name),
                });
            }
            if !value.is_null() && !value.is_compatible_with_type(&column.data_type) {
                return Err(DatabaseError::TypeMismatch {
                    expected: format!("{} for column '{}'", column.data_type, column.name),
                    actual: format!("{:?}", value),
                });
            }
        }
        Ok(())
    }

    /// Key values of `index` taken from a row.
    pub fn index_key(&self, index: &IndexSchema, values: &[Value]) -> Vec<Value> {
        index
            .columns
            .iter()
            .map(|&position| values.get(position).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

pub struct TableSchemaBuilder {
    name: String,
    columns: Vec<ColumnSchema>,
}

impl TableSchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSchema) -> Self {
        self.columns.push(column);
        self
    }

    pub fn build(self) -> Result<TableSchema, DatabaseError> {
        if self.name.is_empty() {
            return Err(DatabaseError::ConstraintViolation {
                details: "table name cannot be empty".to_string(),
            });
        }
        if self.columns.is_empty() {
            return Err(DatabaseError::ConstraintViolation {
                details: format!("table '{}' has no columns", self.name),
            });
        }
        let mut columns = self.columns;
        for (position, column) in columns.iter_mut().enumerate() {
            column.position = position;
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|other| other.name == column.name) {
                return Err(DatabaseError::ConstraintViolation {
                    details: format!("duplicate column '{}' in table '{}'", column.name, self.name),
                });
            }
        }
        Ok(TableSchema {
            table_id: 0,
            name: self.name,
            columns,
            indexes: Vec::new(),
            first_page: NO_PAGE,
        })
    }
}

pub fn encode_schema(schema: &TableSchema) -> Result<Vec<u8>, DatabaseError> {
    Ok(bincode::serde::encode_to_vec(
        schema,
        bincode::config::standard(),
    )?)
}

pub fn decode_schema(bytes: &[u8]) -> Result<TableSchema, DatabaseError> {
    let (schema, _) =
        bincode::serde::decode_from_slice::<TableSchema, _>(bytes, bincode::config::standard())?;
    Ok(schema)
}

/// In-memory view of the schema records chained from the header's schema
/// head. Each table is one cell; replacing it tombstones the old cell.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, Arc<TableSchema>>,
    locations: HashMap<String, (PageId, usize)>,
}

impl Catalog {
    pub fn load(pages: &PageStore) -> Result<Self, DatabaseError> {
        let mut catalog = Catalog::default();
        let mut next = pages.header().schema_head;
        let mut visited = HashSet::new();
        while let Some(page_id) = next {
            if !visited.insert(page_id) {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: "cycle in schema chain".to_string(),
                });
            }
            let page = pages.read_page(page_id)?;
            if page.page_type != PageType::Schema {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: format!("expected a schema page, found {:?}", page.page_type),
                });
            }
            for (slot, cell) in page.cells() {
                let schema = decode_schema(cell)?;
                catalog.locations.insert(schema.name.clone(), (page_id, slot));
                catalog.tables.insert(schema.name.clone(), Arc::new(schema));
            }
            next = page.next_page_id;
        }
        debug!(tables = catalog.tables.len(), "catalog loaded");
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// All tables in creation order.
    pub fn tables(&self) -> Vec<Arc<TableSchema>> {
        let mut tables: Vec<_> = self.tables.values().cloned().collect();
        tables.sort_by_key(|table| table.table_id);
        tables
    }

    /// Write `schema` as the current record for its table.
    pub fn persist(
        &mut self,
        pages: &PageStore,
        txn: TransactionId,
        schema: TableSchema,
    ) -> Result<Arc<TableSchema>, DatabaseError> {
        let record = encode_schema(&schema)?;
        if record.len() + SLOT_DIRECTORY_ENTRY_SIZE > PAGE_CAPACITY {
            return Err(DatabaseError::ConstraintViolation {
                details: format!("schema of table '{}' does not fit in a page", schema.name),
            });
        }

        if let Some(&(page_id, slot)) = self.locations.get(&schema.name) {
            let mut page = pages.read_page(page_id)?;
            page.tombstone_cell(slot)?;
            pages.write_page(txn, &page)?;
        }

        let mut target = None;
        let mut next = pages.header().schema_head;
        while let Some(page_id) = next {
            let page = pages.read_page(page_id)?;
            if page.can_fit(record.len()) {
                target = Some(page);
                break;
            }
            next = page.next_page_id;
        }
        let mut page = match target {
            Some(page) => page,
            None => {
                let page_id = pages.allocate_persistent(txn, |page_id, header| {
                    let mut page = Page::new(page_id, PageType::Schema);
                    page.next_page_id = header.schema_head.replace(page_id);
                    page
                })?;
                pages.read_page(page_id)?
            }
        };
        let slot = page.insert_cell(&record)?;
        pages.write_page(txn, &page)?;

        debug!(table = %schema.name, page_id = page.page_id, slot, "schema persisted");
        self.locations.insert(schema.name.clone(), (page.page_id, slot));
        let schema = Arc::new(schema);
        self.tables.insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }
}
