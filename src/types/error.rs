use thiserror::Error;

use crate::types::{LobId, PageId, TransactionId};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    PageChecksum {
        page_id: PageId,
        stored: u32,
        computed: u32,
    },

    #[error("Truncated file: expected {expected_pages} pages, found {actual_pages}")]
    TruncatedFile {
        expected_pages: u64,
        actual_pages: u64,
    },

    #[error("Unknown page type {tag} on page {page_id}")]
    UnknownPageType { page_id: PageId, tag: u8 },

    #[error("LOB {lob_id} is missing chunk {sequence}")]
    LobChunkMissing { lob_id: LobId, sequence: u32 },

    #[error("LOB {lob_id} has an out-of-order or duplicate chunk {sequence}")]
    LobChunkOrder { lob_id: LobId, sequence: u32 },

    #[error("Schema inconsistency: {details}")]
    SchemaInconsistent { details: String },

    #[error("Overflow chain broken at page {page_id}: {reason}")]
    OverflowChainBroken { page_id: PageId, reason: String },

    #[error("Page is full (page_id: {page_id})")]
    PageFull { page_id: PageId },

    #[error("Invalid slot index {index} (max: {max})")]
    InvalidSlotIndex { index: usize, max: usize },

    #[error("Column index {index} out of bounds")]
    ColumnIndexOutOfBounds { index: usize },

    #[error("Corrupted page: page_id={page_id}, reason={reason}")]
    CorruptedPage { page_id: PageId, reason: String },

    #[error("Page {page_id} is beyond the end of the file ({page_count} pages)")]
    PageOutOfRange { page_id: PageId, page_count: u64 },

    #[error("Serialization/deserialization error: {details}")]
    SerializationError { details: String },

    #[error("Invalid database header: {reason}")]
    InvalidHeader { reason: String },

    #[error("Table '{name}' not found")]
    TableNotFound { name: String },

    #[error("Table '{name}' already exists")]
    TableExists { name: String },

    #[error("Column '{name}' not found in table '{table}'")]
    ColumnNotFound { name: String, table: String },

    #[error("Index '{name}' not found on table '{table}'")]
    IndexNotFound { name: String, table: String },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Constraint violation: {details}")]
    ConstraintViolation { details: String },

    #[error("Duplicate key in unique index '{index}'")]
    DuplicateKey { index: String },

    #[error("Page {page_id} is locked by transaction {owner}")]
    PageLocked {
        page_id: PageId,
        owner: TransactionId,
    },

    #[error("Transaction {txn} is not active")]
    TransactionNotActive { txn: TransactionId },

    #[error("{count} transaction(s) still active")]
    TransactionsActive { count: usize },

    #[error("SQL parsing error: {0}")]
    Script(#[from] sqlparser::parser::ParserError),

    #[error("Unsupported statement: {details}")]
    UnsupportedStatement { details: String },
}

/// How far an error reaches: one page/chunk/row, or the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

impl DatabaseError {
    pub fn severity(&self) -> Severity {
        match self {
            DatabaseError::Io(_) | DatabaseError::InvalidHeader { .. } => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

impl From<bincode::error::EncodeError> for DatabaseError {
    fn from(err: bincode::error::EncodeError) -> Self {
        DatabaseError::SerializationError {
            details: err.to_string(),
        }
    }
}

impl From<bincode::error::DecodeError> for DatabaseError {
    fn from(err: bincode::error::DecodeError) -> Self {
        DatabaseError::SerializationError {
            details: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
