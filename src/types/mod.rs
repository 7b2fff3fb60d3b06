pub mod entry;
pub mod error;
pub mod page;
pub mod row;
pub mod value;

// Common type aliases
pub type PageId = u64;
pub type RowId = u64;
pub type LobId = u64;
pub type TableId = u64;
pub type TransactionId = u64;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 40; // Per-page header
pub const CHECKSUM_SIZE: usize = 4; // CRC32 footer
pub const SLOT_DIRECTORY_ENTRY_SIZE: usize = 4; // offset (2 bytes) + length (2 bytes)

/// End of the cell area; the checksum footer follows.
pub const PAGE_DATA_END: usize = PAGE_SIZE - CHECKSUM_SIZE;

/// Bytes available for slots and cells on an empty page.
pub const PAGE_CAPACITY: usize = PAGE_DATA_END - PAGE_HEADER_SIZE;

/// Sentinel for "no page" in on-disk links.
pub const NO_PAGE: u64 = u64::MAX;

pub const LOB_CHUNK_HEADER_SIZE: usize = 16; // lob_id(8) + sequence(4) + length(4)
pub const LOB_CHUNK_SIZE: usize = 4000;

pub const ROW_CELL_HEADER_SIZE: usize = 20; // row_id(8) + total_len(4) + overflow_head(8)
pub const MAX_INLINE_ROW: usize = 1024;
pub const INLINE_PREFIX: usize = 256;
pub const OVERFLOW_CELL_HEADER_SIZE: usize = 8; // row_id
pub const OVERFLOW_PAYLOAD_SIZE: usize =
    PAGE_CAPACITY - SLOT_DIRECTORY_ENTRY_SIZE - OVERFLOW_CELL_HEADER_SIZE;

pub const FILE_MAGIC: &[u8; 16] = b"LUMBUNG DB v0.1\0";
pub const FILE_FORMAT_VERSION: u8 = 1;

const _: () = assert!(
    LOB_CHUNK_HEADER_SIZE + LOB_CHUNK_SIZE + SLOT_DIRECTORY_ENTRY_SIZE <= PAGE_CAPACITY
);
const _: () = assert!(
    ROW_CELL_HEADER_SIZE + MAX_INLINE_ROW + SLOT_DIRECTORY_ENTRY_SIZE <= PAGE_CAPACITY
);
