use crate::{
    types::{
        FILE_FORMAT_VERSION, FILE_MAGIC, NO_PAGE, PAGE_HEADER_SIZE, PAGE_SIZE, PageId,
        error::DatabaseError,
        page::{Page, PageType},
    },
    utils::hash::{verify_page_checksum, write_page_checksum},
};

/// Header fields start right after the common page header of page 0.
const FIELDS_OFFSET: usize = PAGE_HEADER_SIZE;
const MAGIC_END: usize = FIELDS_OFFSET + 16;
const PAGE_SIZE_OFFSET: usize = MAGIC_END;

/// Database-wide metadata kept in page 0. Every change is logged as a whole
/// image that replay always reapplies, so the free list and id counters are
/// crash-safe without belonging to any one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    pub magic: [u8; 16],
    pub page_size: u32,
    pub format_version: u8,
    pub page_count: u64,
    pub freelist_head: Option<PageId>,
    pub freelist_length: u64,
    pub schema_head: Option<PageId>,
    pub next_table_id: u64,
    pub next_lob_id: u64,
    pub next_row_id: u64,
    pub change_counter: u64,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: *FILE_MAGIC,
            page_size: PAGE_SIZE as u32,
            format_version: FILE_FORMAT_VERSION,
            page_count: 1,
            freelist_head: None,
            freelist_length: 0,
            schema_head: None,
            next_table_id: 1,
            next_lob_id: 1,
            next_row_id: 1,
            change_counter: 0,
        }
    }
}

impl FileHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Page::new(0, PageType::Header).to_bytes();
        let mut fields = Vec::with_capacity(88);

        fields.extend_from_slice(&self.magic);
        fields.extend_from_slice(&self.page_size.to_be_bytes());
        fields.push(self.format_version);
        fields.extend_from_slice(&[0u8; 3]);
        fields.extend_from_slice(&self.page_count.to_be_bytes());
        fields.extend_from_slice(&self.freelist_head.unwrap_or(NO_PAGE).to_be_bytes());
        fields.extend_from_slice(&self.freelist_length.to_be_bytes());
        fields.extend_from_slice(&self.schema_head.unwrap_or(NO_PAGE).to_be_bytes());
        fields.extend_from_slice(&self.next_table_id.to_be_bytes());
        fields.extend_from_slice(&self.next_lob_id.to_be_bytes());
        fields.extend_from_slice(&self.next_row_id.to_be_bytes());
        fields.extend_from_slice(&self.change_counter.to_be_bytes());

        buffer[FIELDS_OFFSET..FIELDS_OFFSET + fields.len()].copy_from_slice(&fields);
        write_page_checksum(&mut buffer);
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        Self::detect_page_size(bytes)?;
        if let Err((stored, computed)) = verify_page_checksum(bytes) {
            return Err(DatabaseError::PageChecksum {
                page_id: 0,
                stored,
                computed,
            });
        }
        if bytes[0] != PageType::Header.as_u8() {
            return Err(DatabaseError::InvalidHeader {
                reason: format!("page 0 has type tag {}", bytes[0]),
            });
        }

        let mut magic = [0u8; 16];
        magic.copy_from_slice(&bytes[FIELDS_OFFSET..MAGIC_END]);

        let mut offset = PAGE_SIZE_OFFSET;
        let page_size = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        offset += 4;

        let format_version = bytes[offset];
        if format_version > FILE_FORMAT_VERSION {
            return Err(DatabaseError::InvalidHeader {
                reason: format!("Unsupported file format version: {}", format_version),
            });
        }
        offset += 4;

        let mut next_u64 = || {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            offset += 8;
            u64::from_be_bytes(raw)
        };
        let page_count = next_u64();
        let freelist_head = next_u64();
        let freelist_length = next_u64();
        let schema_head = next_u64();
        let next_table_id = next_u64();
        let next_lob_id = next_u64();
        let next_row_id = next_u64();
        let change_counter = next_u64();

        Ok(Self {
            magic,
            page_size,
            format_version,
            page_count,
            freelist_head: (freelist_head != NO_PAGE).then_some(freelist_head),
            freelist_length,
            schema_head: (schema_head != NO_PAGE).then_some(schema_head),
            next_table_id,
            next_lob_id,
            next_row_id,
            change_counter,
        })
    }

    /// Determine the page size from the leading bytes of a file without
    /// trusting the rest of page 0.
    pub fn detect_page_size(bytes: &[u8]) -> Result<usize, DatabaseError> {
        if bytes.len() < PAGE_SIZE_OFFSET + 4 {
            return Err(DatabaseError::InvalidHeader {
                reason: "Header too short".to_string(),
            });
        }
        if &bytes[FIELDS_OFFSET..MAGIC_END] != FILE_MAGIC {
            return Err(DatabaseError::InvalidHeader {
                reason: "Invalid magic number".to_string(),
            });
        }
        let page_size = u32::from_be_bytes([
            bytes[PAGE_SIZE_OFFSET],
            bytes[PAGE_SIZE_OFFSET + 1],
            bytes[PAGE_SIZE_OFFSET + 2],
            bytes[PAGE_SIZE_OFFSET + 3],
        ]) as usize;
        if page_size != PAGE_SIZE {
            return Err(DatabaseError::InvalidHeader {
                reason: format!("Unsupported page size: {}", page_size),
            });
        }
        Ok(page_size)
    }
}
