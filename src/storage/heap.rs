//! Row storage. Each table owns a chain of data pages; a row lives in one
//! cell, with anything past `MAX_INLINE_ROW` moved to an overflow chain.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    storage::page_store::PageStore,
    types::{
        INLINE_PREFIX, MAX_INLINE_ROW, NO_PAGE, OVERFLOW_CELL_HEADER_SIZE, OVERFLOW_PAYLOAD_SIZE,
        PageId, ROW_CELL_HEADER_SIZE, RowId, TableId, TransactionId,
        entry::RowRef,
        error::DatabaseError,
        page::{Page, PageType, read_u32, read_u64},
    },
};

/// `row_id u64 | total_len u32 | overflow_head u64 | inline payload`
#[derive(Debug, Clone, PartialEq)]
pub struct RowCell {
    pub row_id: RowId,
    pub total_len: u32,
    pub overflow_head: Option<PageId>,
    pub inline: Vec<u8>,
}

impl RowCell {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ROW_CELL_HEADER_SIZE + self.inline.len());
        bytes.extend_from_slice(&self.row_id.to_le_bytes());
        bytes.extend_from_slice(&self.total_len.to_le_bytes());
        bytes.extend_from_slice(&self.overflow_head.unwrap_or(NO_PAGE).to_le_bytes());
        bytes.extend_from_slice(&self.inline);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < ROW_CELL_HEADER_SIZE {
            return Err(DatabaseError::SerializationError {
                details: "Row cell header truncated".to_string(),
            });
        }
        let row_id = read_u64(bytes, 0);
        let total_len = read_u32(bytes, 8);
        let overflow_head = read_u64(bytes, 12);
        let inline = bytes[ROW_CELL_HEADER_SIZE..].to_vec();
        let overflow_head = (overflow_head != NO_PAGE).then_some(overflow_head);

        if inline.len() > total_len as usize
            || (overflow_head.is_none() && inline.len() != total_len as usize)
        {
            return Err(DatabaseError::SerializationError {
                details: format!(
                    "Row {} holds {} inline bytes of {}",
                    row_id,
                    inline.len(),
                    total_len
                ),
            });
        }
        Ok(Self {
            row_id,
            total_len,
            overflow_head,
            inline,
        })
    }

    /// Bytes that live on the overflow chain.
    pub fn overflow_len(&self) -> usize {
        self.total_len as usize - self.inline.len()
    }
}

/// Decode the single `row_id u64 | payload` cell of an overflow page.
pub fn decode_overflow_cell(page: &Page) -> Result<(RowId, &[u8]), DatabaseError> {
    let cell = page
        .get_cell(0)
        .filter(|cell| cell.len() >= OVERFLOW_CELL_HEADER_SIZE)
        .ok_or_else(|| DatabaseError::OverflowChainBroken {
            page_id: page.page_id,
            reason: "overflow page has no payload cell".to_string(),
        })?;
    Ok((read_u64(cell, 0), &cell[OVERFLOW_CELL_HEADER_SIZE..]))
}

pub struct TableHeap {
    pages: Arc<PageStore>,
    /// Last known data page per table, so inserts skip the chain walk.
    tails: Mutex<HashMap<TableId, PageId>>,
}

impl TableHeap {
    pub fn new(pages: Arc<PageStore>) -> Self {
        Self {
            pages,
            tails: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the first data page of a new table.
    pub fn create(&self, txn: TransactionId, table_id: TableId) -> Result<PageId, DatabaseError> {
        let page_id = self.pages.allocate(txn)?;
        let page = Page::new(page_id, PageType::Data).with_owner(table_id);
        self.pages.write_page(txn, &page)?;
        Ok(page_id)
    }

    pub fn insert(
        &self,
        txn: TransactionId,
        table_id: TableId,
        first_page: PageId,
        row_id: RowId,
        payload: &[u8],
    ) -> Result<RowRef, DatabaseError> {
        let (inline, overflow_head) = if payload.len() <= MAX_INLINE_ROW {
            (payload.to_vec(), None)
        } else {
            let head = self.write_overflow(txn, table_id, row_id, &payload[INLINE_PREFIX..])?;
            (payload[..INLINE_PREFIX].to_vec(), Some(head))
        };
        let cell = RowCell {
            row_id,
            total_len: payload.len() as u32,
            overflow_head,
            inline,
        }
        .to_bytes();

        let mut page = self.tail_page(table_id, first_page)?;
        if !page.can_fit(cell.len()) {
            let page_id = self.pages.allocate(txn)?;
            let mut fresh = Page::new(page_id, PageType::Data).with_owner(table_id);
            fresh.prev_page_id = Some(page.page_id);
            page.next_page_id = Some(page_id);
            self.pages.write_page(txn, &page)?;
            page = fresh;
        }
        let slot = page.insert_cell(&cell)?;
        self.pages.write_page(txn, &page)?;
        self.tails.lock().insert(table_id, page.page_id);
        Ok(RowRef::new(page.page_id, slot as u16))
    }

    fn write_overflow(
        &self,
        txn: TransactionId,
        table_id: TableId,
        row_id: RowId,
        rest: &[u8],
    ) -> Result<PageId, DatabaseError> {
        let mut head = NO_PAGE;
        let mut pending: Option<Page> = None;
        for piece in rest.chunks(OVERFLOW_PAYLOAD_SIZE) {
            let page_id = self.pages.allocate(txn)?;
            let mut page = Page::new(page_id, PageType::Overflow).with_owner(table_id);
            let mut cell = Vec::with_capacity(OVERFLOW_CELL_HEADER_SIZE + piece.len());
            cell.extend_from_slice(&row_id.to_le_bytes());
            cell.extend_from_slice(piece);
            page.insert_cell(&cell)?;
            match pending.take() {
                Some(mut previous) => {
                    previous.next_page_id = Some(page_id);
                    page.prev_page_id = Some(previous.page_id);
                    self.pages.write_page(txn, &previous)?;
                }
                None => head = page_id,
            }
            pending = Some(page);
        }
        if let Some(last) = pending {
            self.pages.write_page(txn, &last)?;
        }
        Ok(head)
    }

    // The cached tail is only a hint; rollbacks can invalidate it.
    fn tail_page(&self, table_id: TableId, first_page: PageId) -> Result<Page, DatabaseError> {
        let hint = self.tails.lock().get(&table_id).copied();
        if let Some(page_id) = hint {
            if let Ok(page) = self.pages.read_page(page_id) {
                if page.page_type == PageType::Data
                    && page.owner == table_id
                    && page.next_page_id.is_none()
                {
                    return Ok(page);
                }
            }
        }

        let mut page = self.data_page(table_id, first_page)?;
        let mut visited = HashSet::from([first_page]);
        while let Some(next) = page.next_page_id {
            if !visited.insert(next) {
                return Err(DatabaseError::CorruptedPage {
                    page_id: next,
                    reason: format!("cycle in data chain of table {}", table_id),
                });
            }
            page = self.data_page(table_id, next)?;
        }
        Ok(page)
    }

    fn data_page(&self, table_id: TableId, page_id: PageId) -> Result<Page, DatabaseError> {
        let page = self.pages.read_page(page_id)?;
        if page.page_type != PageType::Data || page.owner != table_id {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("not a data page of table {}", table_id),
            });
        }
        Ok(page)
    }

    /// Fetch a row's id and full payload.
    pub fn get(&self, table_id: TableId, row_ref: RowRef) -> Result<(RowId, Vec<u8>), DatabaseError> {
        let page = self.data_page(table_id, row_ref.page_id)?;
        let cell = self.cell_at(&page, row_ref)?;
        let row_id = cell.row_id;
        Ok((row_id, self.assemble(table_id, cell)?))
    }

    fn cell_at(&self, page: &Page, row_ref: RowRef) -> Result<RowCell, DatabaseError> {
        let bytes = page
            .get_cell(row_ref.slot as usize)
            .ok_or(DatabaseError::InvalidSlotIndex {
                index: row_ref.slot as usize,
                max: page.slot_directory.slots.len(),
            })?;
        RowCell::from_bytes(bytes)
    }

    fn assemble(&self, table_id: TableId, cell: RowCell) -> Result<Vec<u8>, DatabaseError> {
        let remaining = cell.overflow_len();
        let mut payload = cell.inline;
        let mut next = cell.overflow_head;
        let mut visited = HashSet::new();
        while payload.len() < cell.total_len as usize {
            let Some(page_id) = next else {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id: NO_PAGE,
                    reason: format!("row {} ends {} bytes short", cell.row_id, remaining),
                });
            };
            if !visited.insert(page_id) {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id,
                    reason: "cycle in overflow chain".to_string(),
                });
            }
            let page = self.pages.read_page(page_id)?;
            if page.page_type != PageType::Overflow || page.owner != table_id {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id,
                    reason: format!("expected an overflow page, found {:?}", page.page_type),
                });
            }
            let (row_id, piece) = decode_overflow_cell(&page)?;
            if row_id != cell.row_id {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id,
                    reason: format!("page belongs to row {}", row_id),
                });
            }
            payload.extend_from_slice(piece);
            next = page.next_page_id;
        }
        if payload.len() != cell.total_len as usize {
            return Err(DatabaseError::OverflowChainBroken {
                page_id: next.unwrap_or(NO_PAGE),
                reason: format!(
                    "row {} assembled {} bytes, expected {}",
                    cell.row_id,
                    payload.len(),
                    cell.total_len
                ),
            });
        }
        Ok(payload)
    }

    /// Tombstone the row's slot and free its overflow pages.
    pub fn delete(
        &self,
        txn: TransactionId,
        table_id: TableId,
        row_ref: RowRef,
    ) -> Result<RowId, DatabaseError> {
        let mut page = self.data_page(table_id, row_ref.page_id)?;
        let cell = self.cell_at(&page, row_ref)?;
        page.tombstone_cell(row_ref.slot as usize)?;
        self.pages.write_page(txn, &page)?;

        let mut next = cell.overflow_head;
        let mut visited = HashSet::new();
        while let Some(page_id) = next {
            if !visited.insert(page_id) {
                break;
            }
            let overflow = self.pages.read_page(page_id)?;
            next = overflow.next_page_id;
            self.pages.free(txn, page_id)?;
        }
        Ok(cell.row_id)
    }

    /// Every live row of the table in chain order.
    pub fn scan(
        &self,
        table_id: TableId,
        first_page: PageId,
    ) -> Result<Vec<(RowRef, RowId, Vec<u8>)>, DatabaseError> {
        let mut rows = Vec::new();
        let mut next = Some(first_page);
        let mut visited = HashSet::new();
        while let Some(page_id) = next {
            if !visited.insert(page_id) {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: format!("cycle in data chain of table {}", table_id),
                });
            }
            let page = self.data_page(table_id, page_id)?;
            for (slot, bytes) in page.cells() {
                let cell = RowCell::from_bytes(bytes)?;
                let row_id = cell.row_id;
                let payload = self.assemble(table_id, cell)?;
                rows.push((RowRef::new(page_id, slot as u16), row_id, payload));
            }
            next = page.next_page_id;
        }
        Ok(rows)
    }
}
