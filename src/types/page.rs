use serde::{Deserialize, Serialize};

use crate::{
    types::{
        NO_PAGE, PAGE_DATA_END, PAGE_HEADER_SIZE, PAGE_SIZE, PageId, SLOT_DIRECTORY_ENTRY_SIZE,
        error::DatabaseError,
    },
    utils::hash::{verify_page_checksum, write_page_checksum},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageType {
    Header = 1,
    Free = 2,
    Data = 3,
    Overflow = 4,
    IndexLeaf = 5,
    IndexInterior = 6,
    LobChunk = 7,
    Schema = 8,
}

impl PageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PageType::Header),
            2 => Some(PageType::Free),
            3 => Some(PageType::Data),
            4 => Some(PageType::Overflow),
            5 => Some(PageType::IndexLeaf),
            6 => Some(PageType::IndexInterior),
            7 => Some(PageType::LobChunk),
            8 => Some(PageType::Schema),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub offset: u16, // Offset from beginning of page, 0 marks a deleted slot
    pub length: u16, // Length of the cell
}

impl SlotEntry {
    pub fn is_deleted(&self) -> bool {
        self.offset == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDirectory {
    pub slots: Vec<SlotEntry>,
}

/*
 * Page Layout on Disk (Slotted Page Structure)
 * ┌─────────────────────────────────────────────────────────────────┐
 * │                    PAGE HEADER (40 bytes)                       │
 * │  page_type(1) | reserved(3) | page_id(8) | next_page(8) |       │
 * │  prev_page(8) | owner(8) | cell_count(2) | free_space_offset(2) │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                  SLOT DIRECTORY                                 │
 * │  [slot0: offset(2)|len(2)] [slot1: offset(2)|len(2)] ...        │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                    FREE SPACE                                   │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                   CELL DATA                                     │
 * │  [...cell N...] [...cell 2...] [...cell 1...] [...cell 0...]    │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                 CRC32 CHECKSUM (4 bytes)                        │
 * └─────────────────────────────────────────────────────────────────┘
 */

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub page_id: PageId,
    pub page_type: PageType,
    pub next_page_id: Option<PageId>,
    pub prev_page_id: Option<PageId>,
    /// Table id, index id or LOB id depending on the page type.
    pub owner: u64,

    // Slotted page structure
    pub slot_directory: SlotDirectory,
    pub free_space_offset: u16,
    pub cell_count: u16,

    // Data storage
    pub data: Vec<u8>,
}

fn link_to_bytes(link: Option<PageId>) -> [u8; 8] {
    link.unwrap_or(NO_PAGE).to_le_bytes()
}

fn link_from_bytes(bytes: &[u8]) -> Option<PageId> {
    let raw = read_u64(bytes, 0);
    if raw == NO_PAGE { None } else { Some(raw) }
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

impl Page {
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            next_page_id: None,
            prev_page_id: None,
            owner: 0,
            slot_directory: SlotDirectory { slots: Vec::new() },
            free_space_offset: PAGE_DATA_END as u16,
            cell_count: 0,
            data: vec![0; PAGE_SIZE],
        }
    }

    pub fn with_owner(mut self, owner: u64) -> Self {
        self.owner = owner;
        self
    }

    /// Serialize the page to bytes following the documented layout, checksum included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; PAGE_SIZE];

        buffer[0] = self.page_type.as_u8();
        buffer[4..12].copy_from_slice(&self.page_id.to_le_bytes());
        buffer[12..20].copy_from_slice(&link_to_bytes(self.next_page_id));
        buffer[20..28].copy_from_slice(&link_to_bytes(self.prev_page_id));
        buffer[28..36].copy_from_slice(&self.owner.to_le_bytes());
        buffer[36..38].copy_from_slice(&self.cell_count.to_le_bytes());
        buffer[38..40].copy_from_slice(&self.free_space_offset.to_le_bytes());

        let mut offset = PAGE_HEADER_SIZE;
        for slot in &self.slot_directory.slots {
            buffer[offset..offset + 2].copy_from_slice(&slot.offset.to_le_bytes());
            buffer[offset + 2..offset + 4].copy_from_slice(&slot.length.to_le_bytes());
            offset += SLOT_DIRECTORY_ENTRY_SIZE;
        }

        // The cell data is already properly positioned in self.data
        let cells = self.free_space_offset as usize..PAGE_DATA_END;
        buffer[cells.clone()].copy_from_slice(&self.data[cells]);

        write_page_checksum(&mut buffer);
        buffer
    }

    /// Deserialize a page, verifying its checksum and structure first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() != PAGE_SIZE {
            return Err(DatabaseError::CorruptedPage {
                page_id: NO_PAGE,
                reason: format!("expected {} bytes, got {}", PAGE_SIZE, bytes.len()),
            });
        }

        let page_id = read_u64(bytes, 4);
        if let Err((stored, computed)) = verify_page_checksum(bytes) {
            return Err(DatabaseError::PageChecksum {
                page_id,
                stored,
                computed,
            });
        }

        let page_type = PageType::from_u8(bytes[0]).ok_or(DatabaseError::UnknownPageType {
            page_id,
            tag: bytes[0],
        })?;
        let next_page_id = link_from_bytes(&bytes[12..20]);
        let prev_page_id = link_from_bytes(&bytes[20..28]);
        let owner = read_u64(bytes, 28);
        let cell_count = read_u16(bytes, 36);
        let free_space_offset = read_u16(bytes, 38);

        let directory_end = PAGE_HEADER_SIZE + cell_count as usize * SLOT_DIRECTORY_ENTRY_SIZE;
        if directory_end > PAGE_DATA_END {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: "Slot directory extends beyond page boundary".to_string(),
            });
        }
        if (free_space_offset as usize) < directory_end
            || free_space_offset as usize > PAGE_DATA_END
        {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("Invalid free_space_offset: {}", free_space_offset),
            });
        }

        let mut slots = Vec::with_capacity(cell_count as usize);
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..cell_count {
            let slot = SlotEntry {
                offset: read_u16(bytes, offset),
                length: read_u16(bytes, offset + 2),
            };
            offset += SLOT_DIRECTORY_ENTRY_SIZE;

            if !slot.is_deleted()
                && ((slot.offset as usize) < free_space_offset as usize
                    || slot.offset as usize + slot.length as usize > PAGE_DATA_END)
            {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: format!(
                        "Slot at offset {} with length {} exceeds cell area",
                        slot.offset, slot.length
                    ),
                });
            }
            slots.push(slot);
        }

        Ok(Page {
            page_id,
            page_type,
            next_page_id,
            prev_page_id,
            owner,
            slot_directory: SlotDirectory { slots },
            free_space_offset,
            cell_count,
            data: bytes.to_vec(),
        })
    }

    pub fn available_space(&self) -> usize {
        let slot_directory_size = self.slot_directory.slots.len() * SLOT_DIRECTORY_ENTRY_SIZE;
        self.free_space_offset as usize - PAGE_HEADER_SIZE - slot_directory_size
    }

    pub fn can_fit(&self, data_size: usize) -> bool {
        self.available_space() >= data_size + SLOT_DIRECTORY_ENTRY_SIZE
    }

    /// Bytes taken by slots and live cells.
    pub fn used_space(&self) -> usize {
        self.slot_directory.slots.len() * SLOT_DIRECTORY_ENTRY_SIZE
            + (PAGE_DATA_END - self.free_space_offset as usize)
    }

    pub fn insert_cell(&mut self, data: &[u8]) -> Result<usize, DatabaseError> {
        if !self.can_fit(data.len()) {
            return Err(DatabaseError::PageFull {
                page_id: self.page_id,
            });
        }

        // Calculate new offset for the cell (grows downward)
        let new_offset = self.free_space_offset - data.len() as u16;

        let start = new_offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);

        let slot_index = self.slot_directory.slots.len();
        self.slot_directory.slots.push(SlotEntry {
            offset: new_offset,
            length: data.len() as u16,
        });

        self.free_space_offset = new_offset;
        self.cell_count += 1;

        Ok(slot_index)
    }

    pub fn get_cell(&self, slot_index: usize) -> Option<&[u8]> {
        let slot = self.slot_directory.slots.get(slot_index)?;
        if slot.is_deleted() {
            return None;
        }
        let start = slot.offset as usize;
        Some(&self.data[start..start + slot.length as usize])
    }

    /// Live cells in slot order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        (0..self.slot_directory.slots.len())
            .filter_map(move |index| self.get_cell(index).map(|cell| (index, cell)))
    }

    /// Mark a slot deleted without shifting later slots, so row references stay valid.
    pub fn tombstone_cell(&mut self, slot_index: usize) -> Result<(), DatabaseError> {
        let max = self.slot_directory.slots.len();
        let slot = self
            .slot_directory
            .slots
            .get_mut(slot_index)
            .ok_or(DatabaseError::InvalidSlotIndex {
                index: slot_index,
                max,
            })?;
        if slot.is_deleted() {
            return Err(DatabaseError::InvalidSlotIndex {
                index: slot_index,
                max,
            });
        }
        slot.offset = 0;
        slot.length = 0;
        self.compact_page();
        Ok(())
    }

    /// Drop all cells, keeping the header links.
    pub fn clear_cells(&mut self) {
        self.slot_directory.slots.clear();
        self.cell_count = 0;
        self.free_space_offset = PAGE_DATA_END as u16;
        self.data[PAGE_HEADER_SIZE..PAGE_DATA_END].fill(0);
    }

    // Defragment the page by moving all cells to eliminate gaps
    fn compact_page(&mut self) {
        let mut live: Vec<(usize, SlotEntry)> = self
            .slot_directory
            .slots
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, slot)| !slot.is_deleted())
            .collect();
        // Highest offset first keeps the on-page order of cells
        live.sort_by(|a, b| b.1.offset.cmp(&a.1.offset));

        let mut compacted = vec![0u8; PAGE_DATA_END];
        let mut current_offset = PAGE_DATA_END;
        for (index, slot) in live {
            let start = slot.offset as usize;
            let length = slot.length as usize;
            current_offset -= length;
            compacted[current_offset..current_offset + length]
                .copy_from_slice(&self.data[start..start + length]);
            self.slot_directory.slots[index].offset = current_offset as u16;
        }

        self.data[current_offset..PAGE_DATA_END]
            .copy_from_slice(&compacted[current_offset..PAGE_DATA_END]);
        let directory_end =
            PAGE_HEADER_SIZE + self.slot_directory.slots.len() * SLOT_DIRECTORY_ENTRY_SIZE;
        self.data[directory_end..current_offset].fill(0);
        self.free_space_offset = current_offset as u16;
    }
}
