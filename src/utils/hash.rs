use crc32fast::Hasher;

use crate::types::{PAGE_DATA_END, PAGE_SIZE};

/// CRC32 over everything in a page except its footer.
pub fn calculate_page_checksum(page_bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&page_bytes[..PAGE_DATA_END]);
    hasher.finalize()
}

pub fn stored_page_checksum(page_bytes: &[u8]) -> u32 {
    u32::from_le_bytes([
        page_bytes[PAGE_DATA_END],
        page_bytes[PAGE_DATA_END + 1],
        page_bytes[PAGE_DATA_END + 2],
        page_bytes[PAGE_DATA_END + 3],
    ])
}

pub fn write_page_checksum(page_bytes: &mut [u8]) {
    let checksum = calculate_page_checksum(page_bytes);
    page_bytes[PAGE_DATA_END..PAGE_SIZE].copy_from_slice(&checksum.to_le_bytes());
}

/// Returns `(stored, computed)` on mismatch.
pub fn verify_page_checksum(page_bytes: &[u8]) -> Result<(), (u32, u32)> {
    let stored = stored_page_checksum(page_bytes);
    let computed = calculate_page_checksum(page_bytes);
    if stored == computed {
        Ok(())
    } else {
        Err((stored, computed))
    }
}

/// Checksum for a log frame: covers the length prefix and the payload.
pub fn calculate_frame_checksum(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
