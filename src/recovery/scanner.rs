use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use tracing::{debug, warn};

use crate::{
    storage::header::FileHeader,
    types::{PAGE_SIZE, PageId, error::DatabaseError, page::Page},
};

/// Read-only, page-at-a-time access to a database file that may be damaged.
/// Nothing here trusts the free list, the log or any chain pointer.
pub struct PageScanner {
    file: File,
    page_size: usize,
    physical_pages: u64,
    header: Option<FileHeader>,
    /// Why the magic or page size could not be trusted.
    header_damage: Option<String>,
}

impl PageScanner {
    /// Fails when the file cannot be read, or when page 0 does not identify
    /// it and no later page validates at the default page size either.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let mut file = File::open(path)?;
        let length = file.metadata()?.len();

        let mut first = vec![0u8; PAGE_SIZE.min(length as usize)];
        file.read_exact(&mut first)?;
        let (page_size, header_damage) = match FileHeader::detect_page_size(&first) {
            Ok(page_size) => (page_size, None),
            Err(DatabaseError::InvalidHeader { reason }) => (PAGE_SIZE, Some(reason)),
            Err(err) => return Err(err),
        };

        // The rest of page 0 may still be damaged; its counters are advisory.
        let header = if header_damage.is_none() && first.len() == PAGE_SIZE {
            FileHeader::from_bytes(&first).ok()
        } else {
            None
        };
        let physical_pages = length / page_size as u64;
        debug!(path = %path.display(), physical_pages, "page file opened for scanning");

        let mut scanner = Self {
            file,
            page_size,
            physical_pages,
            header,
            header_damage,
        };
        if let Some(reason) = scanner.header_damage.clone() {
            match scanner.first_valid_page()? {
                Some(page_id) => {
                    warn!(%reason, page_id, "page 0 unreadable, assuming default page size")
                }
                None => return Err(DatabaseError::InvalidHeader { reason }),
            }
        }
        Ok(scanner)
    }

    fn first_valid_page(&mut self) -> Result<Option<PageId>, DatabaseError> {
        for page_id in 1..self.physical_pages {
            match self.read_page(page_id) {
                Ok(_) => return Ok(Some(page_id)),
                Err(DatabaseError::Io(err)) => return Err(DatabaseError::Io(err)),
                Err(_) => {}
            }
        }
        Ok(None)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whole pages present in the file.
    pub fn physical_pages(&self) -> u64 {
        self.physical_pages
    }

    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    /// Set when the page size was assumed rather than read from page 0.
    pub fn header_damage(&self) -> Option<&str> {
        self.header_damage.as_deref()
    }

    /// Page count recorded in the header, when the header is readable.
    pub fn declared_pages(&self) -> Option<u64> {
        self.header.as_ref().map(|header| header.page_count)
    }

    /// Read and validate one page: checksum, type tag, layout and the stored
    /// page id must all agree.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page, DatabaseError> {
        if page_id >= self.physical_pages {
            return Err(DatabaseError::TruncatedFile {
                expected_pages: page_id + 1,
                actual_pages: self.physical_pages,
            });
        }
        let mut bytes = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(page_id * self.page_size as u64))?;
        self.file.read_exact(&mut bytes)?;

        let page = Page::from_bytes(&bytes).map_err(|err| match err {
            DatabaseError::CorruptedPage { reason, .. } => DatabaseError::CorruptedPage {
                page_id,
                reason,
            },
            DatabaseError::PageChecksum {
                stored, computed, ..
            } => DatabaseError::PageChecksum {
                page_id,
                stored,
                computed,
            },
            DatabaseError::UnknownPageType { tag, .. } => {
                DatabaseError::UnknownPageType { page_id, tag }
            }
            other => other,
        })?;
        if page.page_id != page_id {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("page claims to be page {}", page.page_id),
            });
        }
        Ok(page)
    }
}
