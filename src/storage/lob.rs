//! Large objects split into fixed-size chunks, one chunk per page.
//!
//! Chunk pages of one LOB are chained through `next_page_id` from the
//! reference's `first_page`. Values are consumed and produced chunk by chunk,
//! so nothing here holds more than one chunk of a LOB in memory.

use std::{
    io::{self, ErrorKind, Read},
    sync::Arc,
};

use tracing::debug;

use crate::{
    storage::page_store::PageStore,
    types::{
        LOB_CHUNK_HEADER_SIZE, LOB_CHUNK_SIZE, LobId, NO_PAGE, PageId, TransactionId,
        error::DatabaseError,
        page::{Page, PageType, read_u32, read_u64},
        value::{LobKind, LobRef},
    },
};

/// One chunk record: `lob_id u64 | sequence u32 | length u32 | payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct LobChunk {
    pub lob_id: LobId,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl LobChunk {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LOB_CHUNK_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.lob_id.to_le_bytes());
        bytes.extend_from_slice(&self.sequence.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < LOB_CHUNK_HEADER_SIZE {
            return Err(DatabaseError::SerializationError {
                details: "LOB chunk header truncated".to_string(),
            });
        }
        let lob_id = read_u64(bytes, 0);
        let sequence = read_u32(bytes, 8);
        let length = read_u32(bytes, 12) as usize;
        if length > LOB_CHUNK_SIZE || bytes.len() < LOB_CHUNK_HEADER_SIZE + length {
            return Err(DatabaseError::SerializationError {
                details: format!("LOB {} chunk {} claims {} bytes", lob_id, sequence, length),
            });
        }
        Ok(Self {
            lob_id,
            sequence,
            payload: bytes[LOB_CHUNK_HEADER_SIZE..LOB_CHUNK_HEADER_SIZE + length].to_vec(),
        })
    }

    /// Decode the chunk held by a `LobChunk` page.
    pub fn from_page(page: &Page) -> Result<Self, DatabaseError> {
        if page.page_type != PageType::LobChunk {
            return Err(DatabaseError::CorruptedPage {
                page_id: page.page_id,
                reason: format!("expected a LOB chunk page, found {:?}", page.page_type),
            });
        }
        let cell = page.get_cell(0).ok_or_else(|| DatabaseError::CorruptedPage {
            page_id: page.page_id,
            reason: "LOB chunk page has no cell".to_string(),
        })?;
        Self::from_bytes(cell)
    }
}

// Read until `buffer` is full or the source is exhausted.
fn fill_chunk<R: Read>(source: &mut R, buffer: &mut [u8]) -> Result<usize, DatabaseError> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

pub struct LobStore {
    pages: Arc<PageStore>,
}

impl LobStore {
    pub fn new(pages: Arc<PageStore>) -> Self {
        Self { pages }
    }

    /// Consume `source` into a new LOB. The id comes from the header counter
    /// and is never reused.
    pub fn store<R: Read>(
        &self,
        txn: TransactionId,
        mut source: R,
        kind: LobKind,
    ) -> Result<LobRef, DatabaseError> {
        let lob_id = self.pages.update_header(txn, |header| {
            let id = header.next_lob_id;
            header.next_lob_id += 1;
            id
        })?;

        let mut buffer = vec![0u8; LOB_CHUNK_SIZE];
        let mut first_page = NO_PAGE;
        let mut pending: Option<Page> = None;
        let mut length = 0u64;
        let mut sequence = 0u32;

        loop {
            let filled = fill_chunk(&mut source, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let page_id = self.pages.allocate(txn)?;
            let mut page = Page::new(page_id, PageType::LobChunk).with_owner(lob_id);
            let chunk = LobChunk {
                lob_id,
                sequence,
                payload: buffer[..filled].to_vec(),
            };
            page.insert_cell(&chunk.to_bytes())?;

            match pending.take() {
                Some(mut previous) => {
                    previous.next_page_id = Some(page_id);
                    page.prev_page_id = Some(previous.page_id);
                    self.pages.write_page(txn, &previous)?;
                }
                None => first_page = page_id,
            }
            pending = Some(page);
            length += filled as u64;
            sequence += 1;

            if filled < LOB_CHUNK_SIZE {
                break;
            }
        }
        if let Some(last) = pending {
            self.pages.write_page(txn, &last)?;
        }

        debug!(txn, lob_id, length, chunks = sequence, "LOB stored");
        Ok(LobRef {
            lob_id,
            first_page,
            length,
            kind,
        })
    }

    /// Stream a LOB back chunk by chunk.
    pub fn retrieve(&self, lob: &LobRef) -> LobReader {
        LobReader::new(Arc::clone(&self.pages), *lob)
    }

    pub fn read_to_vec(&self, lob: &LobRef) -> Result<Vec<u8>, DatabaseError> {
        let mut reader = self.retrieve(lob);
        let mut bytes = Vec::with_capacity(lob.length as usize);
        while let Some(chunk) = reader.next_chunk()? {
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Free every chunk page of `lob`.
    pub fn delete(&self, txn: TransactionId, lob: &LobRef) -> Result<(), DatabaseError> {
        let mut next = (lob.first_page != NO_PAGE).then_some(lob.first_page);
        let mut freed = 0;
        while let Some(page_id) = next {
            let page = self.pages.read_page(page_id)?;
            if page.page_type != PageType::LobChunk || page.owner != lob.lob_id {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: format!("page does not belong to LOB {}", lob.lob_id),
                });
            }
            next = page.next_page_id;
            self.pages.free(txn, page_id)?;
            freed += 1;
        }
        debug!(txn, lob_id = lob.lob_id, freed, "LOB deleted");
        Ok(())
    }
}

/// Lazy reader over a stored LOB. [`LobReader::rewind`] starts over from the
/// first chunk.
pub struct LobReader {
    pages: Arc<PageStore>,
    lob: LobRef,
    next_page: Option<PageId>,
    sequence: u32,
    delivered: u64,
    buffer: Vec<u8>,
    position: usize,
}

impl LobReader {
    fn new(pages: Arc<PageStore>, lob: LobRef) -> Self {
        Self {
            pages,
            next_page: (lob.first_page != NO_PAGE).then_some(lob.first_page),
            lob,
            sequence: 0,
            delivered: 0,
            buffer: Vec::new(),
            position: 0,
        }
    }

    pub fn lob(&self) -> &LobRef {
        &self.lob
    }

    pub fn rewind(&mut self) {
        self.next_page = (self.lob.first_page != NO_PAGE).then_some(self.lob.first_page);
        self.sequence = 0;
        self.delivered = 0;
        self.buffer.clear();
        self.position = 0;
    }

    /// The next chunk's payload, or `None` once the whole value was produced.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DatabaseError> {
        let lob_id = self.lob.lob_id;
        let Some(page_id) = self.next_page else {
            if self.delivered != self.lob.length {
                return Err(DatabaseError::LobChunkMissing {
                    lob_id,
                    sequence: self.sequence,
                });
            }
            return Ok(None);
        };

        let page = self.pages.read_page(page_id)?;
        if page.owner != lob_id {
            return Err(DatabaseError::LobChunkMissing {
                lob_id,
                sequence: self.sequence,
            });
        }
        let chunk = LobChunk::from_page(&page)?;
        if chunk.lob_id != lob_id || chunk.sequence > self.sequence {
            return Err(DatabaseError::LobChunkMissing {
                lob_id,
                sequence: self.sequence,
            });
        }
        if chunk.sequence < self.sequence {
            return Err(DatabaseError::LobChunkOrder {
                lob_id,
                sequence: chunk.sequence,
            });
        }

        self.delivered += chunk.payload.len() as u64;
        if self.delivered > self.lob.length {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("LOB {} is longer than its recorded length", lob_id),
            });
        }
        self.sequence += 1;
        self.next_page = page.next_page_id;
        Ok(Some(chunk.payload))
    }
}

impl Read for LobReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.position == self.buffer.len() {
            match self.next_chunk().map_err(io::Error::other)? {
                Some(chunk) => {
                    self.buffer = chunk;
                    self.position = 0;
                }
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.buffer.len() - self.position);
        out[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}
