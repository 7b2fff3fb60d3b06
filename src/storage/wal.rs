//! The redo/undo transaction log.
//!
//! Every page mutation is appended as a full before/after image before the
//! page store accepts it. A transaction becomes a winner once its `Commit`
//! frame is in the log; anything else found after the last checkpoint is a
//! loser and gets undone on startup.
//!
//! Header and free-list bookkeeping is shared by all transactions, so it is
//! logged as plain after-images that are always redone and never undone.

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    types::{PageId, TransactionId, error::DatabaseError},
    utils::hash::calculate_frame_checksum,
};

const FRAME_HEADER_SIZE: usize = 8; // len(4) + crc(4)

/// Full page images, written in order.
pub type PageImages = Vec<(PageId, Vec<u8>)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A page mutation. `before` is absent when the page did not exist yet.
    PageWrite {
        txn: TransactionId,
        page_id: PageId,
        before: Option<Vec<u8>>,
        after: Vec<u8>,
    },
    /// Bookkeeping done for `txn` outside its undo scope. `allocated` is a
    /// page handed to `txn`; it goes back on the free list if `txn` never
    /// reaches `Commit` or `Abort`.
    System {
        txn: TransactionId,
        allocated: Option<PageId>,
        images: PageImages,
    },
    /// `released` puts the pages the transaction freed on the free list.
    Commit {
        txn: TransactionId,
        released: PageImages,
    },
    /// `released` puts the pages the transaction allocated on the free list.
    Abort {
        txn: TransactionId,
        released: PageImages,
    },
    /// Everything before this marker is reflected in the page file.
    Checkpoint {
        next_txn: TransactionId,
    },
}

impl LogRecord {
    pub fn commit(txn: TransactionId) -> Self {
        LogRecord::Commit {
            txn,
            released: Vec::new(),
        }
    }

    pub fn abort(txn: TransactionId) -> Self {
        LogRecord::Abort {
            txn,
            released: Vec::new(),
        }
    }

    fn txn(&self) -> Option<TransactionId> {
        match self {
            LogRecord::PageWrite { txn, .. }
            | LogRecord::System { txn, .. }
            | LogRecord::Commit { txn, .. }
            | LogRecord::Abort { txn, .. } => Some(*txn),
            LogRecord::Checkpoint { .. } => None,
        }
    }
}

/// What startup replay has to do, in application order.
#[derive(Debug, Default, PartialEq)]
pub struct ReplayPlan {
    /// Before-images of loser writes, newest first.
    pub undo: Vec<(PageId, Option<Vec<u8>>)>,
    /// After-images of winner writes and of all bookkeeping, oldest first.
    pub redo: PageImages,
    /// Pages allocated by transactions that never finished.
    pub release: Vec<PageId>,
    pub next_txn: TransactionId,
    pub winners: usize,
    pub losers: usize,
}

impl ReplayPlan {
    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty() && self.release.is_empty()
    }
}

/// Build the replay plan from the records following the last checkpoint.
pub fn plan_replay(records: &[LogRecord]) -> ReplayPlan {
    let checkpoint = records
        .iter()
        .rposition(|record| matches!(record, LogRecord::Checkpoint { .. }));
    let mut next_txn = match checkpoint.map(|index| &records[index]) {
        Some(LogRecord::Checkpoint { next_txn }) => *next_txn,
        _ => 1,
    };
    let records = &records[checkpoint.map_or(0, |index| index + 1)..];

    let mut committed = HashSet::new();
    let mut finished = HashSet::new();
    for record in records {
        match record {
            LogRecord::Commit { txn, .. } => {
                committed.insert(*txn);
                finished.insert(*txn);
            }
            LogRecord::Abort { txn, .. } => {
                finished.insert(*txn);
            }
            _ => {}
        }
    }

    let mut plan = ReplayPlan::default();
    let mut losers = HashSet::new();
    let mut winners = HashSet::new();
    for record in records {
        if let Some(txn) = record.txn() {
            next_txn = next_txn.max(txn + 1);
            if committed.contains(&txn) {
                winners.insert(txn);
            } else {
                losers.insert(txn);
            }
        }
        match record {
            LogRecord::PageWrite {
                txn,
                page_id,
                before,
                after,
            } => {
                if committed.contains(txn) {
                    plan.redo.push((*page_id, after.clone()));
                } else {
                    plan.undo.push((*page_id, before.clone()));
                }
            }
            LogRecord::System {
                txn,
                allocated,
                images,
            } => {
                plan.redo.extend(images.iter().cloned());
                if let Some(page_id) = allocated {
                    if !finished.contains(txn) {
                        plan.release.push(*page_id);
                    }
                }
            }
            LogRecord::Commit { released, .. } | LogRecord::Abort { released, .. } => {
                plan.redo.extend(released.iter().cloned());
            }
            LogRecord::Checkpoint { .. } => {}
        }
    }
    plan.undo.reverse();
    plan.next_txn = next_txn;
    plan.winners = winners.len();
    plan.losers = losers.len();
    plan
}

pub struct TransactionLog {
    path: PathBuf,
    file: File,
    size: u64,
}

impl TransactionLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self { path, file, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append one framed record. Durability comes from [`TransactionLog::sync`].
    pub fn append(&mut self, record: &LogRecord) -> Result<u64, DatabaseError> {
        let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        let length = payload.len() as u32;
        let checksum = calculate_frame_checksum(length, &payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&payload);

        let offset = self.size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<(), DatabaseError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every intact record. A short or corrupt trailing frame is a torn
    /// write and ends the scan.
    pub fn read_all(&mut self) -> Result<Vec<LogRecord>, DatabaseError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        let mut records = Vec::new();
        let mut consumed = 0u64;

        loop {
            let mut frame_header = [0u8; FRAME_HEADER_SIZE];
            match reader.read_exact(&mut frame_header) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let length = u32::from_le_bytes([
                frame_header[0],
                frame_header[1],
                frame_header[2],
                frame_header[3],
            ]);
            let checksum = u32::from_le_bytes([
                frame_header[4],
                frame_header[5],
                frame_header[6],
                frame_header[7],
            ]);
            if consumed + FRAME_HEADER_SIZE as u64 + length as u64 > self.size {
                tracing::warn!(offset = consumed, "torn frame at end of log");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            reader.read_exact(&mut payload)?;
            if calculate_frame_checksum(length, &payload) != checksum {
                tracing::warn!(offset = consumed, "log frame checksum mismatch, stopping");
                break;
            }
            let (record, _) = bincode::serde::decode_from_slice::<LogRecord, _>(
                &payload,
                bincode::config::standard(),
            )?;
            records.push(record);
            consumed += FRAME_HEADER_SIZE as u64 + length as u64;
        }
        drop(reader);

        // Drop any torn tail so later appends follow the last good frame.
        if consumed < self.size {
            self.file.set_len(consumed)?;
            self.size = consumed;
        }
        Ok(records)
    }

    /// Discard everything logged so far and start over with a checkpoint marker.
    pub fn truncate_to_checkpoint(&mut self, next_txn: TransactionId) -> Result<(), DatabaseError> {
        self.file.set_len(0)?;
        self.size = 0;
        self.append(&LogRecord::Checkpoint { next_txn })?;
        self.sync()
    }
}
