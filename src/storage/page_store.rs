//! The page file: fixed-size checksummed pages, a persistent free list and
//! transaction-scoped, log-protected writes.
//!
//! Writes never touch the file directly. A write appends the page's before
//! and after images to the transaction log and lands in the dirty cache; the
//! cache reaches the file only at a checkpoint, after the log is synced.
//! Dropping a store without [`PageStore::close`] therefore behaves like a
//! crash, and the next [`PageStore::open`] replays the log.
//!
//! Page 0 is never owned by a transaction. Id counters, allocation and the
//! free list change it under a short latch and are logged as bookkeeping
//! that is never undone: ids are not handed out twice, pages a transaction
//! allocated are released when it rolls back, and pages it frees only reach
//! the free list when it commits.

use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    storage::{
        config::{DatabaseConfig, log_file_path},
        header::FileHeader,
        wal::{LogRecord, PageImages, ReplayPlan, TransactionLog, plan_replay},
    },
    types::{
        PAGE_SIZE, PageId, TransactionId,
        error::DatabaseError,
        page::{Page, PageType},
    },
    utils::hash::{verify_page_checksum, write_page_checksum},
};

/// Exclusive short-term latches held by writers while they stage a page.
/// Readers of a latched page wait; readers of other pages do not.
#[derive(Default)]
struct PageLatches {
    held: Mutex<HashSet<PageId>>,
    released: Condvar,
}

impl PageLatches {
    fn acquire(&self, page_id: PageId) -> LatchGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(&page_id) {
            self.released.wait(&mut held);
        }
        held.insert(page_id);
        LatchGuard {
            latches: self,
            page_id,
        }
    }

    fn wait_unlatched(&self, page_id: PageId) {
        let mut held = self.held.lock();
        while held.contains(&page_id) {
            self.released.wait(&mut held);
        }
    }
}

struct LatchGuard<'a> {
    latches: &'a PageLatches,
    page_id: PageId,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latches.held.lock().remove(&self.page_id);
        self.latches.released.notify_all();
    }
}

#[derive(Default)]
struct TransactionState {
    /// Before-images in write order.
    undo: Vec<(PageId, Option<Vec<u8>>)>,
    allocated: Vec<PageId>,
    /// Released at commit.
    freed: Vec<PageId>,
    logged: bool,
}

struct StoreState {
    header: FileHeader,
    dirty: HashMap<PageId, Vec<u8>>,
    /// Pages physically present in the file.
    file_pages: u64,
    next_txn: TransactionId,
    transactions: HashMap<TransactionId, TransactionState>,
    owners: HashMap<PageId, TransactionId>,
}

pub struct PageStore {
    path: PathBuf,
    config: DatabaseConfig,
    file: Mutex<File>,
    log: Mutex<TransactionLog>,
    state: Mutex<StoreState>,
    latches: PageLatches,
    checkpoint_gate: RwLock<()>,
}

fn page_offset(page_id: PageId) -> u64 {
    page_id * PAGE_SIZE as u64
}

fn read_raw(file: &mut File, page_id: PageId) -> Result<Option<Vec<u8>>, DatabaseError> {
    let length = file.metadata()?.len();
    if page_offset(page_id) + PAGE_SIZE as u64 > length {
        return Ok(None);
    }
    let mut buffer = vec![0u8; PAGE_SIZE];
    file.seek(SeekFrom::Start(page_offset(page_id)))?;
    file.read_exact(&mut buffer)?;
    Ok(Some(buffer))
}

fn write_raw(file: &mut File, page_id: PageId, bytes: &[u8]) -> Result<(), DatabaseError> {
    file.seek(SeekFrom::Start(page_offset(page_id)))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Push `pages` onto the free list. Returns the images to install: one free
/// page per entry, then the header.
fn release_pages(header: &mut FileHeader, pages: &[PageId]) -> PageImages {
    let mut images = Vec::with_capacity(pages.len() + 1);
    for &page_id in pages {
        let mut page = Page::new(page_id, PageType::Free);
        page.next_page_id = header.freelist_head;
        images.push((page_id, page.to_bytes()));
        header.freelist_head = Some(page_id);
        header.freelist_length += 1;
    }
    header.change_counter += 1;
    images.push((0, header.to_bytes()));
    images
}

fn checksum_error(page_id: PageId, bytes: &[u8]) -> Result<(), DatabaseError> {
    verify_page_checksum(bytes).map_err(|(stored, computed)| DatabaseError::PageChecksum {
        page_id,
        stored,
        computed,
    })
}

impl PageStore {
    /// Open or create the page file at `path`, replaying its transaction log.
    pub fn open<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            info!(path = %path.display(), "creating database");
            file.write_all(&FileHeader::default().to_bytes())?;
            file.sync_all()?;
        } else {
            info!(path = %path.display(), "opening database");
        }

        let mut log = TransactionLog::open(log_file_path(&path))?;
        let records = log.read_all()?;
        let plan = plan_replay(&records);
        if !plan.is_empty() {
            Self::apply_replay(&mut file, &plan)?;
        }

        let header_bytes = read_raw(&mut file, 0)?.ok_or_else(|| DatabaseError::InvalidHeader {
            reason: "Header too short".to_string(),
        })?;
        let header = FileHeader::from_bytes(&header_bytes)?;

        let file_pages = file.metadata()?.len() / PAGE_SIZE as u64;
        if file_pages < header.page_count {
            return Err(DatabaseError::TruncatedFile {
                expected_pages: header.page_count,
                actual_pages: file_pages,
            });
        }
        if file_pages > header.page_count {
            // Pages past the header's count belong to nothing.
            file.set_len(header.page_count * PAGE_SIZE as u64)?;
            file.sync_all()?;
        }
        log.truncate_to_checkpoint(plan.next_txn)?;

        Ok(Self {
            path,
            config,
            file: Mutex::new(file),
            log: Mutex::new(log),
            state: Mutex::new(StoreState {
                file_pages: header.page_count,
                header,
                dirty: HashMap::new(),
                next_txn: plan.next_txn,
                transactions: HashMap::new(),
                owners: HashMap::new(),
            }),
            latches: PageLatches::default(),
            checkpoint_gate: RwLock::new(()),
        })
    }

    fn apply_replay(file: &mut File, plan: &ReplayPlan) -> Result<(), DatabaseError> {
        info!(
            winners = plan.winners,
            losers = plan.losers,
            undo = plan.undo.len(),
            redo = plan.redo.len(),
            "replaying transaction log"
        );
        for (page_id, before) in &plan.undo {
            // Without a before-image the page was new; it is released below.
            if let Some(bytes) = before {
                write_raw(file, *page_id, bytes)?;
            }
        }
        for (page_id, after) in &plan.redo {
            write_raw(file, *page_id, after)?;
        }
        if !plan.release.is_empty() {
            let bytes = read_raw(file, 0)?.ok_or_else(|| DatabaseError::InvalidHeader {
                reason: "Header too short".to_string(),
            })?;
            let mut header = FileHeader::from_bytes(&bytes)?;
            for (page_id, image) in release_pages(&mut header, &plan.release) {
                write_raw(file, page_id, &image)?;
            }
            info!(pages = plan.release.len(), "released pages of unfinished transactions");
        }
        file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn header(&self) -> FileHeader {
        self.state.lock().header.clone()
    }

    pub fn page_count(&self) -> u64 {
        self.state.lock().header.page_count
    }

    pub fn dirty_pages(&self) -> usize {
        self.state.lock().dirty.len()
    }

    pub fn active_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    pub fn is_active(&self, txn: TransactionId) -> bool {
        self.state.lock().transactions.contains_key(&txn)
    }

    pub fn begin(&self) -> TransactionId {
        let mut state = self.state.lock();
        let txn = state.next_txn;
        state.next_txn += 1;
        state.transactions.insert(txn, TransactionState::default());
        debug!(txn, "transaction started");
        txn
    }

    /// Read a page, verifying its checksum.
    pub fn read(&self, page_id: PageId) -> Result<Vec<u8>, DatabaseError> {
        self.latches.wait_unlatched(page_id);
        let file_pages = {
            let state = self.state.lock();
            if page_id >= state.header.page_count {
                return Err(DatabaseError::PageOutOfRange {
                    page_id,
                    page_count: state.header.page_count,
                });
            }
            if let Some(bytes) = state.dirty.get(&page_id) {
                return Ok(bytes.clone());
            }
            state.file_pages
        };

        let bytes = read_raw(&mut self.file.lock(), page_id)?.ok_or(
            DatabaseError::TruncatedFile {
                expected_pages: page_id + 1,
                actual_pages: file_pages,
            },
        )?;
        checksum_error(page_id, &bytes)?;
        Ok(bytes)
    }

    /// Read and decode a page, rejecting one stored at the wrong position.
    pub fn read_page(&self, page_id: PageId) -> Result<Page, DatabaseError> {
        let page = Page::from_bytes(&self.read(page_id)?)?;
        if page.page_id != page_id {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("page claims id {}", page.page_id),
            });
        }
        Ok(page)
    }

    /// Stage a new image of `page_id` on behalf of `txn`. The checksum is
    /// recomputed; the change is logged before it becomes visible.
    pub fn write(
        &self,
        txn: TransactionId,
        page_id: PageId,
        bytes: Vec<u8>,
    ) -> Result<(), DatabaseError> {
        if page_id == 0 {
            return Err(DatabaseError::InvalidHeader {
                reason: "page 0 is only written by store bookkeeping".to_string(),
            });
        }
        let _gate = self.checkpoint_gate.read();
        let _latch = self.latches.acquire(page_id);
        let mut state = self.state.lock();
        if page_id >= state.header.page_count {
            return Err(DatabaseError::PageOutOfRange {
                page_id,
                page_count: state.header.page_count,
            });
        }
        self.stage_write(&mut state, txn, page_id, bytes)
    }

    pub fn write_page(&self, txn: TransactionId, page: &Page) -> Result<(), DatabaseError> {
        self.write(txn, page.page_id, page.to_bytes())
    }

    /// Take a page off the free list, or extend the file by one page. The
    /// page belongs to `txn` and is released again if `txn` rolls back.
    pub fn allocate(&self, txn: TransactionId) -> Result<PageId, DatabaseError> {
        let _gate = self.checkpoint_gate.read();
        let _latch = self.latches.acquire(0);
        let mut state = self.state.lock();
        Self::check_active(&state, txn)?;

        let mut header = state.header.clone();
        let page_id = self.pop_free_page(&state, &mut header)?;
        header.change_counter += 1;
        self.log_system(&mut state, txn, Some(page_id), vec![(0, header.to_bytes())])?;
        state.header = header;
        state.owners.insert(page_id, txn);
        if let Some(txn_state) = state.transactions.get_mut(&txn) {
            txn_state.allocated.push(page_id);
        }
        debug!(txn, page_id, "page allocated");
        Ok(page_id)
    }

    /// Allocate a page whose first image is store structure rather than
    /// `txn`'s data, such as a new link in a chain rooted in the header.
    /// `init` builds the image and may update the header; the page stays
    /// allocated even if `txn` rolls back.
    pub fn allocate_persistent(
        &self,
        txn: TransactionId,
        init: impl FnOnce(PageId, &mut FileHeader) -> Page,
    ) -> Result<PageId, DatabaseError> {
        let _gate = self.checkpoint_gate.read();
        let _latch = self.latches.acquire(0);
        let mut state = self.state.lock();
        Self::check_active(&state, txn)?;

        let mut header = state.header.clone();
        let page_id = self.pop_free_page(&state, &mut header)?;
        let page = init(page_id, &mut header);
        if page.page_id != page_id {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("initial image claims id {}", page.page_id),
            });
        }
        header.change_counter += 1;
        let images = vec![(page_id, page.to_bytes()), (0, header.to_bytes())];
        self.log_system(&mut state, txn, None, images)?;
        state.header = header;
        debug!(txn, page_id, "persistent page allocated");
        Ok(page_id)
    }

    fn pop_free_page(
        &self,
        state: &StoreState,
        header: &mut FileHeader,
    ) -> Result<PageId, DatabaseError> {
        match header.freelist_head {
            Some(head) => {
                let page = Page::from_bytes(&self.verified_image(state, head)?)?;
                if page.page_type != PageType::Free {
                    return Err(DatabaseError::CorruptedPage {
                        page_id: head,
                        reason: format!("free list head has type {:?}", page.page_type),
                    });
                }
                header.freelist_head = page.next_page_id;
                header.freelist_length = header.freelist_length.saturating_sub(1);
                Ok(head)
            }
            None => {
                header.page_count += 1;
                Ok(header.page_count - 1)
            }
        }
    }

    /// Return a page to the free list once `txn` commits. Until then the
    /// page keeps its content and stays owned by `txn`.
    pub fn free(&self, txn: TransactionId, page_id: PageId) -> Result<(), DatabaseError> {
        if page_id == 0 {
            return Err(DatabaseError::InvalidHeader {
                reason: "the header page cannot be freed".to_string(),
            });
        }
        let _gate = self.checkpoint_gate.read();
        let mut state = self.state.lock();
        Self::check_writable(&state, txn, page_id)?;
        if page_id >= state.header.page_count {
            return Err(DatabaseError::PageOutOfRange {
                page_id,
                page_count: state.header.page_count,
            });
        }
        state.owners.insert(page_id, txn);
        if let Some(txn_state) = state.transactions.get_mut(&txn) {
            if !txn_state.freed.contains(&page_id) {
                txn_state.freed.push(page_id);
            }
        }
        debug!(txn, page_id, "page freed at commit");
        Ok(())
    }

    /// Update header counters on behalf of `txn`. The change is not undone
    /// by a rollback, so an id taken here is never handed out again.
    pub fn update_header<T>(
        &self,
        txn: TransactionId,
        update: impl FnOnce(&mut FileHeader) -> T,
    ) -> Result<T, DatabaseError> {
        let _gate = self.checkpoint_gate.read();
        let _latch = self.latches.acquire(0);
        let mut state = self.state.lock();
        Self::check_active(&state, txn)?;
        let mut header = state.header.clone();
        let result = update(&mut header);
        header.change_counter += 1;
        self.log_system(&mut state, txn, None, vec![(0, header.to_bytes())])?;
        state.header = header;
        Ok(result)
    }

    pub fn commit(&self, txn: TransactionId) -> Result<(), DatabaseError> {
        let should_checkpoint = {
            let _gate = self.checkpoint_gate.read();
            let _latch = self.latches.acquire(0);
            let mut state = self.state.lock();
            let (logged, freed) = match state.transactions.get(&txn) {
                Some(txn_state) => (txn_state.logged, txn_state.freed.clone()),
                None => return Err(DatabaseError::TransactionNotActive { txn }),
            };
            let mut header = state.header.clone();
            let released = if freed.is_empty() {
                Vec::new()
            } else {
                release_pages(&mut header, &freed)
            };

            let log_size = {
                let mut log = self.log.lock();
                if logged || !released.is_empty() {
                    log.append(&LogRecord::Commit {
                        txn,
                        released: released.clone(),
                    })?;
                    if self.config.sync_on_commit {
                        log.sync()?;
                    }
                }
                log.size()
            };
            for (page_id, image) in released {
                state.dirty.insert(page_id, image);
            }
            state.header = header;
            state.transactions.remove(&txn);
            state.owners.retain(|_, owner| *owner != txn);
            debug!(txn, freed = freed.len(), "transaction committed");

            state.transactions.is_empty()
                && (state.dirty.len() > self.config.cache_dirty_limit
                    || log_size > self.config.checkpoint_log_bytes)
        };

        if should_checkpoint {
            match self.checkpoint() {
                Err(DatabaseError::TransactionsActive { .. }) => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// Restore every page `txn` touched to its before-image and release the
    /// pages it allocated.
    pub fn rollback(&self, txn: TransactionId) -> Result<(), DatabaseError> {
        let _gate = self.checkpoint_gate.read();
        let _latch = self.latches.acquire(0);
        let mut state = self.state.lock();
        let txn_state = state
            .transactions
            .remove(&txn)
            .ok_or(DatabaseError::TransactionNotActive { txn })?;

        let mut header = state.header.clone();
        let released = if txn_state.allocated.is_empty() {
            Vec::new()
        } else {
            release_pages(&mut header, &txn_state.allocated)
        };
        if txn_state.logged {
            self.log.lock().append(&LogRecord::Abort {
                txn,
                released: released.clone(),
            })?;
        }

        let touched = txn_state.undo.len();
        for (page_id, before) in txn_state.undo.into_iter().rev() {
            match before {
                Some(bytes) => {
                    state.dirty.insert(page_id, bytes);
                }
                None => {
                    state.dirty.remove(&page_id);
                }
            }
        }
        for (page_id, image) in released {
            state.dirty.insert(page_id, image);
        }
        state.header = header;
        state.owners.retain(|_, owner| *owner != txn);
        debug!(
            txn,
            pages = touched,
            released = txn_state.allocated.len(),
            "transaction rolled back"
        );
        Ok(())
    }

    /// Flush every dirty page, then truncate the log behind a checkpoint
    /// marker. New writes wait until the flush is done.
    pub fn checkpoint(&self) -> Result<(), DatabaseError> {
        let _gate = self.checkpoint_gate.write();
        let mut state = self.state.lock();
        if !state.transactions.is_empty() {
            return Err(DatabaseError::TransactionsActive {
                count: state.transactions.len(),
            });
        }

        let mut log = self.log.lock();
        log.sync()?;
        {
            let mut file = self.file.lock();
            let mut pages: Vec<PageId> = state.dirty.keys().copied().collect();
            pages.sort_unstable();
            for page_id in &pages {
                if let Some(bytes) = state.dirty.get(page_id) {
                    write_raw(&mut file, *page_id, bytes)?;
                }
            }
            let wanted = state.header.page_count * PAGE_SIZE as u64;
            if file.metadata()?.len() < wanted {
                file.set_len(wanted)?;
            }
            file.sync_all()?;
        }

        let flushed = state.dirty.len();
        state.dirty.clear();
        state.file_pages = state.file_pages.max(state.header.page_count);
        log.truncate_to_checkpoint(state.next_txn)?;
        info!(flushed, pages = state.header.page_count, "checkpoint complete");
        Ok(())
    }

    /// Checkpoint and release the file.
    pub fn close(self) -> Result<(), DatabaseError> {
        self.checkpoint()
    }

    fn check_active(state: &StoreState, txn: TransactionId) -> Result<(), DatabaseError> {
        if state.transactions.contains_key(&txn) {
            Ok(())
        } else {
            Err(DatabaseError::TransactionNotActive { txn })
        }
    }

    fn check_writable(
        state: &StoreState,
        txn: TransactionId,
        page_id: PageId,
    ) -> Result<(), DatabaseError> {
        Self::check_active(state, txn)?;
        match state.owners.get(&page_id) {
            Some(&owner) if owner != txn => Err(DatabaseError::PageLocked { page_id, owner }),
            _ => Ok(()),
        }
    }

    // Caller holds the header latch and the state lock.
    fn log_system(
        &self,
        state: &mut StoreState,
        txn: TransactionId,
        allocated: Option<PageId>,
        images: PageImages,
    ) -> Result<(), DatabaseError> {
        self.log.lock().append(&LogRecord::System {
            txn,
            allocated,
            images: images.clone(),
        })?;
        for (page_id, image) in images {
            state.dirty.insert(page_id, image);
        }
        if let Some(txn_state) = state.transactions.get_mut(&txn) {
            txn_state.logged = true;
        }
        Ok(())
    }

    // Caller holds the page latch and the state lock.
    fn stage_write(
        &self,
        state: &mut StoreState,
        txn: TransactionId,
        page_id: PageId,
        mut bytes: Vec<u8>,
    ) -> Result<(), DatabaseError> {
        if bytes.len() != PAGE_SIZE {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("expected {} bytes, got {}", PAGE_SIZE, bytes.len()),
            });
        }
        Self::check_writable(state, txn, page_id)?;
        write_page_checksum(&mut bytes);

        let before = self.current_image(state, page_id)?;
        self.log.lock().append(&LogRecord::PageWrite {
            txn,
            page_id,
            before: before.clone(),
            after: bytes.clone(),
        })?;

        state.owners.insert(page_id, txn);
        if let Some(txn_state) = state.transactions.get_mut(&txn) {
            txn_state.undo.push((page_id, before));
            txn_state.logged = true;
        }
        state.dirty.insert(page_id, bytes);
        debug!(txn, page_id, "page staged");
        Ok(())
    }

    // Whatever is currently stored for the page, unverified.
    fn current_image(
        &self,
        state: &StoreState,
        page_id: PageId,
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        if let Some(bytes) = state.dirty.get(&page_id) {
            return Ok(Some(bytes.clone()));
        }
        if page_id >= state.file_pages {
            return Ok(None);
        }
        read_raw(&mut self.file.lock(), page_id)
    }

    fn verified_image(&self, state: &StoreState, page_id: PageId) -> Result<Vec<u8>, DatabaseError> {
        let bytes = self
            .current_image(state, page_id)?
            .ok_or(DatabaseError::TruncatedFile {
                expected_pages: page_id + 1,
                actual_pages: state.file_pages,
            })?;
        checksum_error(page_id, &bytes)?;
        Ok(bytes)
    }
}
