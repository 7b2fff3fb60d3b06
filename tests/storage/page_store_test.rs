use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use lumbung::{
    storage::{config::DatabaseConfig, page_store::PageStore},
    types::{
        PAGE_SIZE, PageId,
        error::DatabaseError,
        page::{Page, PageType},
    },
};
use parking_lot::Mutex;
use tempfile::TempDir;

fn store_path(dir: &TempDir) -> PathBuf {
    dir.path().join("pages.lumbung.db")
}

fn open(dir: &TempDir) -> PageStore {
    PageStore::open(store_path(dir), DatabaseConfig::default()).unwrap()
}

fn data_page(page_id: PageId, payload: &[u8]) -> Page {
    let mut page = Page::new(page_id, PageType::Data);
    page.insert_cell(payload).unwrap();
    page
}

fn cell(store: &PageStore, page_id: PageId) -> Vec<u8> {
    store.read_page(page_id).unwrap().get_cell(0).unwrap().to_vec()
}

// Allocate and fill one page in its own committed transaction.
fn committed_page(store: &PageStore, payload: &[u8]) -> PageId {
    let txn = store.begin();
    let page_id = store.allocate(txn).unwrap();
    store.write_page(txn, &data_page(page_id, payload)).unwrap();
    store.commit(txn).unwrap();
    page_id
}

#[test]
fn test_new_file_has_only_header() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    assert_eq!(store.page_count(), 1);
    assert_eq!(store.header().freelist_head, None);
    assert_eq!(
        std::fs::metadata(store_path(&dir)).unwrap().len(),
        PAGE_SIZE as u64
    );
}

#[test]
fn test_committed_pages_survive_close() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let first = committed_page(&store, b"first");
    let second = committed_page(&store, b"second");
    assert_eq!((first, second), (1, 2));
    store.close().unwrap();

    let store = open(&dir);
    assert_eq!(store.page_count(), 3);
    assert_eq!(cell(&store, first), b"first");
    assert_eq!(cell(&store, second), b"second");
}

#[test]
fn test_writes_stay_cached_until_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    committed_page(&store, b"cached");
    assert!(store.dirty_pages() > 0);
    assert_eq!(
        std::fs::metadata(store_path(&dir)).unwrap().len(),
        PAGE_SIZE as u64
    );

    store.checkpoint().unwrap();
    assert_eq!(store.dirty_pages(), 0);
    assert_eq!(
        std::fs::metadata(store_path(&dir)).unwrap().len(),
        2 * PAGE_SIZE as u64
    );
}

#[test]
fn test_crash_replays_committed_work() {
    let dir = tempfile::tempdir().unwrap();
    let page_id = {
        let store = open(&dir);
        committed_page(&store, b"durable")
        // dropped without a checkpoint
    };

    let store = open(&dir);
    assert_eq!(store.page_count(), 2);
    assert_eq!(cell(&store, page_id), b"durable");
}

#[test]
fn test_crash_undoes_uncommitted_work() {
    let dir = tempfile::tempdir().unwrap();
    let (kept, lost) = {
        let store = open(&dir);
        let kept = committed_page(&store, b"before");
        store.checkpoint().unwrap();

        let txn = store.begin();
        store.write_page(txn, &data_page(kept, b"overwritten")).unwrap();
        let lost = store.allocate(txn).unwrap();
        store.write_page(txn, &data_page(lost, b"lost")).unwrap();
        (kept, lost)
    };

    let store = open(&dir);
    assert_eq!(cell(&store, kept), b"before");
    // The page the loser allocated is released, not leaked.
    assert_eq!(store.page_count(), 3);
    assert_eq!(store.read_page(lost).unwrap().page_type, PageType::Free);
    assert_eq!(store.header().freelist_head, Some(lost));
    assert_eq!(store.header().freelist_length, 1);
    assert_eq!(
        std::fs::metadata(store_path(&dir)).unwrap().len(),
        3 * PAGE_SIZE as u64
    );

    let txn = store.begin();
    assert_eq!(store.allocate(txn).unwrap(), lost);
    store.rollback(txn).unwrap();
}

#[test]
fn test_crash_with_winner_and_loser() {
    let dir = tempfile::tempdir().unwrap();
    let (winner, loser) = {
        let store = open(&dir);
        let winner = committed_page(&store, b"winner");
        let txn = store.begin();
        let loser = store.allocate(txn).unwrap();
        store.write_page(txn, &data_page(loser, b"loser")).unwrap();
        (winner, loser)
    };

    let store = open(&dir);
    assert_eq!(cell(&store, winner), b"winner");
    assert_eq!(store.read_page(loser).unwrap().page_type, PageType::Free);

    // Transaction ids keep increasing across the restart.
    let next = store.begin();
    assert!(next > 2);
}

#[test]
fn test_rollback_restores_before_images() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let page_id = committed_page(&store, b"original");

    let txn = store.begin();
    store.write_page(txn, &data_page(page_id, b"changed")).unwrap();
    let extra = store.allocate(txn).unwrap();
    assert_eq!(store.page_count(), 3);
    store.write_page(txn, &data_page(extra, b"extra")).unwrap();
    store.rollback(txn).unwrap();

    assert_eq!(cell(&store, page_id), b"original");
    assert_eq!(store.page_count(), 3);
    assert_eq!(store.header().freelist_head, Some(extra));
    assert_eq!(store.read_page(extra).unwrap().page_type, PageType::Free);
    assert_eq!(store.active_transactions(), 0);
    assert!(matches!(
        store.commit(txn),
        Err(DatabaseError::TransactionNotActive { .. })
    ));
}

#[test]
fn test_page_ownership_is_no_wait() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let page_id = committed_page(&store, b"shared");

    let first = store.begin();
    let second = store.begin();
    store.write_page(first, &data_page(page_id, b"one")).unwrap();
    match store.write_page(second, &data_page(page_id, b"two")) {
        Err(DatabaseError::PageLocked { page_id: locked, owner }) => {
            assert_eq!(locked, page_id);
            assert_eq!(owner, first);
        }
        other => panic!("expected PageLocked, got {:?}", other),
    }

    store.commit(first).unwrap();
    store.write_page(second, &data_page(page_id, b"two")).unwrap();
    store.commit(second).unwrap();
    assert_eq!(cell(&store, page_id), b"two");
}

#[test]
fn test_checkpoint_requires_quiescence() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let txn = store.begin();
    assert!(matches!(
        store.checkpoint(),
        Err(DatabaseError::TransactionsActive { count: 1 })
    ));
    store.commit(txn).unwrap();
    store.checkpoint().unwrap();
}

#[test]
fn test_free_list_reuses_pages() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let first = committed_page(&store, b"a");
    let second = committed_page(&store, b"b");

    let txn = store.begin();
    store.free(txn, first).unwrap();
    store.free(txn, second).unwrap();
    store.commit(txn).unwrap();
    let header = store.header();
    assert_eq!(header.freelist_head, Some(second));
    assert_eq!(header.freelist_length, 2);
    assert_eq!(store.read_page(second).unwrap().page_type, PageType::Free);
    store.close().unwrap();

    let store = open(&dir);
    assert_eq!(store.header().freelist_length, 2);
    let txn = store.begin();
    assert_eq!(store.allocate(txn).unwrap(), second);
    assert_eq!(store.allocate(txn).unwrap(), first);
    assert_eq!(store.allocate(txn).unwrap(), 3);
    store.commit(txn).unwrap();
    assert_eq!(store.header().freelist_length, 0);
}

#[test]
fn test_header_page_is_protected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let txn = store.begin();
    assert!(matches!(
        store.write(txn, 0, vec![0u8; PAGE_SIZE]),
        Err(DatabaseError::InvalidHeader { .. })
    ));
    assert!(store.free(txn, 0).is_err());
    assert!(matches!(
        store.write(txn, 5, vec![0u8; PAGE_SIZE]),
        Err(DatabaseError::PageOutOfRange { page_id: 5, .. })
    ));
    store.rollback(txn).unwrap();
}

fn take_lob_id(store: &PageStore, txn: u64) -> u64 {
    store
        .update_header(txn, |header| {
            let id = header.next_lob_id;
            header.next_lob_id += 1;
            id
        })
        .unwrap()
}

#[test]
fn test_header_counters_are_never_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(&dir);
        let txn = store.begin();
        assert_eq!(take_lob_id(&store, txn), 1);
        store.rollback(txn).unwrap();
        assert_eq!(store.header().next_lob_id, 2);

        let txn = store.begin();
        assert_eq!(take_lob_id(&store, txn), 2);
        // crash with the transaction open
    }

    let store = open(&dir);
    assert_eq!(store.header().next_lob_id, 3);
}

#[test]
fn test_transactions_share_the_header() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let shared = committed_page(&store, b"shared");

    let first = store.begin();
    let second = store.begin();
    let one = store.allocate(first).unwrap();
    let two = store.allocate(second).unwrap();
    assert_ne!(one, two);
    assert_eq!(take_lob_id(&store, second), 1);
    assert_eq!(take_lob_id(&store, first), 2);
    store.write_page(first, &data_page(one, b"one")).unwrap();
    store.write_page(second, &data_page(two, b"two")).unwrap();

    // Only real pages conflict.
    store.write_page(first, &data_page(shared, b"first")).unwrap();
    assert!(matches!(
        store.write_page(second, &data_page(shared, b"second")),
        Err(DatabaseError::PageLocked { owner, .. }) if owner == first
    ));
    store.free(second, two).unwrap();
    assert!(matches!(
        store.free(first, two),
        Err(DatabaseError::PageLocked { .. })
    ));

    store.rollback(first).unwrap();
    store.commit(second).unwrap();
    assert_eq!(cell(&store, shared), b"shared");
    let header = store.header();
    assert_eq!(header.next_lob_id, 3);
    assert_eq!(header.freelist_length, 2);
    store.close().unwrap();

    let store = open(&dir);
    let mut free = Vec::new();
    let mut next = store.header().freelist_head;
    while let Some(page_id) = next {
        free.push(page_id);
        next = store.read_page(page_id).unwrap().next_page_id;
    }
    free.sort_unstable();
    assert_eq!(free, vec![one, two]);
}

#[test]
fn test_freed_pages_stay_readable_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let page_id = committed_page(&store, b"keep me");

    let txn = store.begin();
    store.free(txn, page_id).unwrap();
    assert_eq!(cell(&store, page_id), b"keep me");
    let other = store.allocate(txn).unwrap();
    assert_ne!(other, page_id);
    store.rollback(txn).unwrap();

    assert_eq!(cell(&store, page_id), b"keep me");
    assert_eq!(store.header().freelist_head, Some(other));
}

#[test]
fn test_checksum_mismatch_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let page_id = {
        let store = open(&dir);
        let page_id = committed_page(&store, b"fragile");
        store.close().unwrap();
        page_id
    };

    let mut file = OpenOptions::new()
        .write(true)
        .open(store_path(&dir))
        .unwrap();
    file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64 + 200))
        .unwrap();
    file.write_all(&[0xAB]).unwrap();
    drop(file);

    let store = open(&dir);
    assert!(matches!(
        store.read(page_id),
        Err(DatabaseError::PageChecksum { page_id: 1, .. })
    ));
}

#[test]
fn test_truncated_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(&dir);
        committed_page(&store, b"a");
        committed_page(&store, b"b");
        store.close().unwrap();
    }
    let file = OpenOptions::new()
        .write(true)
        .open(store_path(&dir))
        .unwrap();
    file.set_len(2 * PAGE_SIZE as u64).unwrap();
    drop(file);

    assert!(matches!(
        PageStore::open(store_path(&dir), DatabaseConfig::default()),
        Err(DatabaseError::TruncatedFile {
            expected_pages: 3,
            actual_pages: 2
        })
    ));
}

#[test]
fn test_threaded_writers_readers_and_checkpoints() {
    const WRITERS: usize = 4;
    const ROUNDS: usize = 40;

    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let committed: Mutex<Vec<(PageId, Vec<u8>)>> = Mutex::new(Vec::new());
    let writers_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let store = &store;
                let committed = &committed;
                scope.spawn(move || {
                    for round in 0..ROUNDS {
                        let payload = format!("writer {} round {}", writer, round).into_bytes();
                        let txn = store.begin();
                        let page_id = store.allocate(txn).unwrap();
                        store.write_page(txn, &data_page(page_id, &payload)).unwrap();
                        if round % 5 == 4 {
                            store.rollback(txn).unwrap();
                            continue;
                        }
                        store.commit(txn).unwrap();
                        committed.lock().push((page_id, payload));
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let store = &store;
                let committed = &committed;
                let writers_done = &writers_done;
                scope.spawn(move || {
                    let mut checked = 0usize;
                    while !writers_done.load(Ordering::Acquire) {
                        let sample = {
                            let committed = committed.lock();
                            if committed.is_empty() {
                                None
                            } else {
                                Some(committed[fastrand::usize(..committed.len())].clone())
                            }
                        };
                        if let Some((page_id, payload)) = sample {
                            assert_eq!(cell(store, page_id), payload);
                            checked += 1;
                        }
                        thread::yield_now();
                    }
                    checked
                })
            })
            .collect();

        let checkpointer = {
            let store = &store;
            let writers_done = &writers_done;
            scope.spawn(move || {
                let mut completed = 0usize;
                while !writers_done.load(Ordering::Acquire) {
                    match store.checkpoint() {
                        Ok(()) => completed += 1,
                        Err(DatabaseError::TransactionsActive { .. }) => {}
                        Err(err) => panic!("checkpoint failed: {:?}", err),
                    }
                    thread::yield_now();
                }
                completed
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        writers_done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
        checkpointer.join().unwrap();
    });

    let committed = committed.into_inner();
    assert_eq!(committed.len(), WRITERS * ROUNDS * 4 / 5);
    assert_eq!(store.active_transactions(), 0);
    for (page_id, payload) in &committed {
        assert_eq!(&cell(&store, *page_id), payload);
    }
    store.close().unwrap();

    let store = open(&dir);
    for (page_id, payload) in &committed {
        assert_eq!(&cell(&store, *page_id), payload);
    }
    // Every page is either committed data or on the free list.
    let header = store.header();
    assert_eq!(
        header.page_count - 1,
        committed.len() as u64 + header.freelist_length
    );
}
