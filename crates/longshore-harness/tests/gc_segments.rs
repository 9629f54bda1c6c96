//! Garbage collection of journal segments.

use longshore::{MessageRecord, MessageStore, QueueRecord, StoreConfig};
use longshore_harness::{dequeue_uow, enqueue_uow, segment_files};
use tempfile::tempdir;

fn small_log_config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig::new(dir).with_log_size(4096)
}

#[test]
fn dequeue_releases_the_first_segment() {
    let dir = tempdir().unwrap();
    let store = MessageStore::start(small_log_config(dir.path())).unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();

    // Enough ~900-byte messages to roll the journal several times.
    for seq in 0..8u64 {
        store
            .store_blocking(vec![enqueue_uow(
                1,
                seq,
                MessageRecord::new(200 + seq, vec![seq as u8; 900]),
            )])
            .unwrap();
    }
    assert!(
        segment_files(dir.path()).len() > 1,
        "the journal must have rotated"
    );
    let first_segment = segment_files(dir.path())[0].clone();

    for seq in 0..8u64 {
        store
            .store_blocking(vec![dequeue_uow(1, seq, 200 + seq)])
            .unwrap();
    }
    assert!(store.ledger_counts().is_empty());

    store.snapshot_index().unwrap();
    store.gc().unwrap();

    let remaining = segment_files(dir.path());
    assert!(
        !remaining.contains(&first_segment),
        "the drained first segment must be deleted, still present in {remaining:?}"
    );
    assert!(!remaining.is_empty(), "the tail segment must remain");

    store.stop().unwrap();
}

#[test]
fn gc_keeps_live_segments_and_the_tail() {
    let dir = tempdir().unwrap();
    let store = MessageStore::start(small_log_config(dir.path())).unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();

    for seq in 0..8u64 {
        store
            .store_blocking(vec![enqueue_uow(
                1,
                seq,
                MessageRecord::new(300 + seq, vec![seq as u8; 900]),
            )])
            .unwrap();
    }
    let before = segment_files(dir.path());
    assert!(before.len() > 1);

    // Every entry is live: nothing may be collected even after a snapshot.
    store.snapshot_index().unwrap();
    store.gc().unwrap();
    assert_eq!(segment_files(dir.path()), before);

    // Drain everything: the tail segment still survives gc, since the
    // appender owns it.
    for seq in 0..8u64 {
        store
            .store_blocking(vec![dequeue_uow(1, seq, 300 + seq)])
            .unwrap();
    }
    store.snapshot_index().unwrap();
    store.gc().unwrap();
    let remaining = segment_files(dir.path());
    assert!(!remaining.is_empty(), "the appender's segment must survive");

    store.stop().unwrap();
}
