//! Crash recovery: the recovered index must equal the state produced by
//! replaying the longest intact prefix of the journal.

use std::fs;

use longshore::{MessageLoadRequest, MessageRecord, MessageStore, QueueRecord, StoreConfig};
use longshore_harness::{crash_clone, dequeue_uow, enqueue_uow, segment_files};
use tempfile::tempdir;

#[test]
fn recovers_committed_state_from_journal_alone() {
    let dir = tempdir().unwrap();
    let store = MessageStore::start(StoreConfig::new(dir.path())).unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 1,
            metadata: b"q".to_vec(),
        })
        .unwrap();
    for seq in 0..3u64 {
        let payload = format!("payload-{seq}").into_bytes();
        store
            .store_blocking(vec![enqueue_uow(1, seq, MessageRecord::new(100 + seq, payload))])
            .unwrap();
    }
    store.store_blocking(vec![dequeue_uow(1, 1, 101)]).unwrap();

    // Kill the process here: only the journal survives, no snapshot, no
    // dirty index.
    let clone = crash_clone(dir.path());
    drop(store);

    let recovered = MessageStore::start(StoreConfig::new(clone.path())).unwrap();
    let queues = recovered.list_queues().unwrap();
    assert_eq!(queues.len(), 1);

    let entries = recovered.get_queue_entries(1, 0, 100).unwrap();
    let seqs: Vec<u64> = entries.iter().map(|e| e.entry_seq).collect();
    assert_eq!(seqs, vec![0, 2]);

    let payloads = recovered
        .load_messages(&[
            MessageLoadRequest::by_key(100),
            MessageLoadRequest::by_key(102),
        ])
        .unwrap();
    assert_eq!(payloads[0].as_deref(), Some(&b"payload-0"[..]));
    assert_eq!(payloads[1].as_deref(), Some(&b"payload-2"[..]));

    // Two live entries remain, both in the only segment.
    let counts = recovered.ledger_counts();
    assert_eq!(counts.values().sum::<u64>(), 2);

    recovered.stop().unwrap();
}

#[test]
fn torn_tail_is_discarded_and_prefix_survives() {
    let dir = tempdir().unwrap();
    let store = MessageStore::start(StoreConfig::new(dir.path())).unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();
    store
        .store_blocking(vec![enqueue_uow(1, 0, MessageRecord::new(10, b"first".to_vec()))])
        .unwrap();
    store
        .store_blocking(vec![enqueue_uow(1, 1, MessageRecord::new(11, b"second".to_vec()))])
        .unwrap();

    let clone = crash_clone(dir.path());
    drop(store);

    // Mangle the final bytes of the journal, tearing the last record.
    let segment = clone.path().join(&segment_files(clone.path())[0]);
    let mut bytes = fs::read(&segment).unwrap();
    let len = bytes.len();
    for byte in &mut bytes[len - 4..] {
        *byte ^= 0xFF;
    }
    fs::write(&segment, &bytes).unwrap();

    let recovered = MessageStore::start(StoreConfig::new(clone.path())).unwrap();

    // The torn record was the enqueue of message 11: its message record
    // replayed, the placement did not.
    let seqs: Vec<u64> = recovered
        .get_queue_entries(1, 0, 100)
        .unwrap()
        .iter()
        .map(|e| e.entry_seq)
        .collect();
    assert_eq!(seqs, vec![0]);

    let payloads = recovered
        .load_messages(&[MessageLoadRequest::by_key(10)])
        .unwrap();
    assert_eq!(payloads[0].as_deref(), Some(&b"first"[..]));

    assert_eq!(recovered.ledger_counts().values().sum::<u64>(), 1);

    // The store keeps working past the truncation point.
    recovered
        .store_blocking(vec![enqueue_uow(1, 5, MessageRecord::new(12, b"after".to_vec()))])
        .unwrap();
    let payloads = recovered
        .load_messages(&[MessageLoadRequest::by_key(12)])
        .unwrap();
    assert_eq!(payloads[0].as_deref(), Some(&b"after"[..]));

    recovered.stop().unwrap();
}

#[test]
fn garbage_appended_past_the_tail_is_ignored() {
    let dir = tempdir().unwrap();
    let store = MessageStore::start(StoreConfig::new(dir.path())).unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();
    store
        .store_blocking(vec![enqueue_uow(1, 0, MessageRecord::new(20, b"kept".to_vec()))])
        .unwrap();

    let clone = crash_clone(dir.path());
    drop(store);

    // A crashed writer can leave preallocated zeros past the last record.
    let segment = clone.path().join(&segment_files(clone.path())[0]);
    let mut bytes = fs::read(&segment).unwrap();
    bytes.extend_from_slice(&[0u8; 512]);
    fs::write(&segment, &bytes).unwrap();

    let recovered = MessageStore::start(StoreConfig::new(clone.path())).unwrap();
    let payloads = recovered
        .load_messages(&[MessageLoadRequest::by_key(20)])
        .unwrap();
    assert_eq!(payloads[0].as_deref(), Some(&b"kept"[..]));
    assert_eq!(recovered.get_queue_entries(1, 0, 10).unwrap().len(), 1);
    recovered.stop().unwrap();
}

#[test]
fn clean_stop_then_restart_replays_nothing_visible() {
    let dir = tempdir().unwrap();
    {
        let store = MessageStore::start(StoreConfig::new(dir.path())).unwrap();
        store
            .add_queue_blocking(QueueRecord {
                queue_key: 9,
                metadata: Vec::new(),
            })
            .unwrap();
        store
            .store_blocking(vec![enqueue_uow(9, 0, MessageRecord::new(1, b"v".to_vec()))])
            .unwrap();
        store.stop().unwrap();
    }

    let store = MessageStore::start(StoreConfig::new(dir.path())).unwrap();
    assert!(store.last_snapshot_position() > 0);
    assert_eq!(store.get_queue_entries(9, 0, 10).unwrap().len(), 1);
    assert_eq!(
        store
            .load_messages(&[MessageLoadRequest::by_key(1)])
            .unwrap()[0]
            .as_deref(),
        Some(&b"v"[..])
    );
    assert_eq!(store.ledger_counts().values().sum::<u64>(), 1);
    store.stop().unwrap();
}
