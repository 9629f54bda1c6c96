//! Snapshots taken while a writer is running: no unit of work is lost, and
//! the data directory never accumulates more than one snapshot.

use std::sync::Arc;

use longshore::{MessageLoadRequest, MessageRecord, MessageStore, QueueRecord, StoreConfig};
use longshore_harness::{enqueue_uow, snapshot_dirs};
use tempfile::tempdir;

#[test]
fn snapshot_while_writer_runs() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        MessageStore::start(StoreConfig::new(dir.path()).with_sync(false)).unwrap(),
    );
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();

    let writer = {
        let store = store.clone();
        std::thread::spawn(move || {
            for seq in 0..200u64 {
                store
                    .store_blocking(vec![enqueue_uow(
                        1,
                        seq,
                        MessageRecord::new(1000 + seq, seq.to_be_bytes().to_vec()),
                    )])
                    .expect("store while snapshotting");
            }
        })
    };

    for _ in 0..5 {
        store.snapshot_index().expect("snapshot during writes");
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    writer.join().expect("writer thread");
    store.snapshot_index().unwrap();

    // Every unit of work that completed is readable.
    let requests: Vec<MessageLoadRequest> =
        (0..200u64).map(|seq| MessageLoadRequest::by_key(1000 + seq)).collect();
    let payloads = store.load_messages(&requests).unwrap();
    for (seq, payload) in payloads.iter().enumerate() {
        assert_eq!(
            payload.as_deref(),
            Some(&(seq as u64).to_be_bytes()[..]),
            "message {seq} must survive"
        );
    }

    // The snapshot covers every unit of work that returned before it began.
    assert!(store.last_snapshot_position() > 0);
    assert_eq!(store.get_queue_entries(1, 0, 1000).unwrap().len(), 200);

    // At most one snapshot directory exists once the dust settles.
    assert_eq!(snapshot_dirs(dir.path()).len(), 1);

    store.stop().unwrap();
}
