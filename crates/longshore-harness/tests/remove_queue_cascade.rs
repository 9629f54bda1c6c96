//! Removing a queue cascades over its entries, in the live store and
//! through recovery.

use longshore::{MessageRecord, MessageStore, QueueRecord, StoreConfig};
use longshore_harness::{crash_clone, enqueue_uow};
use tempfile::tempdir;

#[test]
fn remove_queue_drops_entries_and_references() {
    let dir = tempdir().unwrap();
    let store = MessageStore::start(StoreConfig::new(dir.path())).unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 7,
            metadata: b"doomed".to_vec(),
        })
        .unwrap();
    store
        .add_queue_blocking(QueueRecord {
            queue_key: 8,
            metadata: b"survivor".to_vec(),
        })
        .unwrap();

    for seq in 0..3u64 {
        store
            .store_blocking(vec![enqueue_uow(
                7,
                seq,
                MessageRecord::new(700 + seq, vec![7u8; 64]),
            )])
            .unwrap();
    }
    store
        .store_blocking(vec![enqueue_uow(8, 0, MessageRecord::new(800, vec![8u8; 64]))])
        .unwrap();
    assert_eq!(store.ledger_counts().values().sum::<u64>(), 4);

    store.remove_queue_blocking(7).unwrap();

    assert_eq!(store.get_queue(7).unwrap(), None);
    assert!(store.get_queue_entries(7, 0, 100).unwrap().is_empty());
    let queues: Vec<u64> = store
        .list_queues()
        .unwrap()
        .iter()
        .map(|q| q.queue_key)
        .collect();
    assert_eq!(queues, vec![8]);
    // The cascade released the three references held by queue 7.
    assert_eq!(store.ledger_counts().values().sum::<u64>(), 1);

    // The cascade must replay identically after a crash.
    let clone = crash_clone(dir.path());
    drop(store);

    let recovered = MessageStore::start(StoreConfig::new(clone.path())).unwrap();
    assert_eq!(recovered.get_queue(7).unwrap(), None);
    assert!(recovered.get_queue_entries(7, 0, 100).unwrap().is_empty());
    let queues: Vec<u64> = recovered
        .list_queues()
        .unwrap()
        .iter()
        .map(|q| q.queue_key)
        .collect();
    assert_eq!(queues, vec![8]);
    assert_eq!(recovered.ledger_counts().values().sum::<u64>(), 1);
    recovered.stop().unwrap();
}
