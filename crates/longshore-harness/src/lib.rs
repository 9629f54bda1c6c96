//! Shared fixtures for Longshore integration tests.
//!
//! The crash simulation here clones a running store's durable state — the
//! journal segments plus any published snapshot directories — into a fresh
//! directory and opens a second store on the clone. That is byte-equivalent
//! to a process kill: `dirty.index` and `temp.index` are exactly the
//! directories startup discards, so leaving them out of the clone changes
//! nothing about recovery.

use std::fs;
use std::path::Path;

use longshore::{MessageAction, MessageRecord, QueueEntryRecord, UnitOfWork};
use tempfile::TempDir;

/// A queue entry with no embedded locator.
pub fn entry(queue_key: u64, entry_seq: u64, msg_key: u64, size: u32) -> QueueEntryRecord {
    QueueEntryRecord {
        queue_key,
        entry_seq,
        msg_key,
        size,
        expiration: 0,
        message_locator: None,
    }
}

/// A unit of work storing `message` and placing it on one queue.
pub fn enqueue_uow(queue_key: u64, entry_seq: u64, message: MessageRecord) -> UnitOfWork {
    let size = message.payload.len() as u32;
    let msg_key = message.msg_key;
    let mut action = MessageAction::store(message);
    action.enqueues.push(entry(queue_key, entry_seq, msg_key, size));
    let mut uow = UnitOfWork::new();
    uow.push_action(action);
    uow
}

/// A unit of work removing one queue entry.
pub fn dequeue_uow(queue_key: u64, entry_seq: u64, msg_key: u64) -> UnitOfWork {
    let mut action = MessageAction::default();
    action.dequeues.push(entry(queue_key, entry_seq, msg_key, 0));
    let mut uow = UnitOfWork::new();
    uow.push_action(action);
    uow
}

/// Clone a store's durable state (journal segments and snapshot
/// directories) into a fresh directory, as a crash would leave it.
pub fn crash_clone(data_dir: &Path) -> TempDir {
    let clone = TempDir::new().expect("create clone dir");
    for entry in fs::read_dir(data_dir).expect("read data dir") {
        let entry = entry.expect("read dir entry");
        let name = entry.file_name().to_string_lossy().into_owned();
        let dst = clone.path().join(&name);
        if entry.file_type().expect("file type").is_dir() {
            if name.ends_with(".index") && name != "dirty.index" && name != "temp.index" {
                copy_dir(&entry.path(), &dst);
            }
        } else if name.ends_with(".log") {
            fs::copy(entry.path(), &dst).expect("copy segment");
        }
    }
    clone
}

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).expect("create dir");
    for entry in fs::read_dir(src).expect("read dir") {
        let entry = entry.expect("read dir entry");
        if entry.file_type().expect("file type").is_file() {
            fs::copy(entry.path(), dst.join(entry.file_name())).expect("copy file");
        }
    }
}

/// Snapshot directories present in a data directory (excluding
/// `dirty.index` and `temp.index`).
pub fn snapshot_dirs(data_dir: &Path) -> Vec<String> {
    let mut dirs: Vec<String> = fs::read_dir(data_dir)
        .expect("read data dir")
        .filter_map(|entry| {
            let entry = entry.expect("read dir entry");
            let name = entry.file_name().to_string_lossy().into_owned();
            (entry.file_type().expect("file type").is_dir()
                && name.ends_with(".index")
                && name != "dirty.index"
                && name != "temp.index")
                .then_some(name)
        })
        .collect();
    dirs.sort();
    dirs
}

/// Journal segment files present in a data directory, sorted.
pub fn segment_files(data_dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = fs::read_dir(data_dir)
        .expect("read data dir")
        .filter_map(|entry| {
            let entry = entry.expect("read dir entry");
            let name = entry.file_name().to_string_lossy().into_owned();
            (entry.file_type().expect("file type").is_file() && name.ends_with(".log"))
                .then_some(name)
        })
        .collect();
    files.sort();
    files
}
