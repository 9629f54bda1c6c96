//! Startup recovery.
//!
//! The live index (`dirty.index`) is always disposable: startup deletes it,
//! rebuilds it from the newest snapshot by hard-linking, and replays the
//! journal suffix past the snapshot's covered position. Whatever the index
//! held before the restart is irrelevant; this is what makes the recovered
//! state a prefix of the journal regardless of how the process died.

use std::fs;

use longshore_error::{Result, StoreError};
use longshore_index::IndexStore;
use longshore_journal::{Journal, LogInfo, RecordKind};
use longshore_types::keys;
use longshore_types::varint::read_varint;
use longshore_types::{Locator, MapEntryRecord, MessageRecord, QueueEntryRecord, QueueRecord, StoreConfig};
use tracing::{debug, info, warn};

use crate::ledger::LogRefLedger;
use crate::snapshot::{clone_dir, enumerate_snapshots};

/// Everything `start()` needs, rebuilt from disk.
pub(crate) struct RecoveredStore {
    pub index: IndexStore,
    pub journal: Journal,
    pub ledger: LogRefLedger,
    /// Position covered by the snapshot the index was rebuilt from; zero
    /// when starting from an empty index.
    pub last_snapshot: u64,
}

/// One attempt at opening the store. Called in a retry loop by `start()`.
pub(crate) fn open_store(config: &StoreConfig) -> Result<RecoveredStore> {
    fs::create_dir_all(&config.directory).map_err(|_| StoreError::BadDirectory {
        path: config.directory.clone(),
    })?;

    let last_snapshot = prepare_dirty_index(config)?;

    let index = IndexStore::open(&config.dirty_index_dir(), config)?;
    let ledger = match index.get(keys::LOG_REFS_KEY)? {
        Some(bytes) => LogRefLedger::decode(&bytes)?,
        None => LogRefLedger::new(),
    };
    index.put_sync(keys::DIRTY_KEY, &[1])?;

    let journal = Journal::open(config)?;

    let mut recovered = RecoveredStore {
        index,
        journal,
        ledger,
        last_snapshot,
    };
    replay(&mut recovered)?;
    Ok(recovered)
}

/// Clean up stale snapshot state and rebuild `dirty.index` from the newest
/// snapshot. Returns the position that snapshot covers (zero if none).
fn prepare_dirty_index(config: &StoreConfig) -> Result<u64> {
    let temp = config.temp_index_dir();
    if temp.exists() {
        fs::remove_dir_all(&temp)?;
    }
    let dirty = config.dirty_index_dir();
    if dirty.exists() {
        fs::remove_dir_all(&dirty)?;
    }

    let snapshots = enumerate_snapshots(&config.directory)?;
    let last = snapshots.last().copied().unwrap_or(0);
    for &position in &snapshots {
        if position != last {
            fs::remove_dir_all(config.snapshot_dir(position))?;
            warn!(position, "stale snapshot removed");
        }
    }

    fs::create_dir_all(&dirty)?;
    if !snapshots.is_empty() {
        clone_dir(&config.snapshot_dir(last), &dirty)?;
        info!(position = last, "index rebuilt from snapshot");
    } else {
        info!("no snapshot found, starting with an empty index");
    }
    Ok(last)
}

/// Replay journal records in `[last_snapshot, appender_limit)` into the
/// index, stopping at the first unreadable record and truncating the
/// journal there.
fn replay(store: &mut RecoveredStore) -> Result<()> {
    let limit = store.journal.appender_limit();
    let mut pos = store.last_snapshot;
    let mut records = 0u64;

    while pos < limit {
        let (kind, payload, next) = match store.journal.read(pos) {
            Ok(record) => record,
            Err(error) if error.is_torn_tail() => {
                warn!(
                    position = pos,
                    discarded = limit - pos,
                    %error,
                    "unreadable journal tail discarded"
                );
                store.journal.truncate(pos)?;
                break;
            }
            Err(error) => return Err(error),
        };

        match apply_record(store, pos, kind, &payload) {
            Ok(()) => {}
            Err(error @ StoreError::Codec { .. }) => {
                // A record that passes its checksum but fails to decode is
                // corruption all the same: discard it and the suffix.
                warn!(
                    position = pos,
                    discarded = limit - pos,
                    %error,
                    "undecodable journal record, tail discarded"
                );
                store.journal.truncate(pos)?;
                break;
            }
            Err(error) => return Err(error),
        }

        records += 1;
        pos = next;
    }

    info!(
        from = store.last_snapshot,
        to = pos,
        records,
        "journal replay complete"
    );
    Ok(())
}

fn apply_record(store: &mut RecoveredStore, pos: u64, kind: u8, payload: &[u8]) -> Result<()> {
    let index = &store.index;
    match RecordKind::from_code(kind) {
        Some(RecordKind::AddMessage) => {
            let message = MessageRecord::decode(payload)?;
            let locator = Locator {
                position: pos,
                length: payload.len() as u32,
            };
            index.put(&keys::message_key(message.msg_key), &locator.encode())?;
        }
        Some(RecordKind::AddQueueEntry) => {
            let entry = QueueEntryRecord::decode(payload)?;
            index.put(&keys::entry_key(entry.queue_key, entry.entry_seq), payload)?;
            if entry.msg_key != 0 {
                match resolve_message_position(index, &entry)? {
                    Some(msg_pos) => ledger_incr(&store.journal, &mut store.ledger, msg_pos),
                    None => warn!(
                        msg_key = entry.msg_key,
                        "enqueue references an unknown message"
                    ),
                }
            }
        }
        Some(RecordKind::RemoveQueueEntry) => {
            // Payload is the entry's index key.
            if let Some(value) = index.get(payload)? {
                let entry = QueueEntryRecord::decode(&value)?;
                if entry.msg_key != 0 {
                    match resolve_message_position(index, &entry)? {
                        Some(msg_pos) => ledger_decr(&store.journal, &mut store.ledger, msg_pos),
                        None => warn!(
                            msg_key = entry.msg_key,
                            "dequeue references an unknown message"
                        ),
                    }
                }
                index.delete(payload)?;
            }
        }
        Some(RecordKind::AddQueue) => {
            let record = QueueRecord::decode(payload)?;
            index.put(&keys::queue_key(record.queue_key), payload)?;
        }
        Some(RecordKind::RemoveQueue) => {
            let (queue, _) = read_varint(payload)
                .ok_or_else(|| StoreError::codec("bad queue key in remove-queue record"))?;
            index.delete(&keys::queue_key(queue))?;

            let entries: Vec<_> = index
                .prefix_scan(&keys::entry_prefix(queue))
                .collect::<Result<_>>()?;
            for (key, value) in entries {
                let entry = QueueEntryRecord::decode(&value)?;
                if entry.msg_key != 0 {
                    if let Some(msg_pos) = resolve_message_position(index, &entry)? {
                        ledger_decr(&store.journal, &mut store.ledger, msg_pos);
                    }
                }
                index.delete(&key)?;
            }
        }
        Some(RecordKind::MapEntry) => {
            let record = MapEntryRecord::decode(payload)?;
            let key = keys::map_key(&record.key);
            match record.value {
                Some(value) => index.put(&key, &value)?,
                None => index.delete(&key)?,
            }
        }
        Some(RecordKind::RemoveMessage) | None => {
            debug!(kind, position = pos, "skipping unhandled record kind");
        }
    }
    Ok(())
}

/// Journal position of the message an entry references: the entry's
/// embedded locator when present, else the current index locator.
pub(crate) fn resolve_message_position(
    index: &IndexStore,
    entry: &QueueEntryRecord,
) -> Result<Option<u64>> {
    if let Some(locator) = entry.message_locator {
        return Ok(Some(locator.position));
    }
    match index.get(&keys::message_key(entry.msg_key))? {
        Some(bytes) => Ok(Some(Locator::decode(&bytes)?.position)),
        None => Ok(None),
    }
}

/// Increment the ledger counter of the segment holding `msg_pos`.
pub(crate) fn ledger_incr(journal: &Journal, ledger: &mut LogRefLedger, msg_pos: u64) {
    match journal.log_info(msg_pos) {
        Some(LogInfo { position, .. }) => ledger.incr(position),
        None => warn!(msg_pos, "no journal segment covers referenced message"),
    }
}

/// Decrement the ledger counter of the segment holding `msg_pos`.
pub(crate) fn ledger_decr(journal: &Journal, ledger: &mut LogRefLedger, msg_pos: u64) {
    match journal.log_info(msg_pos) {
        Some(LogInfo { position, .. }) => ledger.decr(position),
        None => warn!(msg_pos, "no journal segment covers referenced message"),
    }
}
