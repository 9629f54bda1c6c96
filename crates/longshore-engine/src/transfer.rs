//! Bulk export and import.
//!
//! Export walks each index prefix family under one snapshot, writing a
//! magic header followed by length-framed, tagged records. Import purges
//! the store, rebuilds it from the stream (messages are re-appended to the
//! journal and their fresh locators stamped into their queue entries), and
//! finishes with a snapshot so the rebuilt index survives a restart.
//!
//! Both entry points return a [`TransferResult`] sum instead of erroring,
//! so operator tooling can report the failure message.

use std::collections::HashMap;
use std::io::{Read, Write};

use longshore_error::{Result, StoreError};
use longshore_journal::RecordKind;
use longshore_types::keys;
use longshore_types::{Locator, MapEntryRecord, MessageRecord, QueueEntryRecord, QueueRecord};
use tracing::{info, warn};

use crate::recovery::ledger_incr;
use crate::store::{purge_locked, snapshot_locked, MessageStore};

/// Stream header: format name and version.
const EXPORT_MAGIC: &[u8; 8] = b"LSEXP001";

const TAG_END: u8 = 0;
const TAG_MAP: u8 = 1;
const TAG_QUEUE: u8 = 2;
const TAG_MESSAGE: u8 = 3;
const TAG_ENTRY: u8 = 4;

/// Outcome of a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    /// The transfer completed; counts are per record family.
    Success {
        /// Map entries transferred.
        map_entries: u64,
        /// Queues transferred.
        queues: u64,
        /// Messages transferred.
        messages: u64,
        /// Queue entries transferred.
        entries: u64,
    },
    /// The transfer failed; the store may be partially rebuilt on import.
    Failure {
        /// Human-readable reason.
        message: String,
    },
}

impl MessageStore {
    /// Export the whole store as a length-framed stream.
    pub fn export_pb(&self, out: &mut dyn Write) -> TransferResult {
        match self.export_inner(out) {
            Ok(result) => result,
            Err(error) => TransferResult::Failure {
                message: error.to_string(),
            },
        }
    }

    /// Replace the whole store with the contents of a stream previously
    /// produced by [`MessageStore::export_pb`].
    pub fn import_pb(&self, input: &mut dyn Read) -> TransferResult {
        match self.import_inner(input) {
            Ok(result) => result,
            Err(error) => TransferResult::Failure {
                message: error.to_string(),
            },
        }
    }

    fn export_inner(&self, out: &mut dyn Write) -> Result<TransferResult> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        let journal_guard = self.inner.journal.read();
        let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;
        journal.flush()?;

        let snapshot = index.snapshot();
        out.write_all(EXPORT_MAGIC)?;

        let mut map_entries = 0u64;
        for item in snapshot.prefix_scan(&[keys::MAP_PREFIX]) {
            let (key, value) = item?;
            let user_key = keys::decode_map_key(&key)
                .ok_or_else(|| StoreError::codec("malformed map key in index"))?;
            let record = MapEntryRecord {
                key: user_key.to_vec(),
                value: Some(value.into_vec()),
            };
            write_frame(out, TAG_MAP, &record.encode())?;
            map_entries += 1;
        }

        let mut queues = 0u64;
        for item in snapshot.prefix_scan(&[keys::QUEUE_PREFIX]) {
            let (_, value) = item?;
            write_frame(out, TAG_QUEUE, &value)?;
            queues += 1;
        }

        let mut messages = 0u64;
        for item in snapshot.prefix_scan(&[keys::MESSAGE_PREFIX]) {
            let (_, value) = item?;
            let locator = Locator::decode(&value)?;
            let encoded = journal.read_payload(locator.position, locator.length)?;
            write_frame(out, TAG_MESSAGE, &encoded)?;
            messages += 1;
        }

        let mut entries = 0u64;
        for item in snapshot.prefix_scan(&[keys::ENTRY_PREFIX]) {
            let (_, value) = item?;
            write_frame(out, TAG_ENTRY, &value)?;
            entries += 1;
        }

        write_frame(out, TAG_END, &[])?;
        out.flush()?;

        info!(map_entries, queues, messages, entries, "export complete");
        Ok(TransferResult::Success {
            map_entries,
            queues,
            messages,
            entries,
        })
    }

    fn import_inner(&self, input: &mut dyn Read) -> Result<TransferResult> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != EXPORT_MAGIC {
            return Err(StoreError::codec("bad export stream magic"));
        }

        let mut slot = self.inner.index.write();
        let mut journal_slot = self.inner.journal.write();
        purge_locked(&self.inner, &mut slot, &mut journal_slot)?;

        let mut map_entries = 0u64;
        let mut queues = 0u64;
        let mut messages = 0u64;
        let mut entries = 0u64;
        {
            let journal = journal_slot.as_ref().ok_or(StoreError::NotOpen)?;
            let index = slot.open_dirty()?;
            let mut ledger = self.inner.ledger.lock();
            let mut locators: HashMap<u64, Locator> = HashMap::new();

            while let Some((tag, bytes)) = read_frame(input)? {
                match tag {
                    TAG_MAP => {
                        let record = MapEntryRecord::decode(&bytes)?;
                        if let Some(value) = record.value {
                            index.put(&keys::map_key(&record.key), &value)?;
                        }
                        map_entries += 1;
                    }
                    TAG_QUEUE => {
                        let record = QueueRecord::decode(&bytes)?;
                        index.put(&keys::queue_key(record.queue_key), &bytes)?;
                        queues += 1;
                    }
                    TAG_MESSAGE => {
                        let message = MessageRecord::decode(&bytes)?;
                        let position = journal.append(RecordKind::AddMessage, &bytes)?;
                        let locator = Locator {
                            position,
                            length: bytes.len() as u32,
                        };
                        index.put(&keys::message_key(message.msg_key), &locator.encode())?;
                        locators.insert(message.msg_key, locator);
                        messages += 1;
                    }
                    TAG_ENTRY => {
                        let mut entry = QueueEntryRecord::decode(&bytes)?;
                        entry.message_locator = locators.get(&entry.msg_key).copied();
                        if entry.msg_key != 0 && entry.message_locator.is_none() {
                            warn!(
                                msg_key = entry.msg_key,
                                "imported entry references a message absent from the stream"
                            );
                        }
                        index.put(
                            &keys::entry_key(entry.queue_key, entry.entry_seq),
                            &entry.encode(),
                        )?;
                        if let Some(locator) = entry.message_locator {
                            ledger_incr(journal, &mut ledger, locator.position);
                        }
                        entries += 1;
                    }
                    other => {
                        return Err(StoreError::codec(format!("unknown frame tag {other}")));
                    }
                }
            }
        }

        // The rebuilt index only survives a restart once a snapshot covers
        // it; the journal holds nothing but the re-appended messages.
        let journal = journal_slot.as_ref().ok_or(StoreError::NotOpen)?;
        snapshot_locked(&self.inner, &mut slot, journal, true)?;

        info!(map_entries, queues, messages, entries, "import complete");
        Ok(TransferResult::Success {
            map_entries,
            queues,
            messages,
            entries,
        })
    }
}

fn write_frame(out: &mut dyn Write, tag: u8, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| StoreError::codec("export record exceeds frame limit"))?;
    out.write_all(&[tag])?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_frame(input: &mut dyn Read) -> Result<Option<(u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    if tag[0] == TAG_END {
        return Ok(None);
    }
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u32::from_be_bytes(len) as usize];
    input.read_exact(&mut bytes)?;
    Ok(Some((tag[0], bytes)))
}
