//! Read paths.
//!
//! Reads hold the read side of the snapshot RW lock and resolve through a
//! point-in-time index snapshot, so bulk scans are unaffected by concurrent
//! commits. Message payload reads then go straight to the journal.

use longshore_error::{Result, StoreError};
use longshore_index::IndexSnapshot;
use longshore_journal::Journal;
use longshore_types::keys;
use longshore_types::{Locator, LocatorCell, MessageRecord, QueueEntryRecord, QueueRecord};
use tracing::warn;

use crate::store::MessageStore;

/// A message lookup request: the key plus an optional shared locator cell
/// the producer kept from the write.
#[derive(Debug, Default)]
pub struct MessageLoadRequest {
    /// Key of the message to load.
    pub msg_key: u64,
    /// Shared cell published at commit; consulted before the index.
    pub locator: Option<LocatorCell>,
}

impl MessageLoadRequest {
    /// Request resolving purely through the index.
    pub fn by_key(msg_key: u64) -> Self {
        Self {
            msg_key,
            locator: None,
        }
    }
}

/// A contiguous run of queue entries, summarized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntryRange {
    /// Sequence of the first entry in the run.
    pub first_entry_seq: u64,
    /// Sequence of the last entry in the run.
    pub last_entry_seq: u64,
    /// Number of entries in the run.
    pub count: u64,
    /// Sum of entry sizes.
    pub size: u64,
    /// Smallest non-zero expiration in the run, zero when none expires.
    pub expiration: u64,
}

impl MessageStore {
    /// Resolve message payloads.
    ///
    /// Each request tries its locator cell first, then the index under one
    /// shared snapshot, then reads the payload from the journal. Requests
    /// that miss are retried once under a fresh snapshot, which tolerates
    /// the read racing a commit that is in flight; a request that still
    /// misses yields `None`.
    pub fn load_messages(
        &self,
        requests: &[MessageLoadRequest],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        let journal_guard = self.inner.journal.read();
        let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;

        let mut payloads = Vec::with_capacity(requests.len());
        let mut misses = Vec::new();
        {
            let snapshot = index.snapshot();
            for (i, request) in requests.iter().enumerate() {
                match load_one(journal, &snapshot, request)? {
                    Some(payload) => payloads.push(Some(payload)),
                    None => {
                        payloads.push(None);
                        misses.push(i);
                    }
                }
            }
        }

        if !misses.is_empty() {
            let snapshot = index.snapshot();
            for i in misses {
                let request = &requests[i];
                match load_one(journal, &snapshot, request)? {
                    Some(payload) => payloads[i] = Some(payload),
                    None => warn!(msg_key = request.msg_key, "message not found"),
                }
            }
        }
        Ok(payloads)
    }

    /// Every queue known to the store, in key order.
    pub fn list_queues(&self) -> Result<Vec<QueueRecord>> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        let snapshot = index.snapshot();
        snapshot
            .prefix_scan(&[keys::QUEUE_PREFIX])
            .map(|item| item.and_then(|(_, value)| QueueRecord::decode(&value)))
            .collect()
    }

    /// One queue's record, if present.
    pub fn get_queue(&self, queue_key: u64) -> Result<Option<QueueRecord>> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        match index.get(&keys::queue_key(queue_key))? {
            Some(value) => Ok(Some(QueueRecord::decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Walk a queue's entries, emitting one summary per `limit` entries.
    ///
    /// A `limit` of zero yields no groups.
    pub fn list_queue_entry_groups(
        &self,
        queue_key: u64,
        limit: u64,
    ) -> Result<Vec<QueueEntryRange>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        let snapshot = index.snapshot();

        let mut groups = Vec::new();
        let mut current: Option<QueueEntryRange> = None;
        for item in snapshot.prefix_scan(&keys::entry_prefix(queue_key)) {
            let (_, value) = item?;
            let entry = QueueEntryRecord::decode(&value)?;
            let group = current.get_or_insert(QueueEntryRange {
                first_entry_seq: entry.entry_seq,
                last_entry_seq: entry.entry_seq,
                count: 0,
                size: 0,
                expiration: 0,
            });
            group.last_entry_seq = entry.entry_seq;
            group.count += 1;
            group.size += u64::from(entry.size);
            if entry.expiration != 0
                && (group.expiration == 0 || entry.expiration < group.expiration)
            {
                group.expiration = entry.expiration;
            }
            if group.count == limit {
                groups.extend(current.take());
            }
        }
        groups.extend(current);
        Ok(groups)
    }

    /// Entries of one queue with sequences in `[first, last]`, in order.
    pub fn get_queue_entries(
        &self,
        queue_key: u64,
        first: u64,
        last: u64,
    ) -> Result<Vec<QueueEntryRecord>> {
        if last < first {
            return Ok(Vec::new());
        }
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        let snapshot = index.snapshot();

        // Entry keys are fixed-width, so appending a byte to the last key
        // makes an inclusive upper bound.
        let start = keys::entry_key(queue_key, first);
        let mut end = keys::entry_key(queue_key, last).to_vec();
        end.push(0);

        snapshot
            .range_scan(&start, &end)
            .map(|item| item.and_then(|(_, value)| QueueEntryRecord::decode(&value)))
            .collect()
    }

    /// Greatest message key present in the index.
    pub fn get_last_message_key(&self) -> Result<Option<u64>> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        Ok(index
            .last_key_with_prefix(&[keys::MESSAGE_PREFIX])?
            .as_deref()
            .and_then(keys::decode_message_key))
    }

    /// Greatest queue key present in the index.
    pub fn get_last_queue_key(&self) -> Result<Option<u64>> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        Ok(index
            .last_key_with_prefix(&[keys::QUEUE_PREFIX])?
            .as_deref()
            .and_then(keys::decode_queue_key))
    }

    /// Value of one user-map key.
    pub fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = self.inner.index.read();
        let index = slot.open_dirty()?;
        index.get(&keys::map_key(user_key))
    }
}

fn load_one(
    journal: &Journal,
    snapshot: &IndexSnapshot<'_>,
    request: &MessageLoadRequest,
) -> Result<Option<Vec<u8>>> {
    let locator = match request.locator.as_ref().and_then(LocatorCell::get) {
        Some(locator) => Some(locator),
        None => snapshot
            .get(&keys::message_key(request.msg_key))?
            .map(|bytes| Locator::decode(&bytes))
            .transpose()?,
    };
    let Some(locator) = locator else {
        return Ok(None);
    };
    // A stale index locator can outlive its segment (the message was
    // dequeued everywhere and the segment collected); that is a miss, not
    // a store failure.
    let bytes = match journal.read_payload(locator.position, locator.length) {
        Ok(bytes) => bytes,
        Err(StoreError::PositionNotFound { .. }) => return Ok(None),
        Err(error) => return Err(error),
    };
    let message = MessageRecord::decode(&bytes)?;
    Ok(Some(message.payload))
}
