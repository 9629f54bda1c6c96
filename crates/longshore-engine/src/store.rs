//! The message store client.
//!
//! [`MessageStore`] orchestrates the journal, the index, and the ledger:
//!
//! - all mutations funnel through one serial writer thread (an MPSC queue),
//!   so arrival order determines journal order and index order
//! - every user operation holds the read side of the snapshot RW lock; only
//!   the snapshot protocol's suspend takes the write side
//! - a unit of work commits as: journal appends (map actions, then message /
//!   dequeue / enqueue per action), journal flush, one atomic index batch,
//!   then an fsync when a participant asked for durability
//!
//! Lock order is index slot, then journal slot, then ledger.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use longshore_error::{Result, StoreError};
use longshore_index::{IndexBatch, IndexStore};
use longshore_journal::{Journal, RecordKind};
use longshore_types::keys;
use longshore_types::varint::write_varint;
use longshore_types::{Locator, LocatorCell, QueueEntryRecord, QueueRecord, StoreConfig};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::ledger::LogRefLedger;
use crate::recovery::{self, ledger_decr, ledger_incr, resolve_message_position};
use crate::retry::{retry, StopSignal};
use crate::snapshot::clone_dir;
use crate::uow::UnitOfWork;

/// Callback type for asynchronous store operations.
pub type StoreCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Index lifecycle state.
///
/// ```text
/// Closed ──open──▶ OpenDirty ──suspend──▶ OpenCleanForSnapshot ──▶ Closed
///    ▲                                                               │
///    └────────────────────────── resume ◀────────────────────────────┘
/// ```
///
/// Every user operation requires `OpenDirty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexState {
    Closed,
    OpenDirty,
    OpenCleanForSnapshot,
}

/// The index and its lifecycle state, guarded by the snapshot RW lock.
pub(crate) struct IndexSlot {
    pub(crate) state: IndexState,
    pub(crate) store: Option<IndexStore>,
}

impl IndexSlot {
    /// The open index, or [`StoreError::NotOpen`] outside `OpenDirty`.
    pub(crate) fn open_dirty(&self) -> Result<&IndexStore> {
        match (&self.state, &self.store) {
            (IndexState::OpenDirty, Some(store)) => Ok(store),
            _ => Err(StoreError::NotOpen),
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    /// The snapshot RW lock: user operations read, suspend writes.
    pub(crate) index: RwLock<IndexSlot>,
    /// Write side taken only by purge and import.
    pub(crate) journal: RwLock<Option<Journal>>,
    pub(crate) ledger: Mutex<LogRefLedger>,
    /// Journal position covered by the current snapshot; zero when none.
    pub(crate) last_snapshot: AtomicU64,
    /// Armed by journal rotation; the writer snapshots when convenient.
    pub(crate) snapshot_due: AtomicBool,
    pub(crate) stop: StopSignal,
}

pub(crate) enum WriterCommand {
    Store {
        uows: Vec<UnitOfWork>,
        done: Option<StoreCallback>,
    },
    AddQueue {
        record: QueueRecord,
        done: Option<StoreCallback>,
    },
    RemoveQueue {
        queue_key: u64,
        done: Option<StoreCallback>,
    },
    Gc {
        done: Option<StoreCallback>,
    },
    Stop,
}

fn command_callback(command: WriterCommand) -> Option<StoreCallback> {
    match command {
        WriterCommand::Store { done, .. }
        | WriterCommand::AddQueue { done, .. }
        | WriterCommand::RemoveQueue { done, .. }
        | WriterCommand::Gc { done } => done,
        WriterCommand::Stop => None,
    }
}

/// The persistent message store engine.
pub struct MessageStore {
    pub(crate) inner: Arc<StoreInner>,
    tx: Sender<WriterCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MessageStore {
    /// Open the store: recover the index from the newest snapshot plus a
    /// journal replay, then start the serial writer.
    ///
    /// Non-fatal open failures (transient I/O) are retried once a second;
    /// fatal ones (bad configuration, no usable index factory) surface
    /// immediately.
    pub fn start(config: StoreConfig) -> Result<Self> {
        let config = config.validated()?;
        let stop = StopSignal::new();
        let recovered = retry(&stop, "open store", || recovery::open_store(&config))?;

        let inner = Arc::new(StoreInner {
            config,
            index: RwLock::new(IndexSlot {
                state: IndexState::OpenDirty,
                store: Some(recovered.index),
            }),
            journal: RwLock::new(Some(recovered.journal)),
            ledger: Mutex::new(recovered.ledger),
            last_snapshot: AtomicU64::new(recovered.last_snapshot),
            snapshot_due: AtomicBool::new(false),
            stop,
        });

        {
            let journal = inner.journal.read();
            if let Some(journal) = journal.as_ref() {
                arm_rotation(&inner, journal);
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = std::thread::Builder::new()
            .name("longshore-writer".to_owned())
            .spawn({
                let inner = inner.clone();
                move || writer_loop(&inner, &rx)
            })?;

        info!(
            directory = %inner.config.directory.display(),
            last_snapshot = inner.last_snapshot.load(Ordering::SeqCst),
            "message store started"
        );
        Ok(Self {
            inner,
            tx,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Drain the writer, take a final snapshot, and close both stores.
    ///
    /// After a clean stop a restart replays nothing.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop.stop();
        let _ = self.tx.send(WriterCommand::Stop);
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }

        if let Err(error) = snapshot_index_inner(&self.inner, false) {
            warn!(%error, "final snapshot failed, restart will replay the journal");
        }

        let mut slot = self.inner.index.write();
        if let Some(index) = slot.store.take() {
            let refs = self.inner.ledger.lock().encode();
            index.put_sync(keys::LOG_REFS_KEY, &refs)?;
            index.put_sync(keys::DIRTY_KEY, &[0])?;
            slot.state = IndexState::Closed;
            drop(index);
        }
        *self.inner.journal.write() = None;
        info!("message store stopped");
        Ok(())
    }

    /// Commit a batch of units of work asynchronously. The callback fires
    /// after the index batch commits (and after the journal fsync when any
    /// unit requested durability and the store is configured `sync`).
    pub fn store(&self, uows: Vec<UnitOfWork>, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.send(WriterCommand::Store {
            uows,
            done: Some(Box::new(callback)),
        });
    }

    /// Commit a batch of units of work and wait for the result.
    pub fn store_blocking(&self, uows: Vec<UnitOfWork>) -> Result<()> {
        self.wait(move |done| WriterCommand::Store { uows, done })
    }

    /// Record a queue asynchronously.
    pub fn add_queue(
        &self,
        record: QueueRecord,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.send(WriterCommand::AddQueue {
            record,
            done: Some(Box::new(callback)),
        });
    }

    /// Record a queue and wait for the result.
    pub fn add_queue_blocking(&self, record: QueueRecord) -> Result<()> {
        self.wait(move |done| WriterCommand::AddQueue { record, done })
    }

    /// Remove a queue and every entry on it, asynchronously.
    pub fn remove_queue(&self, queue_key: u64, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.send(WriterCommand::RemoveQueue {
            queue_key,
            done: Some(Box::new(callback)),
        });
    }

    /// Remove a queue and every entry on it, waiting for the result.
    pub fn remove_queue_blocking(&self, queue_key: u64) -> Result<()> {
        self.wait(move |done| WriterCommand::RemoveQueue { queue_key, done })
    }

    /// Delete journal segments that hold no live messages and are fully
    /// covered by the current snapshot. Runs on the writer so it is
    /// serialized with commits.
    pub fn gc(&self) -> Result<()> {
        self.wait(|done| WriterCommand::Gc { done })
    }

    /// Take a point-in-time snapshot of the index.
    ///
    /// Blocks every reader and writer for the duration of the suspend
    /// window (sentinel writes, close, hard-link clone, rename, reopen).
    pub fn snapshot_index(&self) -> Result<()> {
        snapshot_index_inner(&self.inner, false)
    }

    /// Delete everything and reopen empty.
    pub fn purge(&self) -> Result<()> {
        let mut slot = self.inner.index.write();
        let mut journal_slot = self.inner.journal.write();
        purge_locked(&self.inner, &mut slot, &mut journal_slot)
    }

    /// Live ledger counters, segment position → reference count.
    pub fn ledger_counts(&self) -> std::collections::BTreeMap<u64, u64> {
        self.inner.ledger.lock().counts()
    }

    /// Journal position covered by the current snapshot (zero when none).
    pub fn last_snapshot_position(&self) -> u64 {
        self.inner.last_snapshot.load(Ordering::SeqCst)
    }

    /// The configuration the store was started with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn send(&self, command: WriterCommand) {
        if let Err(rejected) = self.tx.send(command) {
            finish(command_callback(rejected.into_inner()), Err(StoreError::Stopping));
        }
    }

    fn wait(&self, make: impl FnOnce(Option<StoreCallback>) -> WriterCommand) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let callback: StoreCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.send(make(Some(callback)));
        rx.recv().map_err(|_| StoreError::Stopping)?
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        self.inner.stop.stop();
        let _ = self.tx.send(WriterCommand::Stop);
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }
}

fn arm_rotation(inner: &Arc<StoreInner>, journal: &Journal) {
    let weak = Arc::downgrade(inner);
    journal.set_rotate_listener(move |position| {
        if let Some(inner) = weak.upgrade() {
            debug!(position, "journal rotated, snapshot scheduled");
            inner.snapshot_due.store(true, Ordering::SeqCst);
        }
    });
}

fn writer_loop(inner: &Arc<StoreInner>, rx: &Receiver<WriterCommand>) {
    for command in rx.iter() {
        match command {
            WriterCommand::Stop => break,
            WriterCommand::Store { uows, done } => finish(done, commit_uows(inner, uows)),
            WriterCommand::AddQueue { record, done } => {
                finish(done, commit_add_queue(inner, &record));
            }
            WriterCommand::RemoveQueue { queue_key, done } => {
                finish(done, commit_remove_queue(inner, queue_key));
            }
            WriterCommand::Gc { done } => finish(done, run_gc(inner)),
        }

        if inner.snapshot_due.swap(false, Ordering::SeqCst) && !inner.stop.is_stopped() {
            if let Err(error) = snapshot_index_inner(inner, false) {
                warn!(%error, "snapshot after rotation failed");
            }
        }
    }
    debug!("writer drained");
}

fn finish(done: Option<StoreCallback>, result: Result<()>) {
    match done {
        Some(callback) => callback(result),
        None => {
            if let Err(error) = result {
                warn!(%error, "background commit failed");
            }
        }
    }
}

fn commit_uows(inner: &StoreInner, mut uows: Vec<UnitOfWork>) -> Result<()> {
    let slot = inner.index.read();
    let index = slot.open_dirty()?;
    let journal_guard = inner.journal.read();
    let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;
    let mut ledger = inner.ledger.lock();

    let mut batch = IndexBatch::new();
    let mut sync_needed = false;
    // Locator cells are published only after the flush below; a reader that
    // sees a cell must be able to resolve it against the journal.
    let mut pending_cells: Vec<(LocatorCell, Locator)> = Vec::new();
    // Locators of messages appended earlier in this batch; enqueues and
    // dequeues referencing them cannot use the index, which only sees the
    // batch once it commits.
    let mut appended: HashMap<u64, Locator> = HashMap::new();

    for uow in &mut uows {
        for action in &uow.map_actions {
            journal.append(RecordKind::MapEntry, &action.encode())?;
            let key = keys::map_key(&action.key);
            match &action.value {
                Some(value) => batch.put(&key, value),
                None => batch.delete(&key),
            }
        }

        for action in &mut uow.actions {
            if let Some(message) = &action.message {
                let encoded = message.encode();
                let position = journal.append(RecordKind::AddMessage, &encoded)?;
                let locator = Locator {
                    position,
                    length: encoded.len() as u32,
                };
                batch.put(&keys::message_key(message.msg_key), &locator.encode());
                if let Some(cell) = &message.locator {
                    pending_cells.push((cell.clone(), locator));
                }
                appended.insert(message.msg_key, locator);
            }

            for dequeue in &action.dequeues {
                let key = keys::entry_key(dequeue.queue_key, dequeue.entry_seq);
                journal.append(RecordKind::RemoveQueueEntry, &key)?;
                batch.delete(&key);

                if dequeue.msg_key != 0 {
                    match message_position(index, &appended, dequeue)? {
                        Some(msg_pos) => ledger_decr(journal, &mut ledger, msg_pos),
                        None => warn!(
                            msg_key = dequeue.msg_key,
                            "dequeue references an unknown message"
                        ),
                    }
                }
            }

            for enqueue in &mut action.enqueues {
                // A locator from this batch supersedes whatever the caller
                // stamped.
                if let Some(locator) = appended.get(&enqueue.msg_key) {
                    enqueue.message_locator = Some(*locator);
                }
                let encoded = enqueue.encode();
                journal.append(RecordKind::AddQueueEntry, &encoded)?;
                batch.put(&keys::entry_key(enqueue.queue_key, enqueue.entry_seq), &encoded);

                if enqueue.msg_key != 0 {
                    match message_position(index, &appended, enqueue)? {
                        Some(msg_pos) => ledger_incr(journal, &mut ledger, msg_pos),
                        None => warn!(
                            msg_key = enqueue.msg_key,
                            "enqueue references an unknown message"
                        ),
                    }
                }
            }
        }

        if uow.wants_sync() {
            sync_needed = true;
        }
    }

    // Flush before the batch commits so any locator the batch publishes can
    // be resolved against the journal by a concurrent reader.
    journal.flush()?;
    for (cell, locator) in pending_cells {
        cell.set(locator);
    }
    index.write_batch(batch)?;
    if sync_needed && inner.config.sync {
        journal.sync()?;
    }

    drop(ledger);
    drop(journal_guard);
    drop(slot);

    for uow in uows {
        if let Some(listener) = uow.listener {
            listener();
        }
    }
    Ok(())
}

/// Journal position of the message `entry` references: its embedded
/// locator, a message appended earlier in this batch, or the index.
fn message_position(
    index: &IndexStore,
    appended: &HashMap<u64, Locator>,
    entry: &QueueEntryRecord,
) -> Result<Option<u64>> {
    if let Some(locator) = entry.message_locator {
        return Ok(Some(locator.position));
    }
    if let Some(locator) = appended.get(&entry.msg_key) {
        return Ok(Some(locator.position));
    }
    resolve_message_position(index, entry)
}

fn commit_add_queue(inner: &StoreInner, record: &QueueRecord) -> Result<()> {
    let slot = inner.index.read();
    let index = slot.open_dirty()?;
    let journal_guard = inner.journal.read();
    let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;

    let encoded = record.encode();
    journal.append(RecordKind::AddQueue, &encoded)?;
    let mut batch = IndexBatch::new();
    batch.put(&keys::queue_key(record.queue_key), &encoded);

    journal.flush()?;
    index.write_batch(batch)?;
    if inner.config.sync {
        journal.sync()?;
    }
    debug!(queue_key = record.queue_key, "queue added");
    Ok(())
}

fn commit_remove_queue(inner: &StoreInner, queue_key: u64) -> Result<()> {
    let slot = inner.index.read();
    let index = slot.open_dirty()?;
    let journal_guard = inner.journal.read();
    let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;
    let mut ledger = inner.ledger.lock();

    let mut payload = Vec::new();
    write_varint(&mut payload, queue_key);
    journal.append(RecordKind::RemoveQueue, &payload)?;

    let mut batch = IndexBatch::new();
    batch.delete(&keys::queue_key(queue_key));

    let entries: Vec<_> = index
        .prefix_scan(&keys::entry_prefix(queue_key))
        .collect::<Result<_>>()?;
    let mut removed = 0u64;
    for (key, value) in entries {
        let entry = QueueEntryRecord::decode(&value)?;
        if entry.msg_key != 0 {
            if let Some(msg_pos) = resolve_message_position(index, &entry)? {
                ledger_decr(journal, &mut ledger, msg_pos);
            }
        }
        batch.delete(&key);
        removed += 1;
    }

    journal.flush()?;
    index.write_batch(batch)?;
    if inner.config.sync {
        journal.sync()?;
    }
    info!(queue_key, entries = removed, "queue removed");
    Ok(())
}

fn run_gc(inner: &StoreInner) -> Result<()> {
    let slot = inner.index.read();
    slot.open_dirty()?;
    let journal_guard = inner.journal.read();
    let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;

    // Never collect past the appender or past what the snapshot captured:
    // deleting an uncaptured segment would strand live entries across a
    // restart.
    let last_snapshot = inner.last_snapshot.load(Ordering::SeqCst);
    let snapshot_cover = journal
        .log_info(last_snapshot)
        .map(|info| info.position)
        .unwrap_or(last_snapshot);
    let threshold = journal.appender_start().min(snapshot_cover);

    let ledger = inner.ledger.lock();
    let mut deleted = 0u64;
    for info in journal.segments() {
        if info.position >= threshold || info.limit > threshold {
            break;
        }
        if ledger.count(info.position) == 0 {
            journal.delete(info.position)?;
            deleted += 1;
        }
    }
    if deleted > 0 {
        info!(deleted, threshold, "gc deleted unreferenced segments");
    } else {
        debug!(threshold, "gc found nothing to delete");
    }
    Ok(())
}

pub(crate) fn snapshot_index_inner(inner: &StoreInner, force: bool) -> Result<()> {
    let mut slot = inner.index.write();
    let journal_guard = inner.journal.read();
    let journal = journal_guard.as_ref().ok_or(StoreError::NotOpen)?;
    snapshot_locked(inner, &mut slot, journal, force)
}

/// The snapshot protocol, with the write lock already held.
///
/// Suspend (write sentinels, close), clone `dirty.index` into `temp.index`,
/// rename to `%016x.index`, delete the previous snapshot, resume. Any
/// publication failure keeps the prior snapshot and still resumes.
pub(crate) fn snapshot_locked(
    inner: &StoreInner,
    slot: &mut IndexSlot,
    journal: &Journal,
    force: bool,
) -> Result<()> {
    if slot.state != IndexState::OpenDirty {
        return Err(StoreError::NotOpen);
    }

    // The snapshot claims to cover `position`; the journal must be durable
    // up to it first.
    journal.sync()?;
    let position = journal.appender_limit();
    let previous = inner.last_snapshot.load(Ordering::SeqCst);
    if !force && position == previous {
        debug!(position, "snapshot skipped, no new appends");
        return Ok(());
    }

    // Suspend.
    {
        let index = slot.store.as_ref().ok_or(StoreError::NotOpen)?;
        let refs = inner.ledger.lock().encode();
        index.put_sync(keys::LOG_REFS_KEY, &refs)?;
        index.put_sync(keys::DIRTY_KEY, &[0])?;
    }
    slot.state = IndexState::OpenCleanForSnapshot;
    drop(slot.store.take());
    slot.state = IndexState::Closed;

    let published = publish_snapshot(&inner.config, position);

    // Resume regardless of the publication outcome.
    let reopened = retry(&inner.stop, "reopen index after snapshot", || {
        IndexStore::open(&inner.config.dirty_index_dir(), &inner.config)
    })?;
    reopened.put(keys::DIRTY_KEY, &[1])?;
    slot.store = Some(reopened);
    slot.state = IndexState::OpenDirty;

    match published {
        Ok(()) => {
            if previous != position {
                let stale = inner.config.snapshot_dir(previous);
                if stale.exists() {
                    if let Err(error) = fs::remove_dir_all(&stale) {
                        warn!(position = previous, %error, "failed to delete previous snapshot");
                    }
                }
            }
            inner.last_snapshot.store(position, Ordering::SeqCst);
            info!(position, "index snapshot published");
            Ok(())
        }
        Err(error) => {
            let temp = inner.config.temp_index_dir();
            if temp.exists() {
                let _ = fs::remove_dir_all(&temp);
            }
            warn!(%error, "snapshot publication failed, keeping previous snapshot");
            Err(error)
        }
    }
}

fn publish_snapshot(config: &StoreConfig, position: u64) -> Result<()> {
    let temp = config.temp_index_dir();
    if temp.exists() {
        fs::remove_dir_all(&temp)?;
    }
    clone_dir(&config.dirty_index_dir(), &temp)?;
    fs::rename(&temp, config.snapshot_dir(position))?;
    Ok(())
}

/// Close everything, delete every journal segment and index directory, and
/// reopen empty. Both write locks must be held.
pub(crate) fn purge_locked(
    inner: &Arc<StoreInner>,
    slot: &mut IndexSlot,
    journal_slot: &mut Option<Journal>,
) -> Result<()> {
    slot.state = IndexState::Closed;
    drop(slot.store.take());
    *journal_slot = None;

    for entry in fs::read_dir(&inner.config.directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            if name.ends_with(".index") {
                fs::remove_dir_all(entry.path())?;
            }
        } else if name.ends_with(".log") {
            fs::remove_file(entry.path())?;
        }
    }

    inner.ledger.lock().clear();
    inner.last_snapshot.store(0, Ordering::SeqCst);

    let journal = Journal::open(&inner.config)?;
    arm_rotation(inner, &journal);
    *journal_slot = Some(journal);

    let index = IndexStore::open(&inner.config.dirty_index_dir(), &inner.config)?;
    index.put_sync(keys::DIRTY_KEY, &[1])?;
    slot.store = Some(index);
    slot.state = IndexState::OpenDirty;

    info!("store purged");
    Ok(())
}
