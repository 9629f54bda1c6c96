//! # Longshore
//!
//! The persistent message store engine behind a messaging broker. Longshore
//! durably records queues, messages, queue-entry placements, and an
//! auxiliary key/value map, and supports crash recovery, point-in-time
//! index snapshots, and reclamation of obsolete journal segments.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    MessageStore                       │
//! │   recovery · unit-of-work commits · snapshot · gc     │
//! └──────────────┬──────────────────────┬─────────────────┘
//!                │                      │
//!        ┌───────▼───────┐      ┌───────▼────────┐
//!        │    Journal    │      │   IndexStore   │
//!        │ %016x.log     │      │  dirty.index/  │
//!        │ append-only,  │      │  sorted KV,    │
//!        │ checksummed   │      │  snapshots     │
//!        └───────────────┘      └────────────────┘
//! ```
//!
//! The journal is the source of truth; the index is a derived structure
//! rebuilt on startup from the newest hard-linked snapshot plus a replay of
//! the journal suffix. A per-segment reference ledger tracks which journal
//! segments still hold live messages so gc can delete the rest.
//!
//! ## Example
//!
//! ```no_run
//! use longshore::{
//!     MessageAction, MessageLoadRequest, MessageRecord, MessageStore, QueueEntryRecord,
//!     QueueRecord, StoreConfig, UnitOfWork,
//! };
//!
//! # fn main() -> longshore::Result<()> {
//! let store = MessageStore::start(StoreConfig::new("/var/lib/broker/store"))?;
//! store.add_queue_blocking(QueueRecord {
//!     queue_key: 1,
//!     metadata: b"orders".to_vec(),
//! })?;
//!
//! let mut uow = UnitOfWork::new();
//! let mut action = MessageAction::store(MessageRecord::new(42, b"hi".to_vec()));
//! action.enqueues.push(QueueEntryRecord {
//!     queue_key: 1,
//!     entry_seq: 0,
//!     msg_key: 42,
//!     size: 2,
//!     expiration: 0,
//!     message_locator: None,
//! });
//! uow.push_action(action);
//! store.store_blocking(vec![uow])?;
//!
//! let payloads = store.load_messages(&[MessageLoadRequest::by_key(42)])?;
//! assert_eq!(payloads[0].as_deref(), Some(&b"hi"[..]));
//! store.stop()?;
//! # Ok(())
//! # }
//! ```

pub use longshore_engine::{
    CompletionListener, MessageAction, MessageLoadRequest, MessageStore, QueueEntryRange,
    StoreCallback, TransferResult, UnitOfWork,
};
pub use longshore_error::{Result, StoreError};
pub use longshore_types::{
    IndexCompression, Locator, LocatorCell, MapEntryRecord, MessageRecord, QueueEntryRecord,
    QueueRecord, StoreConfig,
};
