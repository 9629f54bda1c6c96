//! Client and recovery engine for the Longshore message store.
//!
//! Orchestrates the journal, the index, and the log-reference ledger:
//!
//! - startup recovery: rebuild `dirty.index` from the newest snapshot and
//!   replay the journal suffix past its covered position
//! - unit-of-work commits through a serial writer queue
//! - point-in-time index snapshots by hard-linking the index directory
//! - garbage collection of journal segments with no live references
//! - message loads, queue-entry cursors, and bulk export/import

mod ledger;
mod reads;
mod recovery;
mod retry;
mod snapshot;
mod store;
mod transfer;
mod uow;

pub use reads::{MessageLoadRequest, QueueEntryRange};
pub use store::{MessageStore, StoreCallback};
pub use transfer::TransferResult;
pub use uow::{CompletionListener, MessageAction, UnitOfWork};
