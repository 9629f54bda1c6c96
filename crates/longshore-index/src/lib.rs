//! Sorted key/value index store for the Longshore message store.
//!
//! A thin wrapper over the embedded ordered KV library. The index is a
//! derived structure: it maps fixed-layout keys to encoded records for fast
//! lookup, while the journal remains the source of truth. The wrapper owns
//!
//! - factory selection (the `index_factory` configuration list)
//! - option pass-through (block size, cache, compression, checksums)
//! - atomic write batches
//! - point-in-time read snapshots threaded through read options
//! - prefix and range cursors, which rely on the key layout's property that
//!   lexicographic order equals numeric order

mod factory;
mod store;

pub use factory::IndexFactory;
pub use store::{IndexBatch, IndexEntry, IndexSnapshot, IndexStore};
