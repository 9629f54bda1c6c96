//! Index factory selection.
//!
//! `index_factory` is a comma-separated list of implementation identifiers
//! tried in order. Identifiers resolve against a static table; unknown names
//! are skipped with a warning so a configuration written for a build with
//! more factories still opens on this one.

use longshore_error::{Result, StoreError};
use tracing::warn;

/// An embedded KV implementation the index can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFactory {
    /// RocksDB. Immutable SSTs make hard-linked snapshots of the index
    /// directory stable while the live index keeps moving.
    RocksDb,
}

impl IndexFactory {
    /// The static factory table: identifier → implementation.
    pub const TABLE: &'static [(&'static str, IndexFactory)] = &[("rocksdb", IndexFactory::RocksDb)];

    /// Resolve the first known identifier in `list`.
    pub fn select(list: &str) -> Result<Self> {
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            for (id, factory) in Self::TABLE {
                if name.eq_ignore_ascii_case(id) {
                    return Ok(*factory);
                }
            }
            warn!(name, "unknown index factory, trying next");
        }
        Err(StoreError::NoIndexFactory {
            list: list.to_owned(),
        })
    }
}
