//! The log-reference ledger.
//!
//! Tracks, per journal segment, how many live queue entries reference a
//! message stored in that segment. A segment whose counter is absent (zero)
//! and which lies fully below the snapshot boundary is eligible for
//! deletion by gc.
//!
//! The ledger is the single source of truth for segment liveness: it is
//! persisted into the index under the `:log-refs` sentinel key before every
//! index close, and journal segments carry no back-pointers to the index.

use std::collections::BTreeMap;

use longshore_error::{Result, StoreError};
use tracing::warn;

/// In-memory map `segment position → live reference count`.
///
/// Only non-zero counters are kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogRefLedger {
    counters: BTreeMap<u64, u64>,
}

impl LogRefLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for the segment at `file_position`.
    pub fn incr(&mut self, file_position: u64) {
        *self.counters.entry(file_position).or_insert(0) += 1;
    }

    /// Decrement the counter for the segment at `file_position`, removing
    /// the entry when it reaches zero.
    ///
    /// Decrementing an absent entry indicates double accounting upstream;
    /// it is logged and otherwise ignored so recovery can proceed.
    pub fn decr(&mut self, file_position: u64) {
        match self.counters.get_mut(&file_position) {
            Some(counter) if *counter > 1 => *counter -= 1,
            Some(_) => {
                self.counters.remove(&file_position);
            }
            None => warn!(file_position, "decrement on unreferenced segment"),
        }
    }

    /// Live reference count for the segment at `file_position`.
    pub fn count(&self, file_position: u64) -> u64 {
        self.counters.get(&file_position).copied().unwrap_or(0)
    }

    /// Copy of the counter map.
    pub fn counts(&self) -> BTreeMap<u64, u64> {
        self.counters.clone()
    }

    /// Drop every counter.
    pub fn clear(&mut self) {
        self.counters.clear();
    }

    /// Serialize for the `:log-refs` sentinel key.
    ///
    /// The encoding is a JSON object keyed by the stringified segment
    /// position; the key domain is `u64`, converted at this boundary.
    pub fn encode(&self) -> Vec<u8> {
        let stringified: BTreeMap<String, u64> = self
            .counters
            .iter()
            .map(|(position, count)| (position.to_string(), *count))
            .collect();
        serde_json::to_vec(&stringified).expect("string-keyed map serializes")
    }

    /// Deserialize a `:log-refs` value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let stringified: BTreeMap<String, u64> = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::codec(format!("bad log-refs encoding: {e}")))?;
        let mut counters = BTreeMap::new();
        for (position, count) in stringified {
            let position = position
                .parse::<u64>()
                .map_err(|_| StoreError::codec(format!("bad log-refs key '{position}'")))?;
            if count > 0 {
                counters.insert(position, count);
            }
        }
        Ok(Self { counters })
    }
}
