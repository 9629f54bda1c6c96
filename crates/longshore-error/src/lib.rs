//! Error types for the Longshore message store.
//!
//! A single [`StoreError`] enum covers the whole engine. Errors fall into
//! three classes with different handling policies:
//!
//! - transient I/O (disk full, temporary filesystem errors) — retried by the
//!   engine's retry loop until the service is asked to stop
//! - corruption at the journal tail — the unreadable suffix is discarded
//!   during replay and recovery continues
//! - fatal (bad configuration, no usable index factory) — surfaced to the
//!   caller of `start()` immediately

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for Longshore operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// File I/O error from the journal or the data directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced by the embedded index library.
    #[error("index error: {detail}")]
    Index { detail: String },

    /// A journal record failed its checksum or could not be framed.
    #[error("journal corrupt at position {position}: {detail}")]
    JournalCorrupt { position: u64, detail: String },

    /// A journal record extends past the end of its segment file.
    #[error("journal truncated at position {position}")]
    JournalTruncated { position: u64 },

    /// No journal segment covers the requested logical position.
    #[error("no journal segment covers position {position}")]
    PositionNotFound { position: u64 },

    /// Attempt to delete the journal segment still open for appends.
    #[error("journal segment at position {position} is still in use")]
    SegmentInUse { position: u64 },

    /// An encoded record could not be decoded.
    #[error("codec error: {detail}")]
    Codec { detail: String },

    /// `index_factory` named no known index implementation.
    #[error("no usable index factory in {list:?}")]
    NoIndexFactory { list: String },

    /// Rejected configuration value.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// The data directory could not be used.
    #[error("unusable data directory: '{path}'")]
    BadDirectory { path: PathBuf },

    /// Operation requires the index to be open and dirty.
    #[error("store is not open")]
    NotOpen,

    /// The serial writer has shut down and can no longer accept work.
    #[error("store is stopping")]
    Stopping,
}

impl StoreError {
    /// Wrap an index-library error.
    pub fn index(detail: impl ToString) -> Self {
        Self::Index {
            detail: detail.to_string(),
        }
    }

    /// Wrap a record codec failure.
    pub fn codec(detail: impl Into<String>) -> Self {
        Self::Codec {
            detail: detail.into(),
        }
    }

    /// Corruption at a known journal position.
    pub fn corrupt(position: u64, detail: impl Into<String>) -> Self {
        Self::JournalCorrupt {
            position,
            detail: detail.into(),
        }
    }

    /// Whether this error must not be retried.
    ///
    /// Fatal errors abort `start()` instead of entering the retry loop;
    /// everything else is assumed to be a transient condition the operator
    /// can clear (low disk space, a flaky mount).
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoIndexFactory { .. }
                | Self::InvalidConfig { .. }
                | Self::BadDirectory { .. }
                | Self::Stopping
        )
    }

    /// Whether this error marks an unreadable journal suffix.
    ///
    /// Replay stops at the first such record and truncates the tail there.
    pub const fn is_torn_tail(&self) -> bool {
        matches!(
            self,
            Self::JournalCorrupt { .. } | Self::JournalTruncated { .. }
        )
    }
}

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
