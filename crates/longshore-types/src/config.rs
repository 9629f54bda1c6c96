//! Engine configuration.

use std::path::{Path, PathBuf};

use longshore_error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Block compression applied by the index library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexCompression {
    /// Snappy block compression.
    #[default]
    Snappy,
    /// No compression.
    None,
}

/// Configuration for a [`StoreConfig::directory`]-rooted message store.
///
/// Builder-style setters cover the non-default knobs; call
/// [`StoreConfig::validated`] before opening a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data directory holding journal segments and index directories.
    pub directory: PathBuf,

    /// Fsync the journal after units of work that requested durability.
    ///
    /// Default: `true`.
    pub sync: bool,

    /// Verify index block checksums on every read.
    ///
    /// Default: `false`.
    pub verify_checksums: bool,

    /// Enable the index library's strict internal integrity checks.
    ///
    /// Default: `false`.
    pub paranoid_checks: bool,

    /// Rotation threshold per journal segment, in bytes.
    ///
    /// Default: 100 MiB.
    pub log_size: u64,

    /// Journal append buffer size, in bytes.
    ///
    /// Default: 4 MiB.
    pub log_write_buffer_size: usize,

    /// Open-file budget handed to the index library.
    pub index_max_open_files: Option<i32>,

    /// Index block restart interval, passed through.
    pub index_block_restart_interval: Option<i32>,

    /// Index block size in bytes, passed through.
    pub index_block_size: Option<usize>,

    /// Index memtable write buffer size in bytes, passed through.
    pub index_write_buffer_size: Option<usize>,

    /// Index block compression.
    pub index_compression: IndexCompression,

    /// Index block cache capacity in bytes, passed through.
    pub index_cache_size: Option<usize>,

    /// Comma-separated list of index factory identifiers, tried in order.
    ///
    /// Default: `"rocksdb"`.
    pub index_factory: String,
}

impl StoreConfig {
    /// Configuration with documented defaults rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sync: true,
            verify_checksums: false,
            paranoid_checks: false,
            log_size: 100 * 1024 * 1024,
            log_write_buffer_size: 4 * 1024 * 1024,
            index_max_open_files: None,
            index_block_restart_interval: None,
            index_block_size: None,
            index_write_buffer_size: None,
            index_compression: IndexCompression::default(),
            index_cache_size: None,
            index_factory: "rocksdb".to_owned(),
        }
    }

    /// Set whether syncing units of work fsync the journal.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Set the journal segment rotation threshold.
    #[must_use]
    pub fn with_log_size(mut self, log_size: u64) -> Self {
        self.log_size = log_size;
        self
    }

    /// Set the journal append buffer size.
    #[must_use]
    pub fn with_log_write_buffer_size(mut self, bytes: usize) -> Self {
        self.log_write_buffer_size = bytes;
        self
    }

    /// Set the index factory list.
    #[must_use]
    pub fn with_index_factory(mut self, factory: impl Into<String>) -> Self {
        self.index_factory = factory.into();
        self
    }

    /// Set the index block compression.
    #[must_use]
    pub fn with_index_compression(mut self, compression: IndexCompression) -> Self {
        self.index_compression = compression;
        self
    }

    /// Path of the live index directory.
    pub fn dirty_index_dir(&self) -> PathBuf {
        self.directory.join("dirty.index")
    }

    /// Path of the transient snapshot staging directory.
    pub fn temp_index_dir(&self) -> PathBuf {
        self.directory.join("temp.index")
    }

    /// Path of the snapshot directory covering `position`.
    pub fn snapshot_dir(&self, position: u64) -> PathBuf {
        self.directory.join(format!("{position:016x}.index"))
    }

    /// Path of the journal segment starting at `position`.
    pub fn segment_path(&self, position: u64) -> PathBuf {
        self.directory.join(format!("{position:016x}.log"))
    }

    /// Reject degenerate values.
    ///
    /// A journal segment must hold at least one record frame, and the
    /// factory list must not be empty.
    pub fn validated(self) -> Result<Self> {
        if self.directory.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig {
                detail: "directory is required".to_owned(),
            });
        }
        if self.log_size < 4096 {
            return Err(StoreError::InvalidConfig {
                detail: format!("log_size {} is below the 4 KiB floor", self.log_size),
            });
        }
        if self.index_factory.trim().is_empty() {
            return Err(StoreError::InvalidConfig {
                detail: "index_factory is empty".to_owned(),
            });
        }
        Ok(self)
    }
}

impl AsRef<Path> for StoreConfig {
    fn as_ref(&self) -> &Path {
        &self.directory
    }
}
