//! The index store wrapper.

use std::path::Path;

use longshore_error::{Result, StoreError};
use longshore_types::keys::next_prefix;
use longshore_types::{IndexCompression, StoreConfig};
use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, Direction, IteratorMode, Options, ReadOptions,
    Snapshot, WriteBatch, WriteOptions, DB,
};
use tracing::debug;

use crate::factory::IndexFactory;

/// A key/value pair yielded by a cursor.
pub type IndexEntry = (Box<[u8]>, Box<[u8]>);

/// An open index directory.
pub struct IndexStore {
    db: DB,
    verify_checksums: bool,
}

impl IndexStore {
    /// Open (creating if missing) the index at `path` with the configured
    /// factory and pass-through options.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        match IndexFactory::select(&config.index_factory)? {
            IndexFactory::RocksDb => Self::open_rocksdb(path, config),
        }
    }

    fn open_rocksdb(path: &Path, config: &StoreConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_paranoid_checks(config.paranoid_checks);
        opts.set_compression_type(match config.index_compression {
            IndexCompression::Snappy => DBCompressionType::Snappy,
            IndexCompression::None => DBCompressionType::None,
        });
        if let Some(n) = config.index_max_open_files {
            opts.set_max_open_files(n);
        }
        if let Some(n) = config.index_write_buffer_size {
            opts.set_write_buffer_size(n);
        }

        let mut block = BlockBasedOptions::default();
        if let Some(n) = config.index_block_size {
            block.set_block_size(n);
        }
        if let Some(n) = config.index_block_restart_interval {
            block.set_block_restart_interval(n);
        }
        if let Some(n) = config.index_cache_size {
            block.set_block_cache(&Cache::new_lru_cache(n));
        }
        opts.set_block_based_table_factory(&block);

        let db = DB::open(&opts, path).map_err(StoreError::index)?;
        debug!(path = %path.display(), "index opened");
        Ok(Self {
            db,
            verify_checksums: config.verify_checksums,
        })
    }

    fn read_opts(&self) -> ReadOptions {
        let mut opts = ReadOptions::default();
        opts.set_verify_checksums(self.verify_checksums);
        opts
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get_opt(key, &self.read_opts())
            .map_err(StoreError::index)
    }

    /// Direct put, buffered by the library.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put_opt(key, value, &WriteOptions::default())
            .map_err(StoreError::index)
    }

    /// Synchronous put: durable before returning. Used for the sentinel
    /// keys written right before the index closes.
    pub fn put_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.put_opt(key, value, &opts).map_err(StoreError::index)
    }

    /// Direct delete.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete_opt(key, &WriteOptions::default())
            .map_err(StoreError::index)
    }

    /// Apply a batch atomically.
    pub fn write_batch(&self, batch: IndexBatch) -> Result<()> {
        self.db
            .write_opt(batch.batch, &WriteOptions::default())
            .map_err(StoreError::index)
    }

    /// Take a point-in-time read snapshot.
    pub fn snapshot(&self) -> IndexSnapshot<'_> {
        IndexSnapshot {
            snapshot: self.db.snapshot(),
            verify_checksums: self.verify_checksums,
        }
    }

    /// Cursor over every entry whose key starts with `prefix`, in key order.
    pub fn prefix_scan<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<IndexEntry>> + 'a {
        let mut opts = self.read_opts();
        if let Some(upper) = next_prefix(prefix) {
            opts.set_iterate_upper_bound(upper);
        }
        self.db
            .iterator_opt(IteratorMode::From(prefix, Direction::Forward), opts)
            .map(map_entry)
    }

    /// Cursor over keys in `[start, end)`, in key order.
    pub fn range_scan<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = Result<IndexEntry>> + 'a {
        let mut opts = self.read_opts();
        opts.set_iterate_upper_bound(end.to_vec());
        self.db
            .iterator_opt(IteratorMode::From(start, Direction::Forward), opts)
            .map(map_entry)
    }

    /// Cursor over the keys (only) of a prefix family.
    pub fn prefix_keys_scan<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<Box<[u8]>>> + 'a {
        self.prefix_scan(prefix).map(|item| item.map(|(k, _)| k))
    }

    /// Greatest key starting with `prefix`, if any.
    pub fn last_key_with_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut iter = self.db.raw_iterator_opt(self.read_opts());
        last_key_with_prefix_raw(&mut iter, prefix)
    }
}

/// A point-in-time view of the index.
///
/// Every read through the snapshot threads it into the read options, so bulk
/// scans see one consistent state unaffected by concurrent writes.
pub struct IndexSnapshot<'a> {
    snapshot: Snapshot<'a>,
    verify_checksums: bool,
}

impl<'a> IndexSnapshot<'a> {
    fn read_opts(&self) -> ReadOptions {
        let mut opts = ReadOptions::default();
        opts.set_verify_checksums(self.verify_checksums);
        opts
    }

    /// Point lookup against the snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.snapshot
            .get_opt(key, self.read_opts())
            .map_err(StoreError::index)
    }

    /// Cursor over every snapshot entry whose key starts with `prefix`.
    pub fn prefix_scan(&self, prefix: &[u8]) -> impl Iterator<Item = Result<IndexEntry>> + '_ {
        let mut opts = self.read_opts();
        if let Some(upper) = next_prefix(prefix) {
            opts.set_iterate_upper_bound(upper);
        }
        self.snapshot
            .iterator_opt(IteratorMode::From(prefix, Direction::Forward), opts)
            .map(map_entry)
    }

    /// Cursor over snapshot keys in `[start, end)`.
    pub fn range_scan(&self, start: &[u8], end: &[u8]) -> impl Iterator<Item = Result<IndexEntry>> + '_ {
        let mut opts = self.read_opts();
        opts.set_iterate_upper_bound(end.to_vec());
        self.snapshot
            .iterator_opt(IteratorMode::From(start, Direction::Forward), opts)
            .map(map_entry)
    }

    /// Cursor over the keys (only) of a snapshot prefix family.
    pub fn prefix_keys_scan(&self, prefix: &[u8]) -> impl Iterator<Item = Result<Box<[u8]>>> + '_ {
        self.prefix_scan(prefix).map(|item| item.map(|(k, _)| k))
    }

    /// Greatest snapshot key starting with `prefix`, if any.
    pub fn last_key_with_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut iter = self.snapshot.raw_iterator_opt(self.read_opts());
        last_key_with_prefix_raw(&mut iter, prefix)
    }
}

/// An atomic batch of index mutations.
#[derive(Default)]
pub struct IndexBatch {
    batch: WriteBatch,
    ops: usize,
}

impl IndexBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.batch.put(key, value);
        self.ops += 1;
    }

    /// Stage a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.batch.delete(key);
        self.ops += 1;
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.ops
    }

    /// Whether the batch stages nothing.
    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }
}

fn map_entry(
    item: std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>,
) -> Result<IndexEntry> {
    item.map_err(StoreError::index)
}

fn last_key_with_prefix_raw<D: rocksdb::DBAccess>(
    iter: &mut rocksdb::DBRawIteratorWithThreadMode<'_, D>,
    prefix: &[u8],
) -> Result<Option<Vec<u8>>> {
    match next_prefix(prefix) {
        Some(upper) => {
            iter.seek_for_prev(&upper);
            // seek_for_prev lands on `upper` itself when that exact key
            // exists; it is outside the prefix family.
            if iter.valid() && iter.key() == Some(upper.as_slice()) {
                iter.prev();
            }
        }
        None => iter.seek_to_last(),
    }
    if !iter.valid() {
        iter.status().map_err(StoreError::index)?;
        return Ok(None);
    }
    Ok(iter
        .key()
        .filter(|key| key.starts_with(prefix))
        .map(<[u8]>::to_vec))
}

#[cfg(test)]
mod tests {
    use longshore_types::keys;
    use tempfile::tempdir;

    use super::*;

    fn open_store(dir: &Path) -> IndexStore {
        let config = StoreConfig::new(dir.join("data"));
        IndexStore::open(&dir.join("index"), &config).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn batch_applies_atomically() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put(b"stale", b"x").unwrap();

        let mut batch = IndexBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"stale");
        assert_eq!(batch.len(), 3);
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"stale").unwrap(), None);
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put(b"k", b"before").unwrap();

        let snapshot = store.snapshot();
        store.put(b"k", b"after").unwrap();
        store.put(b"new", b"1").unwrap();

        assert_eq!(snapshot.get(b"k").unwrap(), Some(b"before".to_vec()));
        assert_eq!(snapshot.get(b"new").unwrap(), None);
        assert_eq!(store.get(b"k").unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        for seq in [3u64, 1, 2] {
            store
                .put(&keys::entry_key(7, seq), seq.to_string().as_bytes())
                .unwrap();
        }
        store.put(&keys::entry_key(8, 0), b"other queue").unwrap();
        store.put(&keys::queue_key(7), b"queue record").unwrap();

        let seqs: Vec<u64> = store
            .prefix_scan(&keys::entry_prefix(7))
            .map(|item| {
                let (key, _) = item.unwrap();
                keys::decode_entry_key(&key).unwrap().1
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let keys_only: Vec<u64> = store
            .prefix_keys_scan(&keys::entry_prefix(7))
            .map(|key| keys::decode_entry_key(&key.unwrap()).unwrap().1)
            .collect();
        assert_eq!(keys_only, vec![1, 2, 3]);
    }

    #[test]
    fn range_scan_is_half_open() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        for seq in 0..5u64 {
            store.put(&keys::entry_key(1, seq), b"v").unwrap();
        }

        let seqs: Vec<u64> = store
            .range_scan(&keys::entry_key(1, 1), &keys::entry_key(1, 4))
            .map(|item| keys::decode_entry_key(&item.unwrap().0).unwrap().1)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn last_key_with_prefix_finds_greatest() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        assert_eq!(
            store.last_key_with_prefix(&[keys::MESSAGE_PREFIX]).unwrap(),
            None
        );

        for msg in [5u64, 900, 17] {
            store.put(&keys::message_key(msg), b"loc").unwrap();
        }
        store.put(&keys::queue_key(1), b"q").unwrap();

        let last = store
            .last_key_with_prefix(&[keys::MESSAGE_PREFIX])
            .unwrap()
            .unwrap();
        assert_eq!(keys::decode_message_key(&last), Some(900));
    }
}
