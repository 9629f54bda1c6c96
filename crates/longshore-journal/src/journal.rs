//! The record journal: numbered append-only segment files.
//!
//! Segments are named `%016x.log`, the hex name being the segment's starting
//! byte offset in the logical append stream. Logical positions are therefore
//! monotonically increasing across all segments, and a position is resolved
//! to a segment by finding the [`LogInfo`] whose `[position, limit)` range
//! covers it.
//!
//! Appends serialize on an internal lock and go through a write buffer;
//! appended records become readable by other handles after [`Journal::flush`]
//! and durable after [`Journal::sync`]. Reads never take the append lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use longshore_error::{Result, StoreError};
use longshore_types::StoreConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::record::{encode_frame, read_frame, RecordKind};

/// Placement of one segment file in the logical append stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    /// Starting byte offset of this segment in the logical stream.
    pub position: u64,
    /// End of the segment: `position + size`.
    pub limit: u64,
}

impl LogInfo {
    /// Segment size in bytes.
    pub fn size(&self) -> u64 {
        self.limit - self.position
    }

    /// Whether `pos` falls inside this segment.
    pub fn contains(&self, pos: u64) -> bool {
        self.position <= pos && pos < self.limit
    }
}

type RotateCallback = Box<dyn Fn(u64) + Send + Sync>;

struct Appender {
    writer: BufWriter<File>,
    /// Starting position of the segment currently open for appends.
    start: u64,
    /// Next logical position to be written.
    position: u64,
}

/// Append-only record journal over numbered segment files.
pub struct Journal {
    directory: PathBuf,
    rotate_size: u64,
    write_buffer_size: usize,
    appender: Mutex<Appender>,
    /// Sealed segment limits; the tail's live limit is `appender_limit`.
    files: Mutex<BTreeMap<u64, u64>>,
    /// Highest logical position published to readers.
    appender_limit: AtomicU64,
    /// Starting position of the segment open for appends.
    appender_start: AtomicU64,
    on_rotate: Mutex<Option<RotateCallback>>,
}

impl Journal {
    /// Open the journal in `config.directory`, scanning existing segments.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;

        let mut files = BTreeMap::new();
        for entry in fs::read_dir(&config.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(position) = parse_segment_name(&name.to_string_lossy()) else {
                continue;
            };
            let size = entry.metadata()?.len();
            files.insert(position, position + size);
        }

        let tail = files.iter().next_back().map(|(&start, &limit)| (start, limit));
        let (start, limit) = match tail {
            Some(pair) => pair,
            None => {
                files.insert(0, 0);
                (0, 0)
            }
        };

        let path = config.segment_path(start);
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;

        info!(
            directory = %config.directory.display(),
            segments = files.len(),
            appender_limit = limit,
            "journal opened"
        );

        Ok(Self {
            directory: config.directory.clone(),
            rotate_size: config.log_size,
            write_buffer_size: config.log_write_buffer_size,
            appender: Mutex::new(Appender {
                writer: BufWriter::with_capacity(config.log_write_buffer_size, file),
                start,
                position: limit,
            }),
            files: Mutex::new(files),
            appender_limit: AtomicU64::new(limit),
            appender_start: AtomicU64::new(start),
            on_rotate: Mutex::new(None),
        })
    }

    /// Register a callback invoked with the new segment's position whenever
    /// the journal rotates to a fresh tail segment.
    pub fn set_rotate_listener(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_rotate.lock() = Some(Box::new(callback));
    }

    /// Append one record, rotating first if the tail segment would exceed
    /// its size threshold. Returns the record's logical position.
    pub fn append(&self, kind: RecordKind, payload: &[u8]) -> Result<u64> {
        let frame = encode_frame(kind, payload);
        let mut ap = self.appender.lock();

        let tail_size = ap.position - ap.start;
        if tail_size > 0 && tail_size + frame.len() as u64 > self.rotate_size {
            self.rotate_locked(&mut ap)?;
        }

        let record_pos = ap.position;
        ap.writer.write_all(&frame)?;
        ap.position += frame.len() as u64;
        self.appender_limit.store(ap.position, Ordering::Release);
        Ok(record_pos)
    }

    fn rotate_locked(&self, ap: &mut Appender) -> Result<()> {
        ap.writer.flush()?;
        ap.writer.get_ref().sync_data()?;

        let sealed = LogInfo {
            position: ap.start,
            limit: ap.position,
        };
        let new_start = ap.position;
        let path = self.segment_path(new_start);
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;

        {
            let mut files = self.files.lock();
            files.insert(sealed.position, sealed.limit);
            files.insert(new_start, new_start);
        }
        ap.writer = BufWriter::with_capacity(self.write_buffer_size, file);
        ap.start = new_start;
        self.appender_start.store(new_start, Ordering::Release);

        info!(
            sealed_position = sealed.position,
            sealed_size = sealed.size(),
            new_position = new_start,
            "journal rotated"
        );

        if let Some(callback) = self.on_rotate.lock().as_ref() {
            callback(new_start);
        }
        Ok(())
    }

    /// Write buffered appends to the OS so other handles can read them.
    pub fn flush(&self) -> Result<()> {
        self.appender.lock().writer.flush()?;
        Ok(())
    }

    /// Flush and fsync the tail segment.
    pub fn sync(&self) -> Result<()> {
        let mut ap = self.appender.lock();
        ap.writer.flush()?;
        ap.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Read the record at `pos`. Returns the raw kind code, the verified
    /// payload, and the position of the next record.
    pub fn read(&self, pos: u64) -> Result<(u8, Vec<u8>, u64)> {
        let info = self
            .log_info(pos)
            .ok_or(StoreError::PositionNotFound { position: pos })?;
        let mut reader = self.reader_at(&info, pos)?;
        let frame = read_frame(&mut reader, pos, info.limit - pos)?;
        Ok((frame.kind, frame.payload, pos + frame.len))
    }

    /// Read the payload of the record at `pos`, checking that it has the
    /// expected length.
    pub fn read_payload(&self, pos: u64, len: u32) -> Result<Vec<u8>> {
        let (_, payload, _) = self.read(pos)?;
        if payload.len() != len as usize {
            return Err(StoreError::corrupt(
                pos,
                format!("expected {len}-byte payload, found {}", payload.len()),
            ));
        }
        Ok(payload)
    }

    fn reader_at(&self, info: &LogInfo, pos: u64) -> Result<BufReader<File>> {
        let mut file = File::open(self.segment_path(info.position))?;
        file.seek(SeekFrom::Start(pos - info.position))?;
        Ok(BufReader::new(file))
    }

    /// The segment covering `pos`, if any.
    pub fn log_info(&self, pos: u64) -> Option<LogInfo> {
        let files = self.files.lock();
        let (&position, &limit) = files.range(..=pos).next_back()?;
        let limit = if Some(&position) == files.keys().next_back() {
            self.appender_limit.load(Ordering::Acquire).max(limit)
        } else {
            limit
        };
        (pos < limit).then_some(LogInfo { position, limit })
    }

    /// Snapshot of all segments, oldest first.
    pub fn segments(&self) -> Vec<LogInfo> {
        let files = self.files.lock();
        let tail = files.keys().next_back().copied();
        files
            .iter()
            .map(|(&position, &limit)| LogInfo {
                position,
                limit: if Some(position) == tail {
                    self.appender_limit.load(Ordering::Acquire).max(limit)
                } else {
                    limit
                },
            })
            .collect()
    }

    /// Delete the sealed segment starting at `position`.
    ///
    /// Callers must have proved the segment holds no live references and is
    /// fully covered by a snapshot. The tail segment is never deletable.
    pub fn delete(&self, position: u64) -> Result<()> {
        let mut files = self.files.lock();
        if !files.contains_key(&position) {
            return Err(StoreError::PositionNotFound { position });
        }
        if Some(&position) == files.keys().next_back() {
            return Err(StoreError::SegmentInUse { position });
        }
        fs::remove_file(self.segment_path(position))?;
        files.remove(&position);
        info!(position, "journal segment deleted");
        Ok(())
    }

    /// Discard everything at and after `pos`, so the next append continues
    /// from `pos`. Used by recovery after finding an unreadable tail.
    pub fn truncate(&self, pos: u64) -> Result<()> {
        let mut ap = self.appender.lock();
        ap.writer.flush()?;

        if pos > ap.position {
            return Err(StoreError::PositionNotFound { position: pos });
        }

        let mut files = self.files.lock();
        // Drop whole segments that start at or after the cut, keeping one to
        // append into when the cut lands exactly on the first boundary.
        let keep_at_cut = files.range(..pos).next_back().is_none();
        let doomed: Vec<u64> = files.range(pos.max(1)..).map(|(&p, _)| p).collect();
        for position in doomed {
            if keep_at_cut && position == pos {
                continue;
            }
            fs::remove_file(self.segment_path(position))?;
            files.remove(&position);
            warn!(position, "journal segment discarded by truncation");
        }

        let (start, limit) = files
            .range(..=pos)
            .next_back()
            .map(|(p, l)| (*p, *l))
            .ok_or(StoreError::PositionNotFound { position: pos })?;

        let path = self.segment_path(start);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(pos - start)?;
        file.sync_data()?;
        let mut file = file;
        file.seek(SeekFrom::End(0))?;

        if limit != pos {
            warn!(
                position = pos,
                discarded = limit.saturating_sub(pos),
                "journal tail truncated"
            );
        }

        files.insert(start, pos);
        ap.writer = BufWriter::with_capacity(self.write_buffer_size, file);
        ap.start = start;
        ap.position = pos;
        self.appender_limit.store(pos, Ordering::Release);
        self.appender_start.store(start, Ordering::Release);
        Ok(())
    }

    /// Highest logical position published to readers.
    pub fn appender_limit(&self) -> u64 {
        self.appender_limit.load(Ordering::Acquire)
    }

    /// Starting position of the segment currently open for appends.
    pub fn appender_start(&self) -> u64 {
        self.appender_start.load(Ordering::Acquire)
    }

    fn segment_path(&self, position: u64) -> PathBuf {
        self.directory.join(format!("{position:016x}.log"))
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(error) = self.sync() {
            warn!(%error, "journal sync on close failed");
        } else {
            debug!("journal closed");
        }
    }
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".log")?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

#[cfg(test)]
mod tests {
    use longshore_types::StoreConfig;
    use tempfile::tempdir;

    use super::*;

    fn test_config(dir: &std::path::Path) -> StoreConfig {
        StoreConfig::new(dir).with_log_size(4096)
    }

    #[test]
    fn append_read_roundtrip() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(&test_config(dir.path())).unwrap();

        let p1 = journal.append(RecordKind::AddMessage, b"first").unwrap();
        let p2 = journal.append(RecordKind::MapEntry, b"second").unwrap();
        journal.flush().unwrap();

        let (kind, payload, next) = journal.read(p1).unwrap();
        assert_eq!(kind, RecordKind::AddMessage.code());
        assert_eq!(payload, b"first");
        assert_eq!(next, p2);

        let (kind, payload, next) = journal.read(p2).unwrap();
        assert_eq!(kind, RecordKind::MapEntry.code());
        assert_eq!(payload, b"second");
        assert_eq!(next, journal.appender_limit());
    }

    #[test]
    fn positions_are_logical_across_rotation() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(&test_config(dir.path())).unwrap();

        let payload = vec![7u8; 1024];
        let mut positions = Vec::new();
        for _ in 0..16 {
            positions.push(journal.append(RecordKind::AddMessage, &payload).unwrap());
        }
        journal.flush().unwrap();

        assert!(journal.segments().len() > 1, "expected a rotation");
        assert!(journal.appender_start() > 0);
        for pos in positions {
            let (_, read, _) = journal.read(pos).unwrap();
            assert_eq!(read, payload);
        }
    }

    #[test]
    fn reopen_rebuilds_segment_table() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let positions: Vec<u64>;
        let limit;
        {
            let journal = Journal::open(&config).unwrap();
            positions = (0..8)
                .map(|i| {
                    journal
                        .append(RecordKind::AddMessage, &vec![i as u8; 900])
                        .unwrap()
                })
                .collect();
            limit = journal.appender_limit();
        }

        let journal = Journal::open(&config).unwrap();
        assert_eq!(journal.appender_limit(), limit);
        for (i, pos) in positions.iter().enumerate() {
            let (_, payload, _) = journal.read(*pos).unwrap();
            assert_eq!(payload, vec![i as u8; 900]);
        }
    }

    #[test]
    fn rotation_fires_listener() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(&test_config(dir.path())).unwrap();
        let rotations = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen = rotations.clone();
        journal.set_rotate_listener(move |position| {
            assert!(position > 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..16 {
            journal.append(RecordKind::AddMessage, &[0u8; 1024]).unwrap();
        }
        assert!(rotations.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn delete_refuses_tail_segment() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(&test_config(dir.path())).unwrap();
        journal.append(RecordKind::AddMessage, b"x").unwrap();

        let tail = journal.appender_start();
        assert!(matches!(
            journal.delete(tail),
            Err(StoreError::SegmentInUse { .. })
        ));
    }

    #[test]
    fn delete_removes_sealed_segment() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(&test_config(dir.path())).unwrap();
        let first = journal.append(RecordKind::AddMessage, &[1u8; 3000]).unwrap();
        journal.append(RecordKind::AddMessage, &[2u8; 3000]).unwrap();
        assert_eq!(journal.segments().len(), 2);

        journal.delete(0).unwrap();
        assert_eq!(journal.segments().len(), 1);
        assert!(matches!(
            journal.read(first),
            Err(StoreError::PositionNotFound { .. })
        ));
    }

    #[test]
    fn corrupt_tail_is_detected_and_truncatable() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let good;
        let bad;
        {
            let journal = Journal::open(&config).unwrap();
            good = journal.append(RecordKind::AddMessage, b"keep").unwrap();
            bad = journal.append(RecordKind::AddMessage, b"mangle").unwrap();
        }

        // Flip a payload byte of the second record on disk.
        let path = config.segment_path(0);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let journal = Journal::open(&config).unwrap();
        assert!(journal.read(good).is_ok());
        let err = journal.read(bad).unwrap_err();
        assert!(err.is_torn_tail());

        journal.truncate(bad).unwrap();
        assert_eq!(journal.appender_limit(), bad);
        let replacement = journal.append(RecordKind::AddMessage, b"fresh").unwrap();
        assert_eq!(replacement, bad);
        journal.flush().unwrap();
        let (_, payload, _) = journal.read(bad).unwrap();
        assert_eq!(payload, b"fresh");
    }

    #[test]
    fn truncate_drops_later_segments() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(&test_config(dir.path())).unwrap();
        let mut positions = Vec::new();
        for i in 0..16 {
            positions.push(journal.append(RecordKind::AddMessage, &vec![i as u8; 1024]).unwrap());
        }
        assert!(journal.segments().len() > 2);

        journal.truncate(positions[2]).unwrap();
        assert_eq!(journal.segments().len(), 1);
        assert_eq!(journal.appender_limit(), positions[2]);
        journal.flush().unwrap();
        let (_, payload, _) = journal.read(positions[1]).unwrap();
        assert_eq!(payload, vec![1u8; 1024]);
    }
}
