//! Journal record framing.
//!
//! Every record in a journal segment is framed as:
//!
//! ```text
//! ┌──────────┬──────────────┬────────────┬───────────────┐
//! │ kind (1) │ len (varint) │ crc32 (4)  │ payload (len) │
//! └──────────┴──────────────┴────────────┴───────────────┘
//! ```
//!
//! The checksum is CRC32 over the payload, little-endian. A zero kind byte
//! marks a torn or preallocated tail region; real kinds start at 1.

use std::io::Read;

use longshore_error::{Result, StoreError};
use longshore_types::varint::{read_varint, varint_len, write_varint};

/// Typed record kinds carried by the journal.
///
/// Code 4 (`RemoveMessage`) is reserved for forward compatibility; the
/// current writer never emits it and replay skips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Encoded queue record.
    AddQueue = 1,
    /// Varint queue key.
    RemoveQueue = 2,
    /// Raw message payload bytes.
    AddMessage = 3,
    /// Reserved; not emitted.
    RemoveMessage = 4,
    /// Encoded queue entry record.
    AddQueueEntry = 5,
    /// The removed entry's index key.
    RemoveQueueEntry = 6,
    /// Encoded map entry record; absent value deletes the key.
    MapEntry = 7,
}

impl RecordKind {
    /// Wire code of this kind.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code. Unknown codes return `None` and are skipped
    /// during replay.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::AddQueue),
            2 => Some(Self::RemoveQueue),
            3 => Some(Self::AddMessage),
            4 => Some(Self::RemoveMessage),
            5 => Some(Self::AddQueueEntry),
            6 => Some(Self::RemoveQueueEntry),
            7 => Some(Self::MapEntry),
            _ => None,
        }
    }
}

/// Smallest possible frame: kind + one-byte length + checksum.
pub const MIN_FRAME_LEN: u64 = 6;

/// Bytes a frame for `payload` occupies on disk.
pub fn frame_len(payload: &[u8]) -> u64 {
    1 + varint_len(payload.len() as u64) as u64 + 4 + payload.len() as u64
}

/// Encode a full frame for appending.
pub fn encode_frame(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_len(payload) as usize);
    buf.push(kind.code());
    write_varint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// A frame decoded from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw kind code; may be unknown to this writer.
    pub kind: u8,
    /// Verified payload bytes.
    pub payload: Vec<u8>,
    /// Total frame length on disk.
    pub len: u64,
}

/// Read and verify one frame from `reader`.
///
/// `position` is the logical position of the frame (for error reporting);
/// `available` bounds how many bytes the frame may occupy before running
/// into the end of published data. Short reads, zero kinds, and checksum
/// mismatches all surface as torn-tail errors so replay can truncate.
pub fn read_frame(reader: &mut impl Read, position: u64, available: u64) -> Result<Frame> {
    if available < MIN_FRAME_LEN {
        return Err(StoreError::JournalTruncated { position });
    }

    let mut kind = [0u8; 1];
    reader
        .read_exact(&mut kind)
        .map_err(|_| StoreError::JournalTruncated { position })?;
    let kind = kind[0];
    if kind == 0 {
        return Err(StoreError::JournalTruncated { position });
    }

    // Length varint, one byte at a time so we never read past the frame.
    let mut len_bytes = Vec::with_capacity(10);
    let (len, len_len) = loop {
        if len_bytes.len() >= 10 || 1 + len_bytes.len() as u64 >= available {
            return Err(StoreError::corrupt(position, "unterminated length varint"));
        }
        let mut byte = [0u8; 1];
        reader
            .read_exact(&mut byte)
            .map_err(|_| StoreError::JournalTruncated { position })?;
        len_bytes.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            match read_varint(&len_bytes) {
                Some(decoded) => break decoded,
                None => return Err(StoreError::corrupt(position, "bad length varint")),
            }
        }
    };

    let total = 1 + len_len as u64 + 4 + len;
    if total > available {
        return Err(StoreError::JournalTruncated { position });
    }

    let mut crc = [0u8; 4];
    reader
        .read_exact(&mut crc)
        .map_err(|_| StoreError::JournalTruncated { position })?;
    let expected = u32::from_le_bytes(crc);

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|_| StoreError::JournalTruncated { position })?;

    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(StoreError::corrupt(
            position,
            format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
        ));
    }

    Ok(Frame {
        kind,
        payload,
        len: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            RecordKind::AddQueue,
            RecordKind::RemoveQueue,
            RecordKind::AddMessage,
            RecordKind::RemoveMessage,
            RecordKind::AddQueueEntry,
            RecordKind::RemoveQueueEntry,
            RecordKind::MapEntry,
        ] {
            assert_eq!(RecordKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(RecordKind::from_code(0), None);
        assert_eq!(RecordKind::from_code(8), None);
    }

    #[test]
    fn frame_roundtrip() {
        let encoded = encode_frame(RecordKind::AddMessage, b"hello");
        assert_eq!(encoded.len() as u64, frame_len(b"hello"));
        let frame = read_frame(&mut encoded.as_slice(), 0, encoded.len() as u64).unwrap();
        assert_eq!(frame.kind, RecordKind::AddMessage.code());
        assert_eq!(frame.payload, b"hello");
        assert_eq!(frame.len, encoded.len() as u64);
    }

    #[test]
    fn short_frame_is_truncated() {
        let encoded = encode_frame(RecordKind::AddMessage, b"hello");
        for cut in 0..encoded.len() {
            let err = read_frame(&mut &encoded[..cut], 64, cut as u64).unwrap_err();
            assert!(err.is_torn_tail(), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn zero_kind_is_truncated() {
        let zeros = [0u8; 32];
        let err = read_frame(&mut &zeros[..], 0, 32).unwrap_err();
        assert!(matches!(err, StoreError::JournalTruncated { position: 0 }));
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let mut encoded = encode_frame(RecordKind::MapEntry, b"payload");
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let err = read_frame(&mut encoded.as_slice(), 128, encoded.len() as u64).unwrap_err();
        assert!(matches!(err, StoreError::JournalCorrupt { position: 128, .. }));
    }
}
