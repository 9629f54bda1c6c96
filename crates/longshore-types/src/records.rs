//! Durable record types and their codecs.
//!
//! Records are encoded with varints and length-delimited byte fields; the
//! encodings are stable on-disk formats shared by the journal, the index,
//! and the export/import streams. Decoding is strict: trailing bytes after
//! a record are a codec error.

use std::sync::Arc;

use longshore_error::{Result, StoreError};
use parking_lot::Mutex;

use crate::varint::{read_varint, write_varint};

/// Where a message payload sits in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    /// Logical journal position of the record holding the payload.
    pub position: u64,
    /// Payload length in bytes.
    pub length: u32,
}

/// Encoded size of a [`Locator`].
pub const LOCATOR_LEN: usize = 12;

impl Locator {
    /// Encode as 12 big-endian bytes.
    pub fn encode(&self) -> [u8; LOCATOR_LEN] {
        let mut buf = [0u8; LOCATOR_LEN];
        buf[..8].copy_from_slice(&self.position.to_be_bytes());
        buf[8..].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode from exactly 12 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != LOCATOR_LEN {
            return Err(StoreError::codec(format!(
                "locator must be {LOCATOR_LEN} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            position: u64::from_be_bytes(buf[..8].try_into().expect("sliced to 8 bytes")),
            length: u32::from_be_bytes(buf[8..].try_into().expect("sliced to 4 bytes")),
        })
    }
}

/// Shared mutable cell holding a message's latest locator.
///
/// A producer hands the same cell to the write unit of work and to later
/// enqueues; the commit path writes the locator once and every later reader
/// of the cell skips the index lookup.
#[derive(Debug, Clone, Default)]
pub struct LocatorCell(Arc<Mutex<Option<Locator>>>);

impl LocatorCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a locator into the cell.
    pub fn set(&self, locator: Locator) {
        *self.0.lock() = Some(locator);
    }

    /// Read the current locator, if one has been published.
    pub fn get(&self) -> Option<Locator> {
        *self.0.lock()
    }
}

/// A message presented to a write unit of work.
///
/// Immutable once committed; destroyed when no queue entry references it.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// Broker-assigned message key. Never zero for a real message.
    pub msg_key: u64,
    /// Opaque payload bytes, stored in the journal.
    pub payload: Vec<u8>,
    /// Optional shared cell to publish the commit-time locator into.
    pub locator: Option<LocatorCell>,
}

impl MessageRecord {
    /// Message without a locator cell.
    pub fn new(msg_key: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_key,
            payload: payload.into(),
            locator: None,
        }
    }

    /// Encode for the journal: the key varint followed by the raw payload.
    ///
    /// A locator's `length` refers to this encoded form, so a payload read
    /// from the journal decodes back through [`MessageRecord::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.payload.len());
        write_varint(&mut buf, self.msg_key);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a journal message record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (msg_key, consumed) = read_varint(buf)
            .ok_or_else(|| StoreError::codec("truncated varint in message key"))?;
        Ok(Self {
            msg_key,
            payload: buf[consumed..].to_vec(),
            locator: None,
        })
    }
}

/// A queue known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// Broker-assigned queue key.
    pub queue_key: u64,
    /// Opaque queue metadata (binding, address, configuration).
    pub metadata: Vec<u8>,
}

impl QueueRecord {
    /// Encode for the journal and the `q` index family.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.metadata.len());
        write_varint(&mut buf, self.queue_key);
        write_bytes(&mut buf, &self.metadata);
        buf
    }

    /// Strict decode.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let queue_key = r.varint("queue_key")?;
        let metadata = r.bytes("metadata")?.to_vec();
        r.finish("queue record")?;
        Ok(Self {
            queue_key,
            metadata,
        })
    }
}

/// An entry placing a message on a queue. Destroyed on dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntryRecord {
    /// Queue this entry belongs to.
    pub queue_key: u64,
    /// Position of the entry within the queue; unique per queue.
    pub entry_seq: u64,
    /// Key of the referenced message, or zero for a placeholder entry.
    pub msg_key: u64,
    /// Payload size as accounted by the broker.
    pub size: u32,
    /// Expiration timestamp, zero when the entry never expires.
    pub expiration: u64,
    /// Locator of the referenced message, stamped at commit when known.
    pub message_locator: Option<Locator>,
}

impl QueueEntryRecord {
    /// Encode for the journal and the `e` index family.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + LOCATOR_LEN);
        write_varint(&mut buf, self.queue_key);
        write_varint(&mut buf, self.entry_seq);
        write_varint(&mut buf, self.msg_key);
        write_varint(&mut buf, u64::from(self.size));
        write_varint(&mut buf, self.expiration);
        match &self.message_locator {
            Some(locator) => {
                buf.push(1);
                buf.extend_from_slice(&locator.encode());
            }
            None => buf.push(0),
        }
        buf
    }

    /// Strict decode.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let queue_key = r.varint("queue_key")?;
        let entry_seq = r.varint("entry_seq")?;
        let msg_key = r.varint("msg_key")?;
        let size = u32::try_from(r.varint("size")?)
            .map_err(|_| StoreError::codec("queue entry size exceeds u32"))?;
        let expiration = r.varint("expiration")?;
        let message_locator = match r.byte("locator flag")? {
            0 => None,
            1 => Some(Locator::decode(r.take(LOCATOR_LEN, "locator")?)?),
            flag => {
                return Err(StoreError::codec(format!(
                    "bad locator flag {flag} in queue entry"
                )))
            }
        };
        r.finish("queue entry record")?;
        Ok(Self {
            queue_key,
            entry_seq,
            msg_key,
            size,
            expiration,
            message_locator,
        })
    }
}

/// A user map mutation. An absent value deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntryRecord {
    /// User-chosen key bytes.
    pub key: Vec<u8>,
    /// New value, or `None` to delete.
    pub value: Option<Vec<u8>>,
}

impl MapEntryRecord {
    /// Encode for the journal.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.key.len());
        write_bytes(&mut buf, &self.key);
        match &self.value {
            Some(value) => {
                buf.push(1);
                write_bytes(&mut buf, value);
            }
            None => buf.push(0),
        }
        buf
    }

    /// Strict decode.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let key = r.bytes("map key")?.to_vec();
        let value = match r.byte("value flag")? {
            0 => None,
            1 => Some(r.bytes("map value")?.to_vec()),
            flag => {
                return Err(StoreError::codec(format!(
                    "bad value flag {flag} in map entry"
                )))
            }
        };
        r.finish("map entry record")?;
        Ok(Self { key, value })
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Strict sequential decoder over a record buffer.
struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn varint(&mut self, field: &str) -> Result<u64> {
        let (value, consumed) = read_varint(&self.buf[self.off..])
            .ok_or_else(|| StoreError::codec(format!("truncated varint in {field}")))?;
        self.off += consumed;
        Ok(value)
    }

    fn byte(&mut self, field: &str) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.off)
            .ok_or_else(|| StoreError::codec(format!("missing byte in {field}")))?;
        self.off += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        let end = self.off.checked_add(n).filter(|&end| end <= self.buf.len());
        let end = end.ok_or_else(|| StoreError::codec(format!("truncated {field}")))?;
        let slice = &self.buf[self.off..end];
        self.off = end;
        Ok(slice)
    }

    fn bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.varint(field)?;
        let len = usize::try_from(len)
            .map_err(|_| StoreError::codec(format!("{field} length exceeds usize")))?;
        self.take(len, field)
    }

    fn finish(self, what: &str) -> Result<()> {
        if self.off == self.buf.len() {
            Ok(())
        } else {
            Err(StoreError::codec(format!(
                "{} trailing bytes after {what}",
                self.buf.len() - self.off
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_roundtrip() {
        let locator = Locator {
            position: 0x1122_3344_5566_7788,
            length: 4096,
        };
        let encoded = locator.encode();
        assert_eq!(Locator::decode(&encoded).unwrap(), locator);
        assert!(Locator::decode(&encoded[..11]).is_err());
    }

    #[test]
    fn locator_cell_publishes_once_visible_everywhere() {
        let cell = LocatorCell::new();
        let alias = cell.clone();
        assert_eq!(alias.get(), None);
        cell.set(Locator {
            position: 10,
            length: 2,
        });
        assert_eq!(
            alias.get(),
            Some(Locator {
                position: 10,
                length: 2
            })
        );
    }

    #[test]
    fn message_record_roundtrip() {
        let message = MessageRecord::new(42, b"hi".to_vec());
        let encoded = message.encode();
        let decoded = MessageRecord::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_key, 42);
        assert_eq!(decoded.payload, b"hi");
        assert!(decoded.locator.is_none());
    }

    #[test]
    fn queue_record_roundtrip() {
        let rec = QueueRecord {
            queue_key: 301,
            metadata: b"orders.priority".to_vec(),
        };
        assert_eq!(QueueRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn queue_entry_roundtrip_with_and_without_locator() {
        let mut entry = QueueEntryRecord {
            queue_key: 7,
            entry_seq: 12,
            msg_key: 900,
            size: 128,
            expiration: 0,
            message_locator: None,
        };
        assert_eq!(QueueEntryRecord::decode(&entry.encode()).unwrap(), entry);

        entry.message_locator = Some(Locator {
            position: 4096,
            length: 128,
        });
        entry.expiration = 1_700_000_000_000;
        assert_eq!(QueueEntryRecord::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn map_entry_roundtrip() {
        let put = MapEntryRecord {
            key: b"a".to_vec(),
            value: Some(b"1".to_vec()),
        };
        assert_eq!(MapEntryRecord::decode(&put.encode()).unwrap(), put);

        let del = MapEntryRecord {
            key: b"a".to_vec(),
            value: None,
        };
        assert_eq!(MapEntryRecord::decode(&del.encode()).unwrap(), del);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let rec = QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        };
        let mut encoded = rec.encode();
        encoded.push(0);
        assert!(QueueRecord::decode(&encoded).is_err());
    }
}
