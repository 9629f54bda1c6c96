//! Index key layouts.
//!
//! Every key in the sorted index carries a one-byte prefix naming its
//! family, followed by big-endian fixed-width integers:
//!
//! ```text
//! m ∥ u64(msg_key)                    → encoded locator (position, length)
//! q ∥ u64(queue_key)                  → encoded queue record
//! e ∥ u64(queue_key) ∥ u64(entry_seq) → encoded queue entry record
//! p ∥ bytes(user_key)                 → opaque user value
//! ```
//!
//! Big-endian widths make lexicographic order equal numeric order, which
//! prefix and range cursors rely on. Two sentinel keys sort before all
//! prefixed families (`:` < `e` < `m` < `p` < `q`) and hold engine state.

/// Family prefix for message locators.
pub const MESSAGE_PREFIX: u8 = b'm';
/// Family prefix for queue records.
pub const QUEUE_PREFIX: u8 = b'q';
/// Family prefix for queue entry records.
pub const ENTRY_PREFIX: u8 = b'e';
/// Family prefix for the user key/value map.
pub const MAP_PREFIX: u8 = b'p';

/// Sentinel key: present and `1` while the index is open for mutation.
pub const DIRTY_KEY: &[u8] = b":dirty";
/// Sentinel key: the encoded log-reference ledger.
pub const LOG_REFS_KEY: &[u8] = b":log-refs";

/// Build the index key for a message locator.
pub fn message_key(msg_key: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = MESSAGE_PREFIX;
    key[1..].copy_from_slice(&msg_key.to_be_bytes());
    key
}

/// Build the index key for a queue record.
pub fn queue_key(queue: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = QUEUE_PREFIX;
    key[1..].copy_from_slice(&queue.to_be_bytes());
    key
}

/// Build the index key for a queue entry.
pub fn entry_key(queue: u64, entry_seq: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = ENTRY_PREFIX;
    key[1..9].copy_from_slice(&queue.to_be_bytes());
    key[9..].copy_from_slice(&entry_seq.to_be_bytes());
    key
}

/// Prefix covering every entry of one queue.
pub fn entry_prefix(queue: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = ENTRY_PREFIX;
    key[1..].copy_from_slice(&queue.to_be_bytes());
    key
}

/// Build the index key for a user map entry.
pub fn map_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + user_key.len());
    key.push(MAP_PREFIX);
    key.extend_from_slice(user_key);
    key
}

/// Recover the `msg_key` from a message-family index key.
pub fn decode_message_key(key: &[u8]) -> Option<u64> {
    decode_u64_at(key, MESSAGE_PREFIX, 1).filter(|_| key.len() == 9)
}

/// Recover the `queue_key` from a queue-family index key.
pub fn decode_queue_key(key: &[u8]) -> Option<u64> {
    decode_u64_at(key, QUEUE_PREFIX, 1).filter(|_| key.len() == 9)
}

/// Recover `(queue_key, entry_seq)` from an entry-family index key.
pub fn decode_entry_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 17 || key[0] != ENTRY_PREFIX {
        return None;
    }
    let queue = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let seq = u64::from_be_bytes(key[9..17].try_into().ok()?);
    Some((queue, seq))
}

/// Recover the user key from a map-family index key.
pub fn decode_map_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&MAP_PREFIX, rest)) => Some(rest),
        _ => None,
    }
}

fn decode_u64_at(key: &[u8], prefix: u8, at: usize) -> Option<u64> {
    if key.first() != Some(&prefix) {
        return None;
    }
    let bytes = key.get(at..at + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, for use as an exclusive cursor upper bound.
///
/// Returns `None` when `prefix` is empty or all `0xFF` (no upper bound
/// exists; scan to the end instead).
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn key_families_roundtrip() {
        assert_eq!(decode_message_key(&message_key(42)), Some(42));
        assert_eq!(decode_queue_key(&queue_key(7)), Some(7));
        assert_eq!(decode_entry_key(&entry_key(7, 9)), Some((7, 9)));
        assert_eq!(decode_map_key(&map_key(b"a")), Some(&b"a"[..]));
    }

    #[test]
    fn families_do_not_cross_decode() {
        assert_eq!(decode_message_key(&queue_key(42)), None);
        assert_eq!(decode_entry_key(&message_key(42)), None);
        assert_eq!(decode_map_key(&queue_key(42)), None);
    }

    #[test]
    fn sentinels_sort_before_families() {
        assert!(DIRTY_KEY < &entry_key(0, 0)[..]);
        assert!(LOG_REFS_KEY < &entry_key(0, 0)[..]);
    }

    #[test]
    fn next_prefix_bounds() {
        assert_eq!(next_prefix(b"e"), Some(b"f".to_vec()));
        assert_eq!(next_prefix(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(next_prefix(&[0xFF, 0xFF]), None);
        assert_eq!(next_prefix(b""), None);
    }

    proptest! {
        // Lexicographic order over encoded keys must equal numeric order,
        // both across queues and across sequences within a queue.
        #[test]
        fn entry_key_order_matches_numeric_order(
            q1: u64, s1: u64, q2: u64, s2: u64
        ) {
            let k1 = entry_key(q1, s1);
            let k2 = entry_key(q2, s2);
            prop_assert_eq!(k1.cmp(&k2), (q1, s1).cmp(&(q2, s2)));
        }

        #[test]
        fn entry_prefix_covers_exactly_one_queue(q: u64, s: u64) {
            let key = entry_key(q, s);
            prop_assert!(key.starts_with(&entry_prefix(q)));
            if let Some(bound) = next_prefix(&entry_prefix(q)) {
                prop_assert!(key.to_vec() < bound);
            }
        }
    }
}
