//! Key layout of the metadata store and data-key encoding.
//!
//! Metadata keys are a textual prefix followed by a big-endian shard id
//! (and log index), so lexicographic order within a prefix equals numeric
//! order. Data keys are namespaced by a one-byte marker and the big-endian
//! routing group, which keeps groups disjoint and lets an unbounded shard
//! end scan to the next group boundary.

use byteorder::{BigEndian, ByteOrder};

use crate::metapb::Shard;

pub const APPLY_STATE_PREFIX: &[u8] = b"raft-apply-state/";
pub const LOCAL_STATE_PREFIX: &[u8] = b"raft-local-state/";
pub const SHARD_PREFIX: &[u8] = b"raft-shard/";
pub const HARD_STATE_PREFIX: &[u8] = b"raft-hard-state/";
pub const RAFT_LOG_PREFIX: &[u8] = b"raft-log/";

pub const STORE_IDENT_KEY: &[u8] = b"store-ident";

pub const DATA_PREFIX: u8 = b'd';

/// Scan bounds covering every persisted shard local state.
pub fn local_state_scan_range() -> (Vec<u8>, Vec<u8>) {
    let start = LOCAL_STATE_PREFIX.to_vec();
    let mut end = start.clone();
    let last = end.last_mut().unwrap();
    *last += 1;
    (start, end)
}

fn make_shard_key(prefix: &[u8], shard_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&shard_id.to_be_bytes());
    key
}

pub fn apply_state_key(shard_id: u64) -> Vec<u8> {
    make_shard_key(APPLY_STATE_PREFIX, shard_id)
}

pub fn local_state_key(shard_id: u64) -> Vec<u8> {
    make_shard_key(LOCAL_STATE_PREFIX, shard_id)
}

pub fn shard_key(shard_id: u64) -> Vec<u8> {
    make_shard_key(SHARD_PREFIX, shard_id)
}

pub fn hard_state_key(shard_id: u64) -> Vec<u8> {
    make_shard_key(HARD_STATE_PREFIX, shard_id)
}

/// Prefix covering every log entry of one shard.
pub fn raft_log_prefix(shard_id: u64) -> Vec<u8> {
    let mut key = make_shard_key(RAFT_LOG_PREFIX, shard_id);
    key.push(b'/');
    key
}

/// Exclusive upper bound of one shard's log keys.
pub fn raft_log_prefix_end(shard_id: u64) -> Vec<u8> {
    let mut key = raft_log_prefix(shard_id);
    let last = key.last_mut().unwrap();
    *last += 1;
    key
}

pub fn raft_log_key(shard_id: u64, index: u64) -> Vec<u8> {
    let mut key = raft_log_prefix(shard_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Extracts the log index back out of a `raft_log_key`.
pub fn raft_log_index(key: &[u8]) -> u64 {
    BigEndian::read_u64(&key[key.len() - 8..])
}

/// Encodes a user key into the data keyspace of a group.
pub fn data_key(group: u64, key: &[u8]) -> Vec<u8> {
    let mut enc = Vec::with_capacity(9 + key.len());
    enc.push(DATA_PREFIX);
    enc.extend_from_slice(&group.to_be_bytes());
    enc.extend_from_slice(key);
    enc
}

/// Strips the data-key envelope, returning the user key.
pub fn origin_key(key: &[u8]) -> &[u8] {
    assert!(
        key.len() >= 9 && key[0] == DATA_PREFIX,
        "invalid data key {}",
        hex::encode_upper(key)
    );
    &key[9..]
}

/// Encoded scan start of a shard's range.
pub fn enc_start_key(shard: &Shard) -> Vec<u8> {
    data_key(shard.group, &shard.start_key)
}

/// Encoded scan end of a shard's range. An empty `end_key` scans to the
/// next group boundary.
pub fn enc_end_key(shard: &Shard) -> Vec<u8> {
    if shard.end_key.is_empty() {
        data_key(shard.group + 1, b"")
    } else {
        data_key(shard.group, &shard.end_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys_sort_by_id() {
        assert!(apply_state_key(1) < apply_state_key(2));
        assert!(apply_state_key(255) < apply_state_key(256));
        assert!(raft_log_key(1, 9) < raft_log_key(1, 10));
        assert_eq!(raft_log_index(&raft_log_key(7, 42)), 42);
    }

    #[test]
    fn test_data_key_round_trip() {
        let enc = data_key(3, b"key1");
        assert_eq!(origin_key(&enc), b"key1");
    }

    #[test]
    fn test_enc_end_key_unbounded() {
        let mut shard = Shard {
            id: 1,
            group: 0,
            ..Default::default()
        };
        assert_eq!(enc_end_key(&shard), data_key(1, b""));
        shard.end_key = b"m".to_vec();
        assert_eq!(enc_end_key(&shard), data_key(0, b"m"));
    }
}
