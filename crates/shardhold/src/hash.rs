use crate::types::{OwnerKey, ShardId};

/// DJB2 hash function for consistent shard assignment.
/// Produces a deterministic hash for any byte slice.
///
/// Routing depends on every node computing the same value for the same key,
/// across processes and releases, so this must never change.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Compute the shard for an owner key: `djb2(key) mod num_shards`.
///
/// # Panics
///
/// Panics if `num_shards` is 0. `RuntimeConfig::validate` rejects that value
/// before any routing happens.
pub fn shard_for_key(owner_key: &OwnerKey, num_shards: u32) -> ShardId {
    assert!(num_shards >= 1, "num_shards must be >= 1, got {num_shards}");
    ShardId::new(djb2_hash(owner_key.as_str().as_bytes()) % num_shards)
}
