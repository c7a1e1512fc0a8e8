//! Deterministic CID -> shard mapping.
//!
//! `shard(cid) = H(cid) mod shard_count`, where `H` is BLAKE3 in derive-key
//! mode under [`SHARD_HASH_CONTEXT`], truncated to a little-endian `u64`.
//! Every node must compute the same value, so neither the context string nor
//! the truncation may ever change.

use crate::cid::Cid;
use crate::constants::{MAX_SHARD_COUNT, SHARD_HASH_CONTEXT};
use crate::error::SharedError;
use crate::types::ShardRange;

/// Compute the shard of a CID for a given shard count.
pub fn shard_of(cid: &Cid, shard_count: u32) -> u32 {
    let mut hasher = blake3::Hasher::new_derive_key(SHARD_HASH_CONTEXT);
    hasher.update(cid.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(head) % u64::from(shard_count)) as u32
}

/// Split ranges into those valid for `shard_count` and those that are not.
pub fn partition_ranges(
    ranges: &[ShardRange],
    shard_count: u32,
) -> (Vec<ShardRange>, Vec<ShardRange>) {
    ranges
        .iter()
        .copied()
        .partition(|r| r.is_valid_for(shard_count))
}

/// Routes CIDs to shards and answers whether this node is responsible.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    shard_count: u32,
    ranges: Vec<ShardRange>,
}

impl ShardRouter {
    /// Build a router. Every range must be valid for `shard_count`.
    pub fn new(shard_count: u32, ranges: Vec<ShardRange>) -> Result<Self, SharedError> {
        if shard_count == 0 || shard_count > MAX_SHARD_COUNT {
            return Err(SharedError::InvalidShardCount(shard_count));
        }
        if let Some(bad) = ranges.iter().find(|r| !r.is_valid_for(shard_count)) {
            return Err(SharedError::InvalidShardRange {
                start: bad.start,
                end: bad.end,
                shard_count,
            });
        }
        Ok(Self {
            shard_count,
            ranges,
        })
    }

    /// A router responsible for the whole shard space.
    pub fn full(shard_count: u32) -> Result<Self, SharedError> {
        Self::new(shard_count, vec![ShardRange::full(shard_count)])
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn ranges(&self) -> &[ShardRange] {
        &self.ranges
    }

    pub fn shard_of(&self, cid: &Cid) -> u32 {
        shard_of(cid, self.shard_count)
    }

    pub fn owns_shard(&self, shard: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(shard))
    }

    pub fn is_responsible(&self, cid: &Cid) -> bool {
        self.owns_shard(self.shard_of(cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_of_is_stable_across_instances() {
        let a = ShardRouter::full(1024).unwrap();
        let b = ShardRouter::full(1024).unwrap();
        for i in 0..200u32 {
            let cid = Cid::of(&i.to_le_bytes());
            let shard = a.shard_of(&cid);
            assert!(shard < 1024);
            assert_eq!(shard, a.shard_of(&cid));
            assert_eq!(shard, b.shard_of(&cid));
            assert_eq!(shard, shard_of(&cid, 1024));
        }
    }

    #[test]
    fn test_shards_spread_over_space() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..500u32 {
            seen.insert(shard_of(&Cid::of(&i.to_le_bytes()), 16));
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_is_responsible_respects_ranges() {
        let router = ShardRouter::new(4, vec![ShardRange::new(0, 1)]).unwrap();
        for i in 0..100u32 {
            let cid = Cid::of(&i.to_le_bytes());
            assert_eq!(router.is_responsible(&cid), shard_of(&cid, 4) <= 1);
        }
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        assert!(ShardRouter::new(0, vec![]).is_err());
        assert!(ShardRouter::new(8, vec![ShardRange::new(4, 8)]).is_err());
        assert!(ShardRouter::new(8, vec![ShardRange::new(6, 2)]).is_err());
    }

    #[test]
    fn test_partition_ranges() {
        let ranges = [ShardRange::new(0, 3), ShardRange::new(2, 9), ShardRange::new(5, 1)];
        let (valid, invalid) = partition_ranges(&ranges, 8);
        assert_eq!(valid, vec![ShardRange::new(0, 3)]);
        assert_eq!(invalid.len(), 2);
    }
}
