//! Replica safety check consulted before a blob leaves local storage.

use async_trait::async_trait;

use crate::models::BlobRecord;

/// Outcome of a live check of a blob's other holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaCheck {
    /// At least the required number of other holders proved they hold it.
    Confirmed(usize),
    /// Some holders answered, but fewer than required.
    Insufficient { live: usize, required: usize },
    /// Nothing could be checked (no known holders, or none reachable).
    Unverifiable,
}

/// Decides whether dropping the local copy keeps the durability floor.
///
/// Implementations must check live state; cached replica sets are not
/// enough to authorize a delete.
#[async_trait]
pub trait ReplicaGuard: Send + Sync {
    async fn check_other_replicas(&self, record: &BlobRecord) -> ReplicaCheck;
}
