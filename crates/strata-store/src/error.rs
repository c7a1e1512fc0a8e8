use std::fmt;

use thiserror::Error;

use strata_shared::Cid;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (blob files, data directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No blob with this CID is stored locally.
    #[error("Blob not found: {0}")]
    NotFound(Cid),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Policy document could not be (de)serialized.
    #[error("Policy document error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty blob")]
    EmptyBlob,

    #[error("Blob too large: {size} bytes (max {max})")]
    SizeExceeded { size: usize, max: usize },

    #[error("Storage capacity exceeded: {needed} bytes needed, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    /// The CID's shard is outside this node's ranges and the blob was not
    /// pushed as a replica.
    #[error("Not responsible for {cid} (shard {shard})")]
    NotResponsible { cid: Cid, shard: u32 },

    #[error("Blob {cid} is protected: {reason}")]
    Protected { cid: Cid, reason: ProtectReason },

    /// The configured shard count differs from the one this data directory
    /// was created with.
    #[error("Shard count mismatch: data directory uses {persisted}, configuration says {configured}")]
    ShardCountMismatch { persisted: u32, configured: u32 },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Why a delete was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectReason {
    Pinned,
    /// A live check reached too few other holders.
    InsufficientReplicas { live: usize, required: usize },
    /// No other holder could be checked at all.
    Unverifiable,
}

impl fmt::Display for ProtectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pinned => f.write_str("pinned"),
            Self::InsufficientReplicas { live, required } => {
                write!(f, "only {live} of {required} required replicas confirmed live")
            }
            Self::Unverifiable => f.write_str("replica safety could not be verified"),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
