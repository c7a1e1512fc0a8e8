//! Domain model structs persisted in the metadata database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the
//! status bridge.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_shared::{Cid, ContentType, GuildId};

// ---------------------------------------------------------------------------
// Blob metadata
// ---------------------------------------------------------------------------

/// How a blob reached this node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum BlobOrigin {
    /// Accepted from a client of this node. This node drives its replication.
    Local,
    /// Pushed by `from` as a replication target.
    Replica { from: String },
}

impl BlobOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

/// A peer known to hold a copy of a blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaEntry {
    /// libp2p peer ID (base58 string form).
    pub peer_id: String,
    /// Last successful proof-of-storage (or the push ack).
    pub last_verified: DateTime<Utc>,
}

/// Metadata record kept for every stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobRecord {
    pub cid: Cid,
    /// Payload size in bytes.
    pub size: u64,
    pub content_type: ContentType,
    pub guild: Option<GuildId>,
    /// Owning shard number.
    pub shard: u32,
    pub origin: BlobOrigin,
    /// Pinned blobs are never garbage collected.
    pub pinned: bool,
    pub stored_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Peers known to hold a copy. May be stale.
    pub replicas: Vec<ReplicaEntry>,
}

impl BlobRecord {
    pub fn holds_replica(&self, peer_id: &str) -> bool {
        self.replicas.iter().any(|r| r.peer_id == peer_id)
    }
}

/// Options accompanying a `put`.
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_type: ContentType,
    pub guild: Option<GuildId>,
    pub origin: BlobOrigin,
    pub pin: bool,
}

impl PutOptions {
    pub fn local(content_type: ContentType) -> Self {
        Self {
            content_type,
            guild: None,
            origin: BlobOrigin::Local,
            pin: false,
        }
    }

    pub fn replica(content_type: ContentType, from: impl Into<String>) -> Self {
        Self {
            content_type,
            guild: None,
            origin: BlobOrigin::Replica { from: from.into() },
            pin: false,
        }
    }

    pub fn with_guild(mut self, guild: Option<GuildId>) -> Self {
        self.guild = guild;
        self
    }

    pub fn pinned(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }
}

/// Capacity figures for status reporting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub count: u64,
    pub total_bytes: u64,
    pub pinned_bytes: u64,
}

// ---------------------------------------------------------------------------
// Content policy
// ---------------------------------------------------------------------------

/// How guild tags gate inbound content.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuildMode {
    /// Accept every guild.
    #[default]
    All,
    /// Accept only guilds in the allow set.
    Allowlist,
    /// Accept every guild except those in the block set.
    Blocklist,
}

/// Versioned blocked-content and guild policy, persisted as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyState {
    /// Bumped on every effective mutation. Never decreases.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub blocked_cids: BTreeSet<Cid>,
    /// libp2p peer IDs (string form).
    pub blocked_peers: BTreeSet<String>,
    pub guild_mode: GuildMode,
    pub allowed_guilds: BTreeSet<GuildId>,
    pub blocked_guilds: BTreeSet<GuildId>,
}
