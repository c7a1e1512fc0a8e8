//! Peer directory.
//!
//! Tracks every peer this node has discovered: addresses, advertised shard
//! ranges and content types, connection state, last-seen time and a
//! reputation score. The map sits behind a tokio `RwLock`; each peer's
//! reputation is an atomic so concurrent adjustments only need a read lock.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use strata_shared::constants::{MAX_REPUTATION, MIN_REPUTATION};
use strata_shared::protocol::NodeAnnouncement;
use strata_shared::{ConnectionState, ContentType, ShardRange};

#[derive(Debug)]
struct PeerEntry {
    addresses: Vec<Multiaddr>,
    content_types: BTreeSet<ContentType>,
    shard_ranges: Vec<ShardRange>,
    state: ConnectionState,
    last_seen: DateTime<Utc>,
    reputation: Arc<AtomicI64>,
}

impl PeerEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            addresses: Vec::new(),
            content_types: BTreeSet::new(),
            shard_ranges: Vec::new(),
            state: ConnectionState::Disconnected,
            last_seen: now,
            reputation: Arc::new(AtomicI64::new(0)),
        }
    }

    fn add_address(&mut self, addr: Multiaddr) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    fn serves(&self, shard: u32, content_type: ContentType) -> bool {
        self.shard_ranges.iter().any(|r| r.contains(shard))
            || self.content_types.contains(&content_type)
    }
}

/// Newly observed information about a peer. `None` fields leave the stored
/// value untouched.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub content_types: Option<BTreeSet<ContentType>>,
    pub shard_ranges: Option<Vec<ShardRange>>,
    pub state: Option<ConnectionState>,
}

impl PeerUpdate {
    /// A bare discovery (DHT, mDNS, bootstrap) with the given addresses.
    pub fn discovered(peer_id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self {
            peer_id,
            addresses,
            content_types: None,
            shard_ranges: None,
            state: None,
        }
    }
}

/// Parameters for [`PeerDirectory::select_replication_targets`].
#[derive(Debug, Clone)]
pub struct TargetQuery<'a> {
    pub shard: u32,
    pub content_type: ContentType,
    pub count: usize,
    /// Peers that must not be returned (current holders, failed candidates).
    pub exclude: &'a [PeerId],
}

/// Serializable snapshot of one peer for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub state: ConnectionState,
    pub reputation: i64,
    pub last_seen: DateTime<Utc>,
    pub shard_ranges: Vec<ShardRange>,
    pub content_types: Vec<ContentType>,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge newly observed info into the peer's record, creating it on
    /// first discovery. Always refreshes last-seen.
    pub async fn upsert(&self, update: PeerUpdate) {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        let entry = peers.entry(update.peer_id).or_insert_with(|| {
            debug!(peer = %update.peer_id, "Discovered new peer");
            PeerEntry::new(now)
        });

        for addr in update.addresses {
            entry.add_address(addr);
        }
        if let Some(content_types) = update.content_types {
            entry.content_types = content_types;
        }
        if let Some(ranges) = update.shard_ranges {
            entry.shard_ranges = ranges;
        }
        if let Some(state) = update.state {
            entry.state = state;
        }
        entry.last_seen = now;
    }

    pub async fn on_connected(&self, peer_id: PeerId, address: Multiaddr) {
        self.upsert(PeerUpdate {
            peer_id,
            addresses: vec![address],
            content_types: None,
            shard_ranges: None,
            state: Some(ConnectionState::Connected),
        })
        .await;
    }

    pub async fn on_disconnected(&self, peer_id: &PeerId) {
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.state = ConnectionState::Disconnected;
            entry.last_seen = Utc::now();
            debug!(peer = %peer_id, "Peer marked disconnected");
        }
    }

    /// Record the shard ranges and content types a peer advertised over gossip.
    pub async fn apply_announcement(&self, peer_id: PeerId, announcement: &NodeAnnouncement) {
        self.upsert(PeerUpdate {
            peer_id,
            addresses: Vec::new(),
            content_types: Some(announcement.content_types.iter().copied().collect()),
            shard_ranges: Some(announcement.shard_ranges.clone()),
            state: None,
        })
        .await;
    }

    /// Add `delta` to the peer's reputation, clamped to the reputation
    /// bounds. Returns the new score.
    pub async fn reputation_adjust(&self, peer_id: &PeerId, delta: i64) -> i64 {
        let score = self.reputation_cell(peer_id).await;
        let previous = score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(delta).clamp(MIN_REPUTATION, MAX_REPUTATION))
            })
            .unwrap_or_else(|current| current);
        let updated = previous.saturating_add(delta).clamp(MIN_REPUTATION, MAX_REPUTATION);
        debug!(peer = %peer_id, delta, reputation = updated, "Adjusted reputation");
        updated
    }

    /// Operator action: put a peer's reputation back to zero.
    pub async fn reset_reputation(&self, peer_id: &PeerId) -> bool {
        let peers = self.peers.read().await;
        match peers.get(peer_id) {
            Some(entry) => {
                entry.reputation.store(0, Ordering::Release);
                info!(peer = %peer_id, "Reputation reset");
                true
            }
            None => false,
        }
    }

    pub async fn reputation(&self, peer_id: &PeerId) -> Option<i64> {
        let peers = self.peers.read().await;
        peers.get(peer_id).map(|e| e.reputation.load(Ordering::Acquire))
    }

    pub async fn is_connected(&self, peer_id: &PeerId) -> bool {
        let peers = self.peers.read().await;
        peers
            .get(peer_id)
            .is_some_and(|e| e.state == ConnectionState::Connected)
    }

    /// Pick up to `query.count` peers to hold a replica.
    ///
    /// Order of preference: connected, then serving the shard or content
    /// type, then highest reputation, then peer ID. Excluded and blocked
    /// peers are never returned.
    pub async fn select_replication_targets<F>(&self, query: TargetQuery<'_>, is_blocked: F) -> Vec<PeerId>
    where
        F: Fn(&PeerId) -> bool,
    {
        let peers = self.peers.read().await;
        let mut candidates: Vec<(bool, bool, i64, String, PeerId)> = peers
            .iter()
            .filter(|(id, _)| !query.exclude.contains(id) && !is_blocked(id))
            .map(|(id, entry)| {
                (
                    entry.state == ConnectionState::Connected,
                    entry.serves(query.shard, query.content_type),
                    entry.reputation.load(Ordering::Acquire),
                    id.to_string(),
                    *id,
                )
            })
            .collect();

        candidates.sort_by(|a, b| {
            (Reverse(a.0), Reverse(a.1), Reverse(a.2), &a.3)
                .cmp(&(Reverse(b.0), Reverse(b.1), Reverse(b.2), &b.3))
        });

        candidates
            .into_iter()
            .take(query.count)
            .map(|(.., id)| id)
            .collect()
    }

    /// Drop disconnected peers unseen for longer than `max_absence`.
    pub async fn prune(&self, max_absence: Duration) -> usize {
        self.prune_at(Utc::now(), max_absence).await
    }

    pub async fn prune_at(&self, now: DateTime<Utc>, max_absence: Duration) -> usize {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|peer_id, entry| {
            let keep = entry.state == ConnectionState::Connected
                || now.signed_duration_since(entry.last_seen) <= max_absence;
            if !keep {
                debug!(peer = %peer_id, "Pruning absent peer");
            }
            keep
        });
        before - peers.len()
    }

    pub async fn summaries(&self) -> Vec<PeerSummary> {
        let peers = self.peers.read().await;
        let mut out: Vec<PeerSummary> = peers
            .iter()
            .map(|(id, entry)| PeerSummary {
                peer_id: id.to_string(),
                addresses: entry.addresses.iter().map(ToString::to_string).collect(),
                state: entry.state,
                reputation: entry.reputation.load(Ordering::Acquire),
                last_seen: entry.last_seen,
                shard_ranges: entry.shard_ranges.clone(),
                content_types: entry.content_types.iter().copied().collect(),
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    pub async fn connected_count(&self) -> usize {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .count()
    }

    pub async fn known_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn reputation_cell(&self, peer_id: &PeerId) -> Arc<AtomicI64> {
        if let Some(entry) = self.peers.read().await.get(peer_id) {
            return entry.reputation.clone();
        }
        let mut peers = self.peers.write().await;
        peers
            .entry(*peer_id)
            .or_insert_with(|| PeerEntry::new(Utc::now()))
            .reputation
            .clone()
    }
}
