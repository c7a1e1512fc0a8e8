//! Node orchestration.
//!
//! [`StorageNode`] wires the store, peer directory, policy filter,
//! replication manager and garbage collector together. Local clients go
//! through `store_blob` / `retrieve` / `delete_blob`; peers go through
//! `handle_request`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use strata_net::PeerDirectory;
use strata_shared::protocol::{NodeAnnouncement, NodeRequest, NodeResponse, Rejection, ReplicatePayload};
use strata_shared::{storage_proof, Cid, ConnectionState, ContentType, GuildId, ShardRange};
use strata_store::{ContentStore, PutOptions, StoreError};

use crate::error::NodeError;
use crate::events::{emit, NodeEvent};
use crate::gc::{GarbageCollector, GcReport, GcSettings};
use crate::policy::PolicyFilter;
use crate::replication::{
    GoalCounts, ReplicaTransport, ReplicationManager, ReplicationSettings, REPUTATION_CORRUPT,
    REPUTATION_PROTOCOL,
};

/// Connected peers asked for a blob that is not stored locally.
const FETCH_FANOUT: usize = 3;

/// Runtime options derived from the validated configuration.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub replication: ReplicationSettings,
    pub gc: GcSettings,
    /// Accept replica pushes for shards outside the configured ranges.
    pub accept_foreign_shards: bool,
    pub content_types: Vec<ContentType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub peer_id: String,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub blob_count: u64,
    pub total_bytes: u64,
    pub pinned_bytes: u64,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub replication_factor: usize,
    pub replication: GoalCounts,
    pub shard_count: u32,
    pub shard_ranges: Vec<ShardRange>,
    pub policy_version: u64,
    pub last_gc: Option<GcReport>,
}

pub struct StorageNode {
    local_peer_id: PeerId,
    store: Arc<ContentStore>,
    peers: Arc<PeerDirectory>,
    policy: Arc<PolicyFilter>,
    transport: Arc<dyn ReplicaTransport>,
    replication: Arc<ReplicationManager>,
    gc: Arc<GarbageCollector>,
    events: broadcast::Sender<NodeEvent>,
    accept_foreign_shards: bool,
    content_types: Vec<ContentType>,
    started_at: DateTime<Utc>,
}

impl StorageNode {
    pub fn new(
        local_peer_id: PeerId,
        store: Arc<ContentStore>,
        peers: Arc<PeerDirectory>,
        policy: Arc<PolicyFilter>,
        transport: Arc<dyn ReplicaTransport>,
        options: NodeOptions,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let replication = Arc::new(ReplicationManager::new(
            store.clone(),
            peers.clone(),
            policy.clone(),
            transport.clone(),
            options.replication,
            events.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            store.clone(),
            replication.clone(),
            options.gc,
            events.clone(),
        ));

        Self {
            local_peer_id,
            store,
            peers,
            policy,
            transport,
            replication,
            gc,
            events,
            accept_foreign_shards: options.accept_foreign_shards,
            content_types: options.content_types,
            started_at: Utc::now(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    pub fn policy(&self) -> &Arc<PolicyFilter> {
        &self.policy
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn events(&self) -> &broadcast::Sender<NodeEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Store a blob submitted by a local client and start replicating it.
    pub async fn store_blob(
        &self,
        data: &[u8],
        content_type: ContentType,
        guild: Option<GuildId>,
        pin: bool,
    ) -> Result<Cid, NodeError> {
        let cid = Cid::of(data);
        if !self.policy.is_allowed(&cid, None, guild.as_ref()) {
            debug!(cid = %cid, "Local store refused by policy");
            return Err(NodeError::PolicyBlocked);
        }

        let opts = PutOptions::local(content_type).with_guild(guild).pinned(pin);
        let cid = self.store.put(data, opts).await?;
        emit(
            &self.events,
            NodeEvent::BlobStored {
                cid,
                size: data.len() as u64,
                local: true,
            },
        );

        let replication = self.replication.clone();
        tokio::spawn(async move {
            if let Err(e) = replication.replicate(&cid).await {
                warn!(cid = %cid, error = %e, "Initial replication failed");
            }
        });

        Ok(cid)
    }

    /// Read a blob, asking connected peers when it is not held locally.
    pub async fn retrieve(&self, cid: &Cid) -> Result<Vec<u8>, NodeError> {
        if self.policy.is_cid_blocked(cid) {
            return Err(NodeError::PolicyBlocked);
        }
        match self.store.get(cid).await {
            Ok(data) => Ok(data),
            Err(StoreError::NotFound(_)) => self.fetch_remote(cid).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Guarded delete: refused for pinned blobs and when the durability
    /// floor cannot be confirmed live.
    pub async fn delete_blob(&self, cid: &Cid) -> Result<u64, NodeError> {
        let size = self.store.delete(cid, self.replication.as_ref()).await?;
        self.replication.forget(cid);
        emit(&self.events, NodeEvent::BlobDeleted { cid: *cid, size });
        info!(cid = %cid, size, "Blob deleted");
        Ok(size)
    }

    pub async fn pin(&self, cid: &Cid) -> Result<(), NodeError> {
        Ok(self.store.pin(cid).await?)
    }

    pub async fn unpin(&self, cid: &Cid) -> Result<(), NodeError> {
        Ok(self.store.unpin(cid).await?)
    }

    pub async fn run_gc(&self) -> Result<GcReport, NodeError> {
        Ok(self.gc.run_cycle().await?)
    }

    /// Answer one inbound request from `peer`.
    pub async fn handle_request(&self, peer: PeerId, request: NodeRequest) -> NodeResponse {
        if self.policy.is_peer_blocked(&peer) {
            debug!(peer = %peer, "Request from blocked peer");
            return NodeResponse::Rejected(Rejection::PolicyBlocked);
        }

        match request {
            NodeRequest::Replicate(payload) => self.handle_replicate(peer, payload).await,
            NodeRequest::Verify { cid, nonce } => match self.store.read(&cid).await {
                Ok(data) => NodeResponse::Proof {
                    cid,
                    digest: storage_proof(&nonce, &data),
                },
                Err(StoreError::NotFound(_)) => NodeResponse::NotFound { cid },
                Err(e) => {
                    warn!(cid = %cid, error = %e, "Cannot answer verification");
                    NodeResponse::Rejected(Rejection::Unavailable)
                }
            },
            NodeRequest::Fetch { cid } => {
                if self.policy.is_cid_blocked(&cid) {
                    return NodeResponse::Rejected(Rejection::PolicyBlocked);
                }
                match self.store.get(&cid).await {
                    Ok(data) => NodeResponse::Blob { cid, data },
                    Err(StoreError::NotFound(_)) => NodeResponse::NotFound { cid },
                    Err(e) => {
                        warn!(cid = %cid, error = %e, "Cannot serve fetch");
                        NodeResponse::Rejected(Rejection::Unavailable)
                    }
                }
            }
        }
    }

    async fn handle_replicate(&self, peer: PeerId, payload: ReplicatePayload) -> NodeResponse {
        let ReplicatePayload {
            cid,
            content_type,
            guild,
            data,
        } = payload;

        if data.len() > self.store.limits().max_blob_size {
            return NodeResponse::Rejected(Rejection::SizeExceeded);
        }
        if !cid.matches(&data) {
            warn!(cid = %cid, peer = %peer, "Replica payload does not match its CID");
            self.peers.reputation_adjust(&peer, REPUTATION_PROTOCOL).await;
            return NodeResponse::Rejected(Rejection::Malformed(
                "payload does not hash to cid".into(),
            ));
        }
        if !self.policy.is_allowed(&cid, Some(&peer), guild.as_ref())
            || !self.content_types.contains(&content_type)
        {
            return NodeResponse::Rejected(Rejection::PolicyBlocked);
        }
        if !self.accept_foreign_shards && !self.store.router().is_responsible(&cid) {
            return NodeResponse::Rejected(Rejection::ShardMismatch);
        }

        let opts = PutOptions::replica(content_type, peer.to_string()).with_guild(guild);
        match self.store.put(&data, opts).await {
            Ok(cid) => {
                debug!(cid = %cid, peer = %peer, "Accepted replica");
                emit(
                    &self.events,
                    NodeEvent::BlobStored {
                        cid,
                        size: data.len() as u64,
                        local: false,
                    },
                );
                NodeResponse::Stored { cid }
            }
            Err(e) => {
                debug!(cid = %cid, peer = %peer, error = %e, "Replica refused");
                NodeResponse::Rejected(rejection_for(&e))
            }
        }
    }

    async fn fetch_remote(&self, cid: &Cid) -> Result<Vec<u8>, NodeError> {
        let mut candidates: Vec<_> = self
            .peers
            .summaries()
            .await
            .into_iter()
            .filter(|s| s.state == ConnectionState::Connected)
            .filter_map(|s| s.peer_id.parse::<PeerId>().ok().map(|id| (s.reputation, id)))
            .filter(|(_, id)| !self.policy.is_peer_blocked(id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, peer) in candidates.into_iter().take(FETCH_FANOUT) {
            let request = NodeRequest::Fetch { cid: *cid };
            let response = tokio::time::timeout(
                self.replication.settings().request_timeout,
                self.transport.request(peer, request),
            )
            .await;

            match response {
                Ok(Ok(NodeResponse::Blob { data, .. })) if cid.matches(&data) => {
                    debug!(cid = %cid, peer = %peer, "Fetched blob from peer");
                    return Ok(data);
                }
                Ok(Ok(NodeResponse::Blob { .. })) => {
                    warn!(cid = %cid, peer = %peer, "Peer served corrupt data");
                    self.peers.reputation_adjust(&peer, REPUTATION_CORRUPT).await;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "Fetch failed"),
                Err(_) => debug!(peer = %peer, "Fetch timed out"),
            }
        }

        Err(StoreError::NotFound(*cid).into())
    }

    /// Record a peer's gossip announcement. Announcements for another shard
    /// space are ignored.
    pub async fn on_announcement(&self, peer: PeerId, announcement: &NodeAnnouncement) {
        let ours = self.store.router().shard_count();
        if announcement.shard_count != ours {
            debug!(
                peer = %peer,
                theirs = announcement.shard_count,
                ours,
                "Ignoring announcement for a different shard count"
            );
            return;
        }
        self.peers.apply_announcement(peer, announcement).await;
    }

    pub fn announcement(&self) -> NodeAnnouncement {
        let router = self.store.router();
        NodeAnnouncement {
            shard_count: router.shard_count(),
            shard_ranges: router.ranges().to_vec(),
            content_types: self.content_types.clone(),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        let stats = self.store.stats()?;
        let router = self.store.router();
        Ok(NodeStatus {
            peer_id: self.local_peer_id.to_string(),
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.started_at,
            uptime_secs: Utc::now().signed_duration_since(self.started_at).num_seconds(),
            blob_count: stats.count,
            total_bytes: stats.total_bytes,
            pinned_bytes: stats.pinned_bytes,
            connected_peers: self.peers.connected_count().await,
            known_peers: self.peers.known_count().await,
            replication_factor: self.replication.settings().factor,
            replication: self.replication.goal_counts(),
            shard_count: router.shard_count(),
            shard_ranges: router.ranges().to_vec(),
            policy_version: self.policy.snapshot().version,
            last_gc: self.gc.last_report().await,
        })
    }
}

fn rejection_for(err: &StoreError) -> Rejection {
    match err {
        StoreError::SizeExceeded { .. } => Rejection::SizeExceeded,
        StoreError::CapacityExceeded { .. } => Rejection::CapacityExceeded,
        StoreError::NotResponsible { .. } => Rejection::ShardMismatch,
        StoreError::EmptyBlob => Rejection::Malformed("empty payload".into()),
        _ => Rejection::Unavailable,
    }
}
