//! In-process fixtures for node tests: a mock peer network and a fully
//! wired node on a temp directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tempfile::TempDir;

use strata_net::{NetError, PeerDirectory};
use strata_shared::protocol::{NodeRequest, NodeResponse, Rejection};
use strata_shared::{storage_proof, Cid, ContentType, ShardRouter};
use strata_store::{ContentStore, Database, StoreLimits};

use crate::events::event_channel;
use crate::gc::{GcSettings, RetentionMode};
use crate::node::{NodeOptions, StorageNode};
use crate::policy::{PolicyFilter, SqlitePolicyStore};
use crate::replication::{ReplicaTransport, ReplicationManager, ReplicationSettings};

pub const TEST_MAX_BLOB_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Stores pushes and answers honestly.
    Store,
    /// Never answers.
    Silent,
    /// Refuses every request.
    Reject,
    /// Answers with garbage proofs and payloads.
    Corrupt,
    /// Answers, but has lost everything it stored.
    Forget,
}

#[derive(Debug)]
struct MockPeer {
    behavior: PeerBehavior,
    blobs: HashMap<Cid, Vec<u8>>,
    requests: usize,
}

/// Peer network that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MockTransport {
    peers: Mutex<HashMap<PeerId, MockPeer>>,
    latency: Mutex<Duration>,
}

impl MockTransport {
    pub fn add_peer(&self, behavior: PeerBehavior) -> PeerId {
        let peer = PeerId::random();
        self.peers.lock().unwrap().insert(
            peer,
            MockPeer {
                behavior,
                blobs: HashMap::new(),
                requests: 0,
            },
        );
        peer
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_behavior(&self, peer: &PeerId, behavior: PeerBehavior) {
        self.peers.lock().unwrap().get_mut(peer).unwrap().behavior = behavior;
    }

    /// Place a blob on a peer without going through replication.
    pub fn seed(&self, peer: &PeerId, data: &[u8]) {
        self.peers
            .lock()
            .unwrap()
            .get_mut(peer)
            .unwrap()
            .blobs
            .insert(Cid::of(data), data.to_vec());
    }

    pub fn holds(&self, peer: &PeerId, cid: &Cid) -> bool {
        self.peers.lock().unwrap()[peer].blobs.contains_key(cid)
    }

    pub fn requests_to(&self, peer: &PeerId) -> usize {
        self.peers.lock().unwrap()[peer].requests
    }

    pub fn total_requests(&self) -> usize {
        self.peers.lock().unwrap().values().map(|p| p.requests).sum()
    }
}

#[async_trait]
impl ReplicaTransport for MockTransport {
    async fn request(&self, peer: PeerId, request: NodeRequest) -> Result<NodeResponse, NetError> {
        let behavior = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers
                .get_mut(&peer)
                .ok_or_else(|| NetError::Outbound(format!("unknown peer {peer}")))?;
            entry.requests += 1;
            entry.behavior
        };

        if behavior == PeerBehavior::Silent {
            std::future::pending::<()>().await;
        }
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut peers = self.peers.lock().unwrap();
        let entry = peers
            .get_mut(&peer)
            .ok_or_else(|| NetError::Outbound(format!("unknown peer {peer}")))?;
        if behavior == PeerBehavior::Forget {
            entry.blobs.clear();
        }

        let response = match (behavior, request) {
            (PeerBehavior::Reject, _) => NodeResponse::Rejected(Rejection::CapacityExceeded),
            (_, NodeRequest::Replicate(payload)) => {
                let cid = payload.cid;
                entry.blobs.insert(cid, payload.data);
                NodeResponse::Stored { cid }
            }
            (PeerBehavior::Corrupt, NodeRequest::Verify { cid, .. }) => NodeResponse::Proof {
                cid,
                digest: [0u8; 32],
            },
            (PeerBehavior::Corrupt, NodeRequest::Fetch { cid }) => NodeResponse::Blob {
                cid,
                data: b"not what you asked for".to_vec(),
            },
            (_, NodeRequest::Verify { cid, nonce }) => match entry.blobs.get(&cid) {
                Some(data) => NodeResponse::Proof {
                    cid,
                    digest: storage_proof(&nonce, data),
                },
                None => NodeResponse::NotFound { cid },
            },
            (_, NodeRequest::Fetch { cid }) => match entry.blobs.get(&cid) {
                Some(data) => NodeResponse::Blob {
                    cid,
                    data: data.clone(),
                },
                None => NodeResponse::NotFound { cid },
            },
        };
        Ok(response)
    }
}

pub fn test_options(factor: usize, accept_foreign_shards: bool) -> NodeOptions {
    NodeOptions {
        replication: ReplicationSettings {
            factor,
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
            verify_sample: 16,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
        },
        gc: GcSettings {
            mode: RetentionMode::Hybrid,
            max_storage_bytes: 0,
            reserved_for_pinned_bytes: 0,
            max_age: Some(chrono::Duration::days(30)),
            max_candidates: 256,
        },
        accept_foreign_shards,
        content_types: ContentType::ALL.to_vec(),
    }
}

/// A node wired to a [`MockTransport`] on a temp directory.
pub struct Harness {
    _dir: TempDir,
    pub node: Arc<StorageNode>,
    pub store: Arc<ContentStore>,
    pub peers: Arc<PeerDirectory>,
    pub policy: Arc<PolicyFilter>,
    pub replication: Arc<ReplicationManager>,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    pub async fn new(factor: usize) -> Self {
        Self::build(factor, ShardRouter::full(1024).unwrap(), true).await
    }

    pub async fn build(factor: usize, router: ShardRouter, accept_foreign_shards: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let limits = StoreLimits {
            max_blob_size: TEST_MAX_BLOB_SIZE,
            max_storage_bytes: 0,
        };
        let store = Arc::new(ContentStore::open(dir.path(), router, limits).await.unwrap());
        let policy_store = SqlitePolicyStore::new(Database::open_in_memory().unwrap());
        let policy = Arc::new(PolicyFilter::load(Box::new(policy_store)).unwrap());
        let peers = Arc::new(PeerDirectory::new());
        let transport = Arc::new(MockTransport::default());
        let events = event_channel();

        let node = Arc::new(StorageNode::new(
            PeerId::random(),
            store.clone(),
            peers.clone(),
            policy.clone(),
            transport.clone(),
            test_options(factor, accept_foreign_shards),
            events,
        ));

        Self {
            _dir: dir,
            replication: node.replication().clone(),
            node,
            store,
            peers,
            policy,
            transport,
        }
    }

    /// Add a mock peer and mark it connected in the directory.
    pub async fn add_peer(&self, behavior: PeerBehavior) -> PeerId {
        let peer = self.transport.add_peer(behavior);
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/4001/quic-v1".parse().unwrap();
        self.peers.on_connected(peer, addr).await;
        peer
    }

    pub async fn add_peers(&self, count: usize, behavior: PeerBehavior) -> Vec<PeerId> {
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(self.add_peer(behavior).await);
        }
        peers
    }
}
