//! Replication manager.
//!
//! Keeps exactly `factor` live copies of every locally originated blob (the
//! local copy counts as one). Under-replicated blobs are pushed to targets
//! chosen by the peer directory; each (CID, peer) pair has at most one
//! in-flight ticket, and each blob has at most one replication run in flight,
//! so overlapping runs never push past the factor. A blob that runs out of
//! candidates or retries is marked degraded and left alone until its backoff
//! expires. Holders are re-checked with proof-of-storage challenges, and the
//! same challenge backs the live check the garbage collector and `delete`
//! rely on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use libp2p::PeerId;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use strata_net::{NetError, PeerDirectory, TargetQuery};
use strata_shared::protocol::{NodeRequest, NodeResponse, ReplicatePayload};
use strata_shared::{storage_proof, Cid};
use strata_store::{BlobOrigin, BlobRecord, ContentStore, ReplicaCheck, ReplicaGuard, StoreError};

use crate::events::{emit, NodeEvent};
use crate::policy::PolicyFilter;

pub const REPUTATION_STORE_OK: i64 = 5;
pub const REPUTATION_PROOF_OK: i64 = 2;
pub const REPUTATION_TIMEOUT: i64 = -10;
pub const REPUTATION_FAILURE: i64 = -5;
pub const REPUTATION_PROTOCOL: i64 = -25;
pub const REPUTATION_CORRUPT: i64 = -50;

/// Blobs replicated or verified concurrently per sweep.
const SWEEP_CONCURRENCY: usize = 16;

/// Outbound side of the replicate protocol. The swarm implements it in
/// production; tests substitute an in-process peer set.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn request(&self, peer: PeerId, request: NodeRequest) -> Result<NodeResponse, NetError>;
}

#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Live copies per blob, local copy included.
    pub factor: usize,
    pub request_timeout: Duration,
    /// Candidate rounds after the first one before giving up for this sweep.
    pub max_retries: u32,
    pub verify_sample: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Replication state of one local-origin blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    UnderReplicated,
    FullyReplicated,
    Degraded {
        /// Consecutive sweeps that ended degraded.
        attempts: u32,
        backoff: Duration,
        next_retry: Instant,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GoalCounts {
    pub under_replicated: usize,
    pub fully_replicated: usize,
    pub degraded: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub repaired: usize,
    pub degraded: usize,
    /// Degraded blobs whose backoff has not expired yet.
    pub deferred: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub challenged: usize,
    pub passed: usize,
    pub demoted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChallengeOutcome {
    Valid,
    /// The peer answered but could not prove it holds the blob.
    Invalid,
    Unreachable,
}

/// In-flight push of one blob to one peer. Dropping it closes the ticket.
pub struct Ticket<'a> {
    tickets: &'a Mutex<HashSet<(Cid, PeerId)>>,
    pub cid: Cid,
    pub peer: PeerId,
    pub attempt: u32,
    pub deadline: Instant,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        lock(self.tickets).remove(&(self.cid, self.peer));
    }
}

/// Claim on the single replication run of one blob.
struct RunClaim<'a> {
    running: &'a Mutex<HashSet<Cid>>,
    cid: Cid,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.cid);
    }
}

pub struct ReplicationManager {
    store: Arc<ContentStore>,
    peers: Arc<PeerDirectory>,
    policy: Arc<PolicyFilter>,
    transport: Arc<dyn ReplicaTransport>,
    settings: ReplicationSettings,
    goals: Mutex<HashMap<Cid, GoalState>>,
    tickets: Mutex<HashSet<(Cid, PeerId)>>,
    running: Mutex<HashSet<Cid>>,
    events: broadcast::Sender<NodeEvent>,
}

impl ReplicationManager {
    pub fn new(
        store: Arc<ContentStore>,
        peers: Arc<PeerDirectory>,
        policy: Arc<PolicyFilter>,
        transport: Arc<dyn ReplicaTransport>,
        settings: ReplicationSettings,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            store,
            peers,
            policy,
            transport,
            settings,
            goals: Mutex::new(HashMap::new()),
            tickets: Mutex::new(HashSet::new()),
            running: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Durability floor: copies that must exist besides the local one.
    pub fn required_others(&self) -> usize {
        self.settings.factor.saturating_sub(1)
    }

    pub fn goal(&self, cid: &Cid) -> Option<GoalState> {
        lock(&self.goals).get(cid).copied()
    }

    pub fn goal_counts(&self) -> GoalCounts {
        let goals = lock(&self.goals);
        let mut counts = GoalCounts::default();
        for state in goals.values() {
            match state {
                GoalState::UnderReplicated => counts.under_replicated += 1,
                GoalState::FullyReplicated => counts.fully_replicated += 1,
                GoalState::Degraded { .. } => counts.degraded += 1,
            }
        }
        counts
    }

    /// Drop tracking for a blob that left local storage.
    pub fn forget(&self, cid: &Cid) {
        lock(&self.goals).remove(cid);
    }

    /// Open the ticket for pushing `cid` to `peer`, unless one is in flight.
    pub fn open_ticket(&self, cid: Cid, peer: PeerId, attempt: u32) -> Option<Ticket<'_>> {
        if !lock(&self.tickets).insert((cid, peer)) {
            return None;
        }
        Some(Ticket {
            tickets: &self.tickets,
            cid,
            peer,
            attempt,
            deadline: Instant::now() + self.settings.request_timeout,
        })
    }

    /// Bring one blob up to the replication factor.
    ///
    /// Failed or timed-out pushes are replaced by different candidates for up
    /// to `max_retries` extra rounds. If the blob is still short it becomes
    /// [`GoalState::Degraded`] and the call returns without retrying. While
    /// another run for the same blob is in flight the call pushes nothing and
    /// returns the current goal.
    pub async fn replicate(&self, cid: &Cid) -> Result<GoalState, StoreError> {
        let Some(_claim) = self.claim_run(*cid) else {
            debug!(cid = %cid, "Replication already running");
            return Ok(self.goal(cid).unwrap_or(GoalState::UnderReplicated));
        };

        let record = self.store.metadata(cid)?;
        let required = self.required_others();
        let mut holders = holders_of(&record);
        if holders.len() >= required {
            return Ok(self.set_goal(*cid, GoalState::FullyReplicated));
        }

        let data = self.store.read(cid).await?;
        let mut excluded = holders.clone();
        let mut round = 0u32;

        while holders.len() < required && round <= self.settings.max_retries {
            let targets = self
                .peers
                .select_replication_targets(
                    TargetQuery {
                        shard: record.shard,
                        content_type: record.content_type,
                        count: required - holders.len(),
                        exclude: &excluded,
                    },
                    |peer| self.policy.is_peer_blocked(peer),
                )
                .await;
            if targets.is_empty() {
                debug!(cid = %cid, round, "No replication candidates left");
                break;
            }

            excluded.extend(targets.iter().copied());
            let results = join_all(
                targets
                    .iter()
                    .map(|peer| self.push(*peer, &record, &data, round)),
            )
            .await;

            for (peer, stored) in targets.into_iter().zip(results) {
                if stored {
                    holders.push(peer);
                }
            }
            round += 1;
        }

        if holders.len() >= required {
            info!(cid = %cid, holders = holders.len(), "Blob fully replicated");
            Ok(self.set_goal(*cid, GoalState::FullyReplicated))
        } else {
            Ok(self.degrade(*cid, holders.len(), required))
        }
    }

    /// One pass over every local-origin blob.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = Instant::now();
        let required = self.required_others();
        let mut report = SweepReport::default();
        let mut due = Vec::new();

        let records: Vec<BlobRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.origin.is_local())
            .collect();
        {
            let live: HashSet<Cid> = records.iter().map(|r| r.cid).collect();
            lock(&self.goals).retain(|cid, _| live.contains(cid));
        }

        for record in records {
            report.checked += 1;

            if holders_of(&record).len() >= required {
                self.set_goal(record.cid, GoalState::FullyReplicated);
                report.healthy += 1;
                continue;
            }

            // Degraded goals keep their attempt count until they recover.
            match self.goal(&record.cid) {
                Some(GoalState::Degraded { next_retry, .. }) if next_retry > now => {
                    report.deferred += 1;
                    continue;
                }
                Some(GoalState::Degraded { .. }) => {}
                _ => {
                    self.set_goal(record.cid, GoalState::UnderReplicated);
                }
            }
            due.push(record.cid);
        }

        let results: Vec<Result<GoalState, StoreError>> = stream::iter(due)
            .map(|cid| async move { self.replicate(&cid).await })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(GoalState::FullyReplicated) => report.repaired += 1,
                Ok(GoalState::Degraded { .. }) => report.degraded += 1,
                Ok(GoalState::UnderReplicated) => {}
                Err(StoreError::NotFound(cid)) => {
                    debug!(cid = %cid, "Blob deleted during sweep");
                    self.forget(&cid);
                }
                Err(e) => {
                    warn!(error = %e, "Replication failed");
                    report.errors += 1;
                }
            }
        }

        debug!(?report, "Replication sweep finished");
        Ok(report)
    }

    /// Re-challenge a random sample of recorded holders. Holders that fail the
    /// challenge are removed from the replica set and the blob goes back to
    /// under-replicated.
    pub async fn verify_sample(&self) -> Result<VerifyReport, StoreError> {
        let mut pairs: Vec<(Cid, PeerId)> = self
            .store
            .list()?
            .iter()
            .filter(|r| r.origin.is_local())
            .flat_map(|r| {
                r.replicas
                    .iter()
                    .filter_map(|e| parse_peer(&e.peer_id))
                    .map(|peer| (r.cid, peer))
                    .collect::<Vec<_>>()
            })
            .collect();
        {
            let mut rng = rand::thread_rng();
            pairs.shuffle(&mut rng);
        }
        pairs.truncate(self.settings.verify_sample);

        let outcomes: Vec<Option<ChallengeOutcome>> = stream::iter(pairs)
            .map(|(cid, peer)| async move { self.verify_holder(cid, peer).await })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        let mut report = VerifyReport::default();
        for outcome in outcomes.into_iter().flatten() {
            report.challenged += 1;
            match outcome {
                ChallengeOutcome::Valid => report.passed += 1,
                ChallengeOutcome::Invalid | ChallengeOutcome::Unreachable => report.demoted += 1,
            }
        }

        if report.challenged > 0 {
            info!(
                challenged = report.challenged,
                passed = report.passed,
                demoted = report.demoted,
                "Replica verification round"
            );
        }
        Ok(report)
    }

    /// Live check that at least `required` holders other than this node
    /// still hold the blob.
    pub async fn confirm_other_replicas(&self, record: &BlobRecord, required: usize) -> ReplicaCheck {
        if required == 0 {
            return ReplicaCheck::Confirmed(0);
        }

        let holders = holders_of(record);
        if holders.is_empty() {
            return ReplicaCheck::Unverifiable;
        }

        let payload = match self.store.read(&record.cid).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(cid = %record.cid, error = %e, "Cannot read local copy for verification");
                return ReplicaCheck::Unverifiable;
            }
        };

        let outcomes = join_all(
            holders
                .iter()
                .map(|peer| self.challenge(*peer, &record.cid, &payload)),
        )
        .await;

        let mut live = 0;
        let mut answered = 0;
        for (peer, outcome) in holders.into_iter().zip(outcomes) {
            match outcome {
                ChallengeOutcome::Valid => {
                    live += 1;
                    answered += 1;
                }
                ChallengeOutcome::Invalid => {
                    answered += 1;
                    self.demote(record, peer).await;
                }
                ChallengeOutcome::Unreachable => {}
            }
        }

        let check = if answered == 0 {
            ReplicaCheck::Unverifiable
        } else if live >= required {
            ReplicaCheck::Confirmed(live)
        } else {
            ReplicaCheck::Insufficient { live, required }
        };
        debug!(cid = %record.cid, ?check, "Replica live check");
        check
    }

    fn claim_run(&self, cid: Cid) -> Option<RunClaim<'_>> {
        if !lock(&self.running).insert(cid) {
            return None;
        }
        Some(RunClaim {
            running: &self.running,
            cid,
        })
    }

    async fn verify_holder(&self, cid: Cid, peer: PeerId) -> Option<ChallengeOutcome> {
        let record = self.store.metadata(&cid).ok()?;
        let payload = self.store.read(&cid).await.ok()?;
        let outcome = self.challenge(peer, &cid, &payload).await;
        if outcome != ChallengeOutcome::Valid {
            self.demote(&record, peer).await;
        }
        Some(outcome)
    }

    async fn push(&self, peer: PeerId, record: &BlobRecord, data: &[u8], attempt: u32) -> bool {
        let Some(ticket) = self.open_ticket(record.cid, peer, attempt) else {
            debug!(cid = %record.cid, peer = %peer, "Push already in flight");
            return false;
        };

        let request = NodeRequest::Replicate(ReplicatePayload {
            cid: record.cid,
            content_type: record.content_type,
            guild: record.guild.clone(),
            data: data.to_vec(),
        });
        let response = self.send(peer, request).await;
        debug!(
            cid = %ticket.cid,
            peer = %ticket.peer,
            attempt = ticket.attempt,
            "Push finished"
        );
        drop(ticket);

        match response {
            Ok(NodeResponse::Stored { cid }) if cid == record.cid => {
                let peer_str = peer.to_string();
                if let Err(e) = self.store.add_replica(&cid, &peer_str, Utc::now()).await {
                    warn!(cid = %cid, error = %e, "Failed to record replica");
                    return false;
                }
                self.peers.reputation_adjust(&peer, REPUTATION_STORE_OK).await;
                emit(
                    &self.events,
                    NodeEvent::ReplicaConfirmed {
                        cid,
                        peer_id: peer_str,
                    },
                );
                true
            }
            Ok(NodeResponse::Rejected(reason)) => {
                debug!(cid = %record.cid, peer = %peer, %reason, "Replica push rejected");
                false
            }
            Ok(other) => {
                warn!(cid = %record.cid, peer = %peer, response = ?other, "Unexpected replicate response");
                self.peers.reputation_adjust(&peer, REPUTATION_PROTOCOL).await;
                false
            }
            Err(e) => {
                self.penalize(&peer, &e).await;
                false
            }
        }
    }

    async fn challenge(&self, peer: PeerId, cid: &Cid, payload: &[u8]) -> ChallengeOutcome {
        let nonce: [u8; 32] = rand::random();
        let expected = storage_proof(&nonce, payload);

        match self.send(peer, NodeRequest::Verify { cid: *cid, nonce }).await {
            Ok(NodeResponse::Proof { cid: got, digest }) if got == *cid && digest == expected => {
                self.peers.reputation_adjust(&peer, REPUTATION_PROOF_OK).await;
                if let Err(e) = self.store.add_replica(cid, &peer.to_string(), Utc::now()).await {
                    debug!(cid = %cid, error = %e, "Could not refresh replica timestamp");
                }
                ChallengeOutcome::Valid
            }
            Ok(NodeResponse::Proof { .. }) => {
                warn!(cid = %cid, peer = %peer, "Storage proof mismatch");
                self.peers.reputation_adjust(&peer, REPUTATION_CORRUPT).await;
                ChallengeOutcome::Invalid
            }
            Ok(NodeResponse::NotFound { .. }) => {
                self.peers.reputation_adjust(&peer, REPUTATION_FAILURE).await;
                ChallengeOutcome::Invalid
            }
            Ok(NodeResponse::Rejected(reason)) => {
                debug!(cid = %cid, peer = %peer, %reason, "Verification refused");
                ChallengeOutcome::Invalid
            }
            Ok(other) => {
                warn!(cid = %cid, peer = %peer, response = ?other, "Unexpected verify response");
                self.peers.reputation_adjust(&peer, REPUTATION_PROTOCOL).await;
                ChallengeOutcome::Invalid
            }
            Err(e) => {
                self.penalize(&peer, &e).await;
                ChallengeOutcome::Unreachable
            }
        }
    }

    async fn send(&self, peer: PeerId, request: NodeRequest) -> Result<NodeResponse, NetError> {
        match timeout(self.settings.request_timeout, self.transport.request(peer, request)).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout),
        }
    }

    async fn penalize(&self, peer: &PeerId, err: &NetError) {
        let delta = if err.is_timeout() {
            REPUTATION_TIMEOUT
        } else {
            REPUTATION_FAILURE
        };
        debug!(peer = %peer, error = %err, "Request to peer failed");
        self.peers.reputation_adjust(peer, delta).await;
    }

    async fn demote(&self, record: &BlobRecord, peer: PeerId) {
        let peer_str = peer.to_string();
        match self.store.remove_replica(&record.cid, &peer_str).await {
            Ok(true) => {
                info!(cid = %record.cid, peer = %peer, "Replica holder demoted");
                emit(
                    &self.events,
                    NodeEvent::ReplicaLost {
                        cid: record.cid,
                        peer_id: peer_str,
                    },
                );
            }
            Ok(false) => {}
            Err(e) => warn!(cid = %record.cid, error = %e, "Failed to drop replica holder"),
        }
        if record.origin.is_local() {
            self.set_goal(record.cid, GoalState::UnderReplicated);
        }
    }

    fn set_goal(&self, cid: Cid, state: GoalState) -> GoalState {
        lock(&self.goals).insert(cid, state);
        state
    }

    fn degrade(&self, cid: Cid, live: usize, required: usize) -> GoalState {
        let state = {
            let mut goals = lock(&self.goals);
            let attempts = match goals.get(&cid) {
                Some(GoalState::Degraded { attempts, .. }) => attempts + 1,
                _ => 1,
            };
            let backoff = self.backoff_for(attempts);
            let state = GoalState::Degraded {
                attempts,
                backoff,
                next_retry: Instant::now() + backoff,
            };
            goals.insert(cid, state);
            state
        };

        warn!(cid = %cid, live, required, "Blob degraded, will retry after backoff");
        emit(
            &self.events,
            NodeEvent::ReplicationDegraded {
                cid,
                live,
                required,
            },
        );
        state
    }

    /// `base * 2^(attempts - 1)`, capped at `backoff_max`.
    fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        self.settings
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.settings.backoff_max)
    }
}

#[async_trait]
impl ReplicaGuard for ReplicationManager {
    async fn check_other_replicas(&self, record: &BlobRecord) -> ReplicaCheck {
        self.confirm_other_replicas(record, self.required_others()).await
    }
}

/// Peers believed to hold a copy besides this node. For a blob held on
/// behalf of another node, the originator counts as a holder.
fn holders_of(record: &BlobRecord) -> Vec<PeerId> {
    let mut holders: Vec<PeerId> = record
        .replicas
        .iter()
        .filter_map(|e| parse_peer(&e.peer_id))
        .collect();
    if let BlobOrigin::Replica { from } = &record.origin {
        if let Some(origin) = parse_peer(from) {
            if !holders.contains(&origin) {
                holders.push(origin);
            }
        }
    }
    holders
}

fn parse_peer(raw: &str) -> Option<PeerId> {
    match raw.parse() {
        Ok(peer) => Some(peer),
        Err(e) => {
            warn!(peer = raw, error = %e, "Ignoring unparseable peer id");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, PeerBehavior};
    use strata_shared::ContentType;
    use strata_store::PutOptions;

    async fn put_local(h: &Harness, data: &[u8]) -> Cid {
        h.store
            .put(data, PutOptions::local(ContentType::Post))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_converges_to_replication_factor() {
        let h = Harness::new(3).await;
        let peers = h.add_peers(5, PeerBehavior::Store).await;
        let cid = put_local(&h, b"replicate me").await;

        let report = h.replication.sweep().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(h.replication.goal(&cid), Some(GoalState::FullyReplicated));

        let record = h.store.metadata(&cid).unwrap();
        assert_eq!(record.replicas.len(), 2);
        let holders: Vec<&PeerId> = peers.iter().filter(|p| h.transport.holds(p, &cid)).collect();
        assert_eq!(holders.len(), 2);
        for holder in holders {
            assert!(record.holds_replica(&holder.to_string()));
            assert_eq!(h.peers.reputation(holder).await, Some(REPUTATION_STORE_OK));
        }

        // Converged: nothing more is pushed.
        let before = h.transport.total_requests();
        let again = h.replication.sweep().await.unwrap();
        assert_eq!(again.healthy, 1);
        assert_eq!(h.transport.total_requests(), before);
    }

    #[tokio::test]
    async fn test_overlapping_runs_do_not_overshoot() {
        let h = Harness::new(3).await;
        let peers = h.add_peers(5, PeerBehavior::Store).await;
        h.transport.set_latency(Duration::from_millis(50));
        let cid = put_local(&h, b"initial push racing the sweep").await;

        let (direct, swept) = tokio::join!(h.replication.replicate(&cid), h.replication.sweep());
        assert_eq!(direct.unwrap(), GoalState::FullyReplicated);
        assert_eq!(swept.unwrap().repaired, 0);

        let holding = peers.iter().filter(|p| h.transport.holds(p, &cid)).count();
        assert_eq!(holding, 2);
        assert_eq!(h.store.metadata(&cid).unwrap().replicas.len(), 2);
        assert_eq!(h.transport.total_requests(), 2);

        let after = h.replication.sweep().await.unwrap();
        assert_eq!(after.healthy, 1);
        assert_eq!(h.transport.total_requests(), 2);
    }

    #[tokio::test]
    async fn test_replication_factor_one_needs_no_peers() {
        let h = Harness::new(1).await;
        h.add_peers(2, PeerBehavior::Store).await;
        let cid = put_local(&h, b"solo").await;

        assert_eq!(h.replication.replicate(&cid).await.unwrap(), GoalState::FullyReplicated);
        assert_eq!(h.transport.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_replica_origin_blobs_are_not_driven() {
        let h = Harness::new(3).await;
        h.add_peers(3, PeerBehavior::Store).await;
        let origin = PeerId::random();
        h.store
            .put(b"held for someone", PutOptions::replica(ContentType::Media, origin.to_string()))
            .await
            .unwrap();

        let report = h.replication.sweep().await.unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(h.transport.total_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_other_candidate_then_degrades() {
        let h = Harness::new(2).await;
        let slow = h.add_peer(PeerBehavior::Silent).await;
        let slower = h.add_peer(PeerBehavior::Silent).await;
        h.peers.reputation_adjust(&slow, 100).await;
        h.peers.reputation_adjust(&slower, 50).await;
        let cid = put_local(&h, b"nobody answers").await;

        let started = Instant::now();
        let report = h.replication.sweep().await.unwrap();
        let elapsed = started.elapsed();

        let deadline = h.replication.settings().request_timeout;
        assert_eq!(report.degraded, 1);
        assert!(elapsed >= deadline * 2);
        assert!(elapsed < deadline * 3);
        assert_eq!(h.transport.requests_to(&slow), 1);
        assert_eq!(h.transport.requests_to(&slower), 1);
        assert_eq!(h.peers.reputation(&slow).await, Some(100 + REPUTATION_TIMEOUT));
        assert_eq!(h.peers.reputation(&slower).await, Some(50 + REPUTATION_TIMEOUT));

        let Some(GoalState::Degraded { attempts, backoff, .. }) = h.replication.goal(&cid) else {
            panic!("expected degraded goal");
        };
        assert_eq!(attempts, 1);
        assert_eq!(backoff, h.replication.settings().backoff_base);

        // Not retried until the backoff is due.
        let deferred = h.replication.sweep().await.unwrap();
        assert_eq!(deferred.deferred, 1);
        assert_eq!(h.transport.total_requests(), 2);

        tokio::time::advance(backoff).await;
        h.transport.set_behavior(&slow, PeerBehavior::Store);
        let retried = h.replication.sweep().await.unwrap();
        assert_eq!(retried.repaired, 1);
        assert_eq!(h.replication.goal(&cid), Some(GoalState::FullyReplicated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_candidate_is_replaced() {
        let h = Harness::new(2).await;
        let silent = h.add_peer(PeerBehavior::Silent).await;
        let good = h.add_peer(PeerBehavior::Store).await;
        h.peers.reputation_adjust(&silent, 100).await;
        let cid = put_local(&h, b"second time lucky").await;

        assert_eq!(h.replication.replicate(&cid).await.unwrap(), GoalState::FullyReplicated);
        let record = h.store.metadata(&cid).unwrap();
        assert!(record.holds_replica(&good.to_string()));
        assert!(!record.holds_replica(&silent.to_string()));
    }

    #[tokio::test]
    async fn test_rejecting_peers_leave_blob_degraded() {
        let h = Harness::new(3).await;
        h.add_peers(2, PeerBehavior::Reject).await;
        let cid = put_local(&h, b"unwanted").await;

        let state = h.replication.replicate(&cid).await.unwrap();
        assert!(matches!(state, GoalState::Degraded { attempts: 1, .. }));
        assert_eq!(h.replication.goal_counts().degraded, 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let h = Harness::new(3).await;
        let base = h.replication.settings().backoff_base;
        let max = h.replication.settings().backoff_max;
        assert_eq!(h.replication.backoff_for(1), base);
        assert_eq!(h.replication.backoff_for(2), base * 2);
        assert_eq!(h.replication.backoff_for(3), base * 4);
        assert_eq!(h.replication.backoff_for(40), max);
    }

    #[tokio::test]
    async fn test_ticket_is_exclusive_per_cid_and_peer() {
        let h = Harness::new(3).await;
        let cid = Cid::of(b"ticketed");
        let peer = PeerId::random();

        let ticket = h.replication.open_ticket(cid, peer, 0).unwrap();
        assert!(h.replication.open_ticket(cid, peer, 1).is_none());
        assert!(h.replication.open_ticket(cid, PeerId::random(), 0).is_some());
        assert!(h.replication.open_ticket(Cid::of(b"other"), peer, 0).is_some());
        drop(ticket);
        assert!(h.replication.open_ticket(cid, peer, 2).is_some());
    }

    #[tokio::test]
    async fn test_verification_demotes_corrupt_holder() {
        let h = Harness::new(3).await;
        let peers = h.add_peers(2, PeerBehavior::Store).await;
        let cid = put_local(&h, b"verify me").await;
        h.replication.replicate(&cid).await.unwrap();

        h.transport.set_behavior(&peers[0], PeerBehavior::Corrupt);
        let report = h.replication.verify_sample().await.unwrap();

        assert_eq!(report.challenged, 2);
        assert_eq!(report.passed, 1);
        assert_eq!(report.demoted, 1);
        let record = h.store.metadata(&cid).unwrap();
        assert!(!record.holds_replica(&peers[0].to_string()));
        assert!(record.holds_replica(&peers[1].to_string()));
        assert_eq!(h.replication.goal(&cid), Some(GoalState::UnderReplicated));
        assert_eq!(
            h.peers.reputation(&peers[0]).await,
            Some(REPUTATION_STORE_OK + REPUTATION_CORRUPT)
        );
    }

    #[tokio::test]
    async fn test_live_check_outcomes() {
        let h = Harness::new(3).await;
        let peers = h.add_peers(2, PeerBehavior::Store).await;
        let cid = put_local(&h, b"check me").await;

        let record = h.store.metadata(&cid).unwrap();
        assert_eq!(
            h.replication.confirm_other_replicas(&record, 2).await,
            ReplicaCheck::Unverifiable
        );
        assert_eq!(
            h.replication.confirm_other_replicas(&record, 0).await,
            ReplicaCheck::Confirmed(0)
        );

        h.replication.replicate(&cid).await.unwrap();
        let record = h.store.metadata(&cid).unwrap();
        assert_eq!(
            h.replication.check_other_replicas(&record).await,
            ReplicaCheck::Confirmed(2)
        );

        h.transport.set_behavior(&peers[1], PeerBehavior::Forget);
        assert_eq!(
            h.replication.check_other_replicas(&record).await,
            ReplicaCheck::Insufficient { live: 1, required: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_check_unreachable_holders_is_unverifiable() {
        let h = Harness::new(2).await;
        let peer = h.add_peer(PeerBehavior::Store).await;
        let cid = put_local(&h, b"gone quiet").await;
        h.replication.replicate(&cid).await.unwrap();

        h.transport.set_behavior(&peer, PeerBehavior::Silent);
        let record = h.store.metadata(&cid).unwrap();
        assert_eq!(
            h.replication.check_other_replicas(&record).await,
            ReplicaCheck::Unverifiable
        );
        // Unreachable is not proof of loss; the holder stays recorded.
        assert!(h.store.metadata(&cid).unwrap().holds_replica(&peer.to_string()));
    }
}
