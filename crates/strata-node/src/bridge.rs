//! Glue between the swarm task and the storage node.
//!
//! Swarm notifications update the peer directory and feed inbound requests
//! to [`StorageNode::handle_request`], each on its own task so one slow disk
//! read never holds up the rest. Outbound requests go back through the
//! swarm's command channel via [`SwarmTransport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use strata_net::{publish_announcement, respond, send_request, NetError, PeerUpdate, SwarmCommand, SwarmNotification};
use strata_shared::protocol::{NodeRequest, NodeResponse};

use crate::config::{duration_secs, NodeConfig};
use crate::events::{emit, NodeEvent};
use crate::node::StorageNode;
use crate::replication::ReplicaTransport;

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// [`ReplicaTransport`] backed by the libp2p request/response protocol.
#[derive(Clone)]
pub struct SwarmTransport {
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmTransport {
    pub fn new(cmd_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self { cmd_tx }
    }
}

#[async_trait]
impl ReplicaTransport for SwarmTransport {
    async fn request(&self, peer: PeerId, request: NodeRequest) -> Result<NodeResponse, NetError> {
        send_request(&self.cmd_tx, peer, request).await
    }
}

/// Periods of the node's background jobs.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub sweep: Duration,
    pub verify: Duration,
    pub gc: Duration,
    pub announce: Duration,
    pub prune: Duration,
    pub prune_after: chrono::Duration,
}

impl Schedule {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            sweep: Duration::from_secs(config.replication.sweep_interval_secs),
            verify: Duration::from_secs(config.replication.verify_interval_secs),
            gc: Duration::from_secs(config.gc.interval_secs),
            announce: Duration::from_secs(config.node.announce_interval_secs),
            prune: PRUNE_INTERVAL,
            prune_after: duration_secs(config.peers.prune_after_secs),
        }
    }
}

pub fn spawn_notification_loop(
    node: Arc<StorageNode>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    notif_rx: mpsc::Receiver<SwarmNotification>,
) -> JoinHandle<()> {
    tokio::spawn(notification_loop(node, cmd_tx, notif_rx))
}

async fn notification_loop(
    node: Arc<StorageNode>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    mut notif_rx: mpsc::Receiver<SwarmNotification>,
) {
    info!("Swarm notification bridge started");

    while let Some(notification) = notif_rx.recv().await {
        match notification {
            SwarmNotification::PeerConnected { peer_id, address } => {
                node.peers().on_connected(peer_id, address).await;
                emit(
                    node.events(),
                    NodeEvent::PeerConnected {
                        peer_id: peer_id.to_string(),
                    },
                );
            }

            SwarmNotification::PeerDisconnected { peer_id } => {
                node.peers().on_disconnected(&peer_id).await;
                emit(
                    node.events(),
                    NodeEvent::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    },
                );
            }

            SwarmNotification::PeerDiscovered { peer_id, addresses } => {
                node.peers()
                    .upsert(PeerUpdate::discovered(peer_id, addresses))
                    .await;
            }

            SwarmNotification::Announcement {
                source,
                announcement,
            } => {
                node.on_announcement(source, &announcement).await;
            }

            SwarmNotification::InboundRequest {
                peer,
                request,
                channel,
            } => {
                let node = node.clone();
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    let response = node.handle_request(peer, request).await;
                    if let Err(e) = respond(&cmd_tx, channel, response).await {
                        debug!(peer = %peer, error = %e, "Could not send response");
                    }
                });
            }
        }
    }

    info!("Swarm notification bridge stopped");
}

/// Start the replication sweep, verification, GC, peer pruning and
/// announcement timers.
pub fn spawn_background_tasks(
    node: Arc<StorageNode>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    schedule: Schedule,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let n = node.clone();
    handles.push(every(schedule.sweep, move || {
        let n = n.clone();
        async move {
            if let Err(e) = n.replication().sweep().await {
                warn!(error = %e, "Replication sweep failed");
            }
        }
    }));

    let n = node.clone();
    handles.push(every(schedule.verify, move || {
        let n = n.clone();
        async move {
            if let Err(e) = n.replication().verify_sample().await {
                warn!(error = %e, "Replica verification failed");
            }
        }
    }));

    let n = node.clone();
    handles.push(every(schedule.gc, move || {
        let n = n.clone();
        async move {
            if let Err(e) = n.gc().run_cycle().await {
                warn!(error = %e, "GC cycle failed");
            }
        }
    }));

    let n = node.clone();
    let prune_after = schedule.prune_after;
    handles.push(every(schedule.prune, move || {
        let n = n.clone();
        async move {
            let pruned = n.peers().prune(prune_after).await;
            if pruned > 0 {
                info!(pruned, "Pruned absent peers");
            }
        }
    }));

    handles.push(every(schedule.announce, move || {
        let node = node.clone();
        let cmd_tx = cmd_tx.clone();
        async move {
            if let Err(e) = publish_announcement(&cmd_tx, node.announcement()).await {
                warn!(error = %e, "Failed to publish announcement");
            }
        }
    }));

    handles
}

/// Run `job` every `period`, the first time after one full period. A job
/// that overruns delays the next tick instead of bunching them up.
fn every<F, Fut>(period: Duration, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            job().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use libp2p::Multiaddr;
    use strata_shared::protocol::NodeAnnouncement;
    use strata_shared::{Cid, ContentType, ShardRange};

    #[tokio::test]
    async fn test_swarm_transport_uses_command_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = SwarmTransport::new(tx);
        let cid = Cid::of(b"over the wire");

        tokio::spawn(async move {
            if let Some(SwarmCommand::SendRequest { reply, .. }) = rx.recv().await {
                let _ = reply.send(Ok(NodeResponse::Stored { cid }));
            }
        });

        let response = transport
            .request(PeerId::random(), NodeRequest::Fetch { cid })
            .await
            .unwrap();
        assert!(matches!(response, NodeResponse::Stored { .. }));
    }

    #[tokio::test]
    async fn test_notifications_update_peer_directory() {
        let h = Harness::new(3).await;
        let mut events = h.node.subscribe();
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let (notif_tx, notif_rx) = mpsc::channel(8);
        let handle = spawn_notification_loop(h.node.clone(), cmd_tx, notif_rx);

        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.7/udp/4001/quic-v1".parse().unwrap();
        notif_tx
            .send(SwarmNotification::PeerConnected {
                peer_id: peer,
                address: addr,
            })
            .await
            .unwrap();
        notif_tx
            .send(SwarmNotification::Announcement {
                source: peer,
                announcement: NodeAnnouncement {
                    shard_count: 1024,
                    shard_ranges: vec![ShardRange::new(0, 511)],
                    content_types: vec![ContentType::Media],
                },
            })
            .await
            .unwrap();
        let other = PeerId::random();
        notif_tx
            .send(SwarmNotification::PeerDiscovered {
                peer_id: other,
                addresses: Vec::new(),
            })
            .await
            .unwrap();
        drop(notif_tx);
        handle.await.unwrap();

        assert!(h.peers.is_connected(&peer).await);
        assert!(!h.peers.is_connected(&other).await);
        assert_eq!(h.peers.known_count().await, 2);
        let summary = h
            .peers
            .summaries()
            .await
            .into_iter()
            .find(|s| s.peer_id == peer.to_string())
            .unwrap();
        assert_eq!(summary.shard_ranges, vec![ShardRange::new(0, 511)]);
        assert!(matches!(
            events.recv().await.unwrap(),
            NodeEvent::PeerConnected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_timer_publishes() {
        let h = Harness::new(1).await;
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let schedule = Schedule {
            sweep: Duration::from_secs(3600),
            verify: Duration::from_secs(3600),
            gc: Duration::from_secs(3600),
            announce: Duration::from_secs(60),
            prune: Duration::from_secs(3600),
            prune_after: chrono::Duration::hours(24),
        };
        let handles = spawn_background_tasks(h.node.clone(), cmd_tx, schedule);

        match cmd_rx.recv().await {
            Some(SwarmCommand::Announce(announcement)) => {
                assert_eq!(announcement.shard_count, 1024);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        for handle in handles {
            handle.abort();
        }
    }
}
