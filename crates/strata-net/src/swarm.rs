//! Swarm orchestration with the tokio mpsc command/notification pattern.
//!
//! The swarm event loop runs in a dedicated tokio task. The node talks to it
//! through typed command and notification channels; outbound requests carry
//! a oneshot sender that the loop completes when the response or failure
//! arrives.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad, mdns,
    multiaddr::Protocol,
    request_response::{self, OutboundFailure, OutboundRequestId, ResponseChannel},
    swarm::SwarmEvent,
    Multiaddr, PeerId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use strata_shared::constants::{ANNOUNCE_TOPIC, DEFAULT_QUIC_PORT, DEFAULT_REQUEST_TIMEOUT_MS};
use strata_shared::protocol::{NodeAnnouncement, NodeRequest, NodeResponse};

use crate::behaviour::StrataEvent;
use crate::discovery::{extract_peer_id, load_bootstrap_peers};
use crate::error::NetError;
use crate::transport::build_swarm;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial a remote peer at the given multiaddr.
    Dial(Multiaddr),
    /// Send a request to a peer; the reply sender receives the outcome.
    SendRequest {
        peer: PeerId,
        request: NodeRequest,
        reply: oneshot::Sender<Result<NodeResponse, NetError>>,
    },
    /// Answer an inbound request.
    Respond {
        channel: ResponseChannel<NodeResponse>,
        response: NodeResponse,
    },
    /// Publish this node's announcement on the announce topic.
    Announce(NodeAnnouncement),
    /// Gracefully shut down the swarm.
    Shutdown,
}

/// Notifications sent *from* the swarm task to the node.
#[derive(Debug)]
pub enum SwarmNotification {
    PeerConnected {
        peer_id: PeerId,
        address: Multiaddr,
    },
    /// Fired once the last connection to the peer closes.
    PeerDisconnected {
        peer_id: PeerId,
    },
    /// Addresses learned through mDNS, identify or the DHT.
    PeerDiscovered {
        peer_id: PeerId,
        addresses: Vec<Multiaddr>,
    },
    Announcement {
        source: PeerId,
        announcement: NodeAnnouncement,
    },
    InboundRequest {
        peer: PeerId,
        request: NodeRequest,
        channel: ResponseChannel<NodeResponse>,
    },
}

/// Configuration for spawning the swarm.
pub struct SwarmConfig {
    /// Path to a bootstrap peers file (one multiaddr per line).
    pub bootstrap_peers_path: Option<PathBuf>,
    /// Bootstrap peers given directly in configuration.
    pub bootstrap_peers: Vec<Multiaddr>,
    pub listen_port: u16,
    /// Additional multiaddrs to dial on startup.
    pub extra_dials: Vec<Multiaddr>,
    pub enable_mdns: bool,
    /// Deadline for every outbound request.
    pub request_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            bootstrap_peers: Vec::new(),
            listen_port: DEFAULT_QUIC_PORT,
            extra_dials: Vec::new(),
            enable_mdns: true,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Spawn the libp2p swarm in a background tokio task.
///
/// Returns `(command_tx, notification_rx, local_peer_id)`.
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair, config.enable_mdns, config.request_timeout)?;
    let local_peer_id = *swarm.local_peer_id();

    // Listen on QUIC (IPv4 and IPv6)
    let listen_v4 = Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
        .with(Protocol::Udp(config.listen_port))
        .with(Protocol::QuicV1);
    let listen_v6 = Multiaddr::empty()
        .with(Protocol::Ip6(Ipv6Addr::UNSPECIFIED))
        .with(Protocol::Udp(config.listen_port))
        .with(Protocol::QuicV1);

    swarm.listen_on(listen_v4)?;
    if let Err(e) = swarm.listen_on(listen_v6) {
        warn!(error = %e, "IPv6 listen failed, continuing with IPv4 only");
    }

    info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening");

    let announce_topic = gossipsub::IdentTopic::new(ANNOUNCE_TOPIC);
    swarm.behaviour_mut().gossipsub.subscribe(&announce_topic)?;

    let mut bootstrap_addrs = config.bootstrap_peers.clone();
    if let Some(ref path) = config.bootstrap_peers_path {
        bootstrap_addrs.extend(load_bootstrap_peers(path));
    }

    for addr in &bootstrap_addrs {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            continue;
        }
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }
        debug!(addr = %addr, "Dialing bootstrap peer");
    }

    if !bootstrap_addrs.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    for addr in &config.extra_dials {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial extra address");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let mut pending: HashMap<OutboundRequestId, oneshot::Sender<Result<NodeResponse, NetError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                // --- Incoming commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                error!(addr = %addr, error = %e, "Dial failed");
                            }
                        }
                        Some(SwarmCommand::SendRequest { peer, request, reply }) => {
                            let request_id = swarm
                                .behaviour_mut()
                                .replicate
                                .send_request(&peer, request);
                            pending.insert(request_id, reply);
                        }
                        Some(SwarmCommand::Respond { channel, response }) => {
                            if swarm
                                .behaviour_mut()
                                .replicate
                                .send_response(channel, response)
                                .is_err()
                            {
                                debug!("Response channel closed before reply");
                            }
                        }
                        Some(SwarmCommand::Announce(announcement)) => {
                            match announcement.to_bytes() {
                                Ok(data) => {
                                    if let Err(e) = swarm
                                        .behaviour_mut()
                                        .gossipsub
                                        .publish(announce_topic.clone(), data)
                                    {
                                        debug!(error = %e, "Announcement not published");
                                    }
                                }
                                Err(e) => error!(error = %e, "Failed to encode announcement"),
                            }
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                // --- Swarm events ---
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(StrataEvent::Replicate(
                            request_response::Event::Message { peer, message },
                        )) => match message {
                            request_response::Message::Request { request, channel, .. } => {
                                debug!(peer = %peer, cid = %request.cid(), "Inbound request");
                                let _ = notif_tx
                                    .send(SwarmNotification::InboundRequest { peer, request, channel })
                                    .await;
                            }
                            request_response::Message::Response { request_id, response } => {
                                if let Some(reply) = pending.remove(&request_id) {
                                    let _ = reply.send(Ok(response));
                                }
                            }
                        },

                        SwarmEvent::Behaviour(StrataEvent::Replicate(
                            request_response::Event::OutboundFailure { peer, request_id, error },
                        )) => {
                            debug!(peer = %peer, error = %error, "Outbound request failed");
                            let outcome = match error {
                                OutboundFailure::Timeout => NetError::Timeout,
                                other => NetError::Outbound(other.to_string()),
                            };
                            if let Some(reply) = pending.remove(&request_id) {
                                let _ = reply.send(Err(outcome));
                            }
                        }

                        SwarmEvent::Behaviour(StrataEvent::Replicate(
                            request_response::Event::InboundFailure { peer, error, .. },
                        )) => {
                            warn!(peer = %peer, error = %error, "Inbound request failed");
                        }

                        SwarmEvent::Behaviour(StrataEvent::Gossipsub(
                            gossipsub::Event::Message { propagation_source, message, .. },
                        )) => {
                            let source = message.source.unwrap_or(propagation_source);
                            match NodeAnnouncement::from_bytes(&message.data) {
                                Ok(announcement) => {
                                    let _ = notif_tx
                                        .send(SwarmNotification::Announcement { source, announcement })
                                        .await;
                                }
                                Err(e) => {
                                    debug!(peer = %source, error = %e, "Ignoring undecodable announcement");
                                }
                            }
                        }

                        SwarmEvent::Behaviour(StrataEvent::Mdns(mdns::Event::Discovered(list))) => {
                            let mut found: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                            for (peer_id, addr) in list {
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                                found.entry(peer_id).or_default().push(addr);
                            }
                            for (peer_id, addresses) in found {
                                debug!(peer = %peer_id, "mDNS discovered peer");
                                if !swarm.is_connected(&peer_id) {
                                    if let Some(addr) = addresses.first() {
                                        let _ = swarm.dial(addr.clone());
                                    }
                                }
                                let _ = notif_tx
                                    .send(SwarmNotification::PeerDiscovered { peer_id, addresses })
                                    .await;
                            }
                        }

                        SwarmEvent::Behaviour(StrataEvent::Kademlia(
                            kad::Event::RoutingUpdated { peer, addresses, .. },
                        )) => {
                            let _ = notif_tx
                                .send(SwarmNotification::PeerDiscovered {
                                    peer_id: peer,
                                    addresses: addresses.into_vec(),
                                })
                                .await;
                        }

                        SwarmEvent::Behaviour(StrataEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { result, .. },
                        )) => {
                            debug!(result = ?result, "Kademlia query progressed");
                        }

                        SwarmEvent::Behaviour(StrataEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(
                                peer = %peer_id,
                                protocol = ?info.protocol_version,
                                "Identify: received info from peer"
                            );
                            for addr in &info.listen_addrs {
                                swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr.clone());
                            }
                            let _ = notif_tx
                                .send(SwarmNotification::PeerDiscovered {
                                    peer_id,
                                    addresses: info.listen_addrs,
                                })
                                .await;
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            info!(peer = %peer_id, addr = %addr, "Peer connected");
                            let _ = notif_tx
                                .send(SwarmNotification::PeerConnected { peer_id, address: addr })
                                .await;
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                info!(peer = %peer_id, "Peer disconnected");
                                let _ = notif_tx
                                    .send(SwarmNotification::PeerDisconnected { peer_id })
                                    .await;
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        }

                        SwarmEvent::IncomingConnectionError { error, .. } => {
                            warn!(error = %error, "Incoming connection error");
                        }

                        _ => {}
                    }
                }
            }
        }

        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(NetError::ChannelClosed));
        }
        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}
