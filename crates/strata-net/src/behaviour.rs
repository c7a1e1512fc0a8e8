//! Composed libp2p `NetworkBehaviour` for a storage node.
//!
//! Combines GossipSub (shard announcements), Kademlia (DHT peer discovery),
//! Identify (protocol negotiation), optional mDNS (local network discovery),
//! and the request/response replicate protocol.

use libp2p::{
    gossipsub, identify,
    kad::{self, store::MemoryStore},
    mdns, request_response,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};

use strata_shared::protocol::{NodeRequest, NodeResponse};

use crate::codec::ReplicateCodec;

/// Composed network behaviour for storage nodes.
///
/// Construction is handled by [`super::transport::build_swarm`].
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "StrataEvent")]
pub struct StrataBehaviour {
    /// Shard/content-type announcements
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    /// Disabled when the node runs with `enable_mdns = false`
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Replicate / verify / fetch exchanges
    pub replicate: request_response::Behaviour<ReplicateCodec>,
}

/// Events emitted by the composed behaviour, one variant per sub-behaviour.
#[derive(Debug)]
pub enum StrataEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
    Mdns(mdns::Event),
    Replicate(request_response::Event<NodeRequest, NodeResponse>),
}

impl From<gossipsub::Event> for StrataEvent {
    fn from(event: gossipsub::Event) -> Self {
        StrataEvent::Gossipsub(event)
    }
}

impl From<kad::Event> for StrataEvent {
    fn from(event: kad::Event) -> Self {
        StrataEvent::Kademlia(event)
    }
}

impl From<identify::Event> for StrataEvent {
    fn from(event: identify::Event) -> Self {
        StrataEvent::Identify(event)
    }
}

impl From<mdns::Event> for StrataEvent {
    fn from(event: mdns::Event) -> Self {
        StrataEvent::Mdns(event)
    }
}

impl From<request_response::Event<NodeRequest, NodeResponse>> for StrataEvent {
    fn from(event: request_response::Event<NodeRequest, NodeResponse>) -> Self {
        StrataEvent::Replicate(event)
    }
}
