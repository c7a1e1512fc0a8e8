use std::time::Duration;

use libp2p::identity::Keypair;
use tracing::info;

use crate::behaviour::StrataBehaviour;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Build a QUIC swarm carrying the full [`StrataBehaviour`].
pub fn build_swarm(
    keypair: Keypair,
    enable_mdns: bool,
    request_timeout: Duration,
) -> anyhow::Result<libp2p::Swarm<StrataBehaviour>> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
    use libp2p::kad::{self, store::MemoryStore};
    use libp2p::request_response::{self, ProtocolSupport};
    use libp2p::swarm::behaviour::toggle::Toggle;
    use libp2p::{identify, mdns, SwarmBuilder};

    use strata_shared::constants::{GOSSIPSUB_HEARTBEAT_SECS, MAX_ANNOUNCE_SIZE, PROTOCOL_VERSION};

    use crate::codec::PROTOCOL;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> Result<StrataBehaviour, BoxError> {
            let local_peer_id = key.public().to_peer_id();

            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.data.hash(&mut hasher);
                if let Some(ref source) = message.source {
                    source.hash(&mut hasher);
                }
                MessageId::from(hasher.finish().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_ANNOUNCE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> BoxError { format!("GossipSub config: {e}").into() })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> BoxError { format!("GossipSub init: {e}").into() })?;

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config =
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            let mdns = if enable_mdns {
                Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
            } else {
                None
            };

            let replicate = request_response::Behaviour::new(
                [(PROTOCOL, ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(request_timeout),
            );

            Ok(StrataBehaviour {
                gossipsub,
                kademlia,
                identify,
                mdns: Toggle::from(mdns),
                replicate,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        mdns = enable_mdns,
        "Built storage swarm with QUIC transport"
    );

    Ok(swarm)
}
