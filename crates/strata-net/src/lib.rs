// P2P networking layer built on libp2p with QUIC transport.

pub mod behaviour;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod peers;
pub mod requests;
pub mod swarm;
pub mod transport;

pub use behaviour::{StrataBehaviour, StrataEvent};
pub use discovery::{extract_peer_id, load_bootstrap_peers, parse_multiaddrs};
pub use error::NetError;
pub use identity::load_or_generate_keypair;
pub use peers::{PeerDirectory, PeerSummary, PeerUpdate, TargetQuery};
pub use requests::{publish_announcement, respond, send_request};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::build_swarm;

pub use libp2p::{Multiaddr, PeerId};
