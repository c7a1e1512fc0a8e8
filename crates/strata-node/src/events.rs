use serde::Serialize;
use tokio::sync::broadcast;

use strata_shared::Cid;

use crate::gc::GcReport;

/// Capacity of the in-process event channel. Slow subscribers lag and skip.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Node activity broadcast to in-process subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    BlobStored { cid: Cid, size: u64, local: bool },
    BlobDeleted { cid: Cid, size: u64 },
    ReplicaConfirmed { cid: Cid, peer_id: String },
    ReplicaLost { cid: Cid, peer_id: String },
    ReplicationDegraded { cid: Cid, live: usize, required: usize },
    GcCompleted(GcReport),
}

pub fn event_channel() -> broadcast::Sender<NodeEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Publish an event. Having no subscribers is not an error.
pub fn emit(tx: &broadcast::Sender<NodeEvent>, event: NodeEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("No event subscribers");
    }
}
