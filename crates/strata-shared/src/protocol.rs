use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cid::Cid;
use crate::types::{ContentType, GuildId, ShardRange};

/// Requests carried over the `/strata/replicate` request/response protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Push a blob to a peer selected as replica holder.
    Replicate(ReplicatePayload),

    /// Proof-of-storage challenge: answer with `storage_proof(nonce, payload)`.
    Verify { cid: Cid, nonce: [u8; 32] },

    /// Download a blob.
    Fetch { cid: Cid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatePayload {
    pub cid: Cid,
    pub content_type: ContentType,
    pub guild: Option<GuildId>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeResponse {
    /// Blob persisted by the receiver.
    Stored { cid: Cid },
    /// Request refused, never retried by the receiver.
    Rejected(Rejection),
    /// Answer to a `Verify` challenge.
    Proof { cid: Cid, digest: [u8; 32] },
    /// Answer to a `Fetch`.
    Blob { cid: Cid, data: Vec<u8> },
    /// The receiver does not hold the blob.
    NotFound { cid: Cid },
}

/// Typed refusal of an inbound replicate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    ShardMismatch,
    PolicyBlocked,
    CapacityExceeded,
    SizeExceeded,
    /// Payload does not hash to the announced CID, or the request was garbled.
    Malformed(String),
    /// The receiver hit a local storage failure.
    Unavailable,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShardMismatch => f.write_str("shard mismatch"),
            Self::PolicyBlocked => f.write_str("blocked by policy"),
            Self::CapacityExceeded => f.write_str("capacity exceeded"),
            Self::SizeExceeded => f.write_str("size exceeded"),
            Self::Malformed(reason) => write!(f, "malformed request: {reason}"),
            Self::Unavailable => f.write_str("storage unavailable"),
        }
    }
}

/// Periodic gossip advertisement of what a node is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub shard_count: u32,
    pub shard_ranges: Vec<ShardRange>,
    pub content_types: Vec<ContentType>,
}

impl NodeRequest {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn cid(&self) -> &Cid {
        match self {
            Self::Replicate(payload) => &payload.cid,
            Self::Verify { cid, .. } | Self::Fetch { cid } => cid,
        }
    }
}

impl NodeResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl NodeAnnouncement {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_request_roundtrip() {
        let data = b"blob bytes".to_vec();
        let req = NodeRequest::Replicate(ReplicatePayload {
            cid: Cid::of(&data),
            content_type: ContentType::Post,
            guild: Some(GuildId::new("g1")),
            data: data.clone(),
        });

        let restored = NodeRequest::from_bytes(&req.to_bytes().unwrap()).unwrap();
        match restored {
            NodeRequest::Replicate(payload) => {
                assert!(payload.cid.matches(&payload.data));
                assert_eq!(payload.guild, Some(GuildId::new("g1")));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_rejection_survives_the_wire() {
        let resp = NodeResponse::Rejected(Rejection::CapacityExceeded);
        match NodeResponse::from_bytes(&resp.to_bytes().unwrap()).unwrap() {
            NodeResponse::Rejected(r) => assert_eq!(r, Rejection::CapacityExceeded),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
