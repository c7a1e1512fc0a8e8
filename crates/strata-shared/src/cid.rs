use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SharedError;

/// Content identifier: the BLAKE3 hash of a blob's bytes.
///
/// The hash function is a network-wide constant. Changing it would make
/// every existing CID (and therefore every shard assignment) disagree
/// between old and new nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub [u8; 32]);

impl Cid {
    /// Compute the CID of a payload.
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// Returns true if `payload` hashes to this CID.
    pub fn matches(&self, payload: &[u8]) -> bool {
        Self::of(payload) == *self
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SharedError> {
        let bytes = hex::decode(s.trim()).map_err(|e| SharedError::InvalidCid(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(SharedError::InvalidCid(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Cid {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Hex in JSON (status bridge, policy documents), raw bytes on the wire.
impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Cid::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Cid)
        }
    }
}

/// Proof that a peer holds the full payload: BLAKE3 keyed by a fresh nonce.
///
/// The verifier picks the nonce, so the answer cannot be precomputed or
/// cached without the bytes.
pub fn storage_proof(nonce: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(nonce, payload).as_bytes()
}
