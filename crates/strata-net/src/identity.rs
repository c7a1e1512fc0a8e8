use std::fs;
use std::path::Path;

use libp2p::identity::Keypair;
use tracing::info;

use crate::error::NetError;

/// Load the node's Ed25519 keypair from `path`, generating and persisting a
/// new one on first start.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, NetError> {
    if path.exists() {
        let bytes = fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| NetError::Identity(e.to_string()))?;
        info!(peer_id = %keypair.public().to_peer_id(), "Loaded node identity");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| NetError::Identity(e.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;

    info!(
        peer_id = %keypair.public().to_peer_id(),
        path = %path.display(),
        "Generated new node identity"
    );
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = load_or_generate_keypair(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_keypair(&path).unwrap();

        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn test_corrupt_identity_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, b"not a key").unwrap();

        assert!(matches!(
            load_or_generate_keypair(&path),
            Err(NetError::Identity(_))
        ));
    }
}
