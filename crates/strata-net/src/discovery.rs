//! Bootstrap peer loading.
//!
//! Reads a file of multiaddrs (one per line) for the swarm to dial on
//! startup, and parses multiaddr lists supplied through configuration.

use std::fs;
use std::path::Path;

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use tracing::{debug, info, warn};

/// Load bootstrap peer multiaddrs from a file. An unreadable file yields an
/// empty list.
///
/// ```text
/// # storage bootstrap nodes
/// /ip4/198.51.100.10/udp/4001/quic-v1/p2p/12D3KooW...
/// ```
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let addrs = parse_bootstrap_list(&content);
            info!(count = addrs.len(), path = %path.display(), "Loaded bootstrap peers");
            addrs
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Bootstrap peers file unreadable");
            Vec::new()
        }
    }
}

/// Parse a bootstrap list: one multiaddr per line, `#` starts a comment
/// line, blank lines and malformed entries are skipped.
pub fn parse_bootstrap_list(content: &str) -> Vec<Multiaddr> {
    let mut addrs = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        match entry.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Bootstrap entry");
                addrs.push(addr);
            }
            Err(e) => warn!(line = lineno + 1, error = %e, "Ignoring malformed bootstrap entry"),
        }
    }
    addrs
}

/// Parse configured multiaddr strings, dropping the ones that do not parse.
pub fn parse_multiaddrs(raw: &[String]) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|s| {
            s.parse::<Multiaddr>().ok().or_else(|| {
                warn!(addr = %s, "Could not parse multiaddr");
                None
            })
        })
        .collect()
}

/// Extract the trailing `/p2p/<peer id>` component of a multiaddr.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
