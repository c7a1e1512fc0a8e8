//! Node configuration.
//!
//! Loaded from the JSON file named by `STRATA_CONFIG` (default
//! `./strata.json`), then overridden by environment variables, then
//! validated. Every field has a default so the node starts with no file at
//! all for local development.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use strata_shared::constants::{
    DEFAULT_GC_INTERVAL_SECS, DEFAULT_HTTP_PORT, DEFAULT_QUIC_PORT, DEFAULT_REPLICATION_FACTOR,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SHARD_COUNT, MAX_BLOB_SIZE,
};
use strata_shared::shard::partition_ranges;
use strata_shared::{ContentType, ShardRange, ShardRouter};
use strata_store::StoreLimits;

use crate::error::ConfigError;
use crate::gc::{GcSettings, RetentionMode};
use crate::node::NodeOptions;
use crate::replication::ReplicationSettings;

pub const DEFAULT_CONFIG_PATH: &str = "./strata.json";
pub const IDENTITY_FILE_NAME: &str = "identity.key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub sharding: ShardingSection,
    pub replication: ReplicationSection,
    pub gc: GcSection,
    pub storage: StorageSection,
    pub peers: PeersSection,
    /// Content types this node advertises and accepts replicas for.
    pub content_types: Vec<ContentType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Env: `STRATA_DATA_DIR`. Default: the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// QUIC listen port. Env: `STRATA_LISTEN_PORT`.
    pub listen_port: u16,
    /// HTTP status/control bridge. Env: `STRATA_HTTP_ADDR`.
    pub http_addr: SocketAddr,
    /// Bearer token for admin routes; admin API disabled when unset.
    /// Env: `STRATA_ADMIN_TOKEN`.
    pub admin_token: Option<String>,
    pub bootstrap_peers_file: Option<PathBuf>,
    /// Env: `STRATA_BOOTSTRAP_PEERS` (comma separated multiaddrs).
    pub bootstrap_peers: Vec<String>,
    pub extra_dials: Vec<String>,
    pub enable_mdns: bool,
    pub announce_interval_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: None,
            listen_port: DEFAULT_QUIC_PORT,
            http_addr: ([127, 0, 0, 1], DEFAULT_HTTP_PORT).into(),
            admin_token: None,
            bootstrap_peers_file: None,
            bootstrap_peers: Vec::new(),
            extra_dials: Vec::new(),
            enable_mdns: true,
            announce_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingSection {
    /// Fixed for the lifetime of the network.
    pub shard_count: u32,
    /// Inclusive ranges this node is responsible for. Left empty, the node
    /// takes the whole shard space.
    pub ranges: Vec<ShardRange>,
}

impl Default for ShardingSection {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Live copies per blob, local copy included.
    pub factor: usize,
    pub request_timeout_ms: u64,
    /// Extra candidate rounds after the first push before a blob is degraded.
    pub max_retries: u32,
    pub sweep_interval_secs: u64,
    pub verify_interval_secs: u64,
    /// Replica holders challenged per verification round.
    pub verify_sample: usize,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Accept replica pushes for shards outside our ranges.
    pub accept_foreign_shards: bool,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            factor: DEFAULT_REPLICATION_FACTOR,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: 2,
            sweep_interval_secs: 30,
            verify_interval_secs: 300,
            verify_sample: 16,
            backoff_base_secs: 30,
            backoff_max_secs: 3_600,
            accept_foreign_shards: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub mode: RetentionMode,
    pub interval_secs: u64,
    /// 0 = unlimited.
    pub max_storage_bytes: u64,
    pub reserved_for_pinned_bytes: u64,
    /// 0 = no age limit.
    pub max_age_secs: u64,
    pub max_candidates: usize,
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            mode: RetentionMode::Hybrid,
            interval_secs: DEFAULT_GC_INTERVAL_SECS,
            max_storage_bytes: 10 * 1024 * 1024 * 1024,
            reserved_for_pinned_bytes: 0,
            max_age_secs: 30 * 24 * 3_600,
            max_candidates: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub max_blob_size: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            max_blob_size: MAX_BLOB_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersSection {
    /// Disconnected peers unseen for this long are dropped.
    pub prune_after_secs: u64,
}

impl Default for PeersSection {
    fn default() -> Self {
        Self {
            prune_after_secs: 24 * 3_600,
        }
    }
}

/// Longest duration setting in seconds that `chrono::Duration` can hold
/// (it counts milliseconds in an `i64`).
pub const MAX_DURATION_SECS: u64 = (i64::MAX / 1_000) as u64;

/// Seconds from configuration as a `chrono::Duration`, saturating at
/// [`MAX_DURATION_SECS`].
pub fn duration_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

impl NodeConfig {
    /// File, then environment, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("STRATA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Apply `STRATA_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("STRATA_DATA_DIR") {
            self.node.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(port) = lookup("STRATA_LISTEN_PORT") {
            self.node.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "STRATA_LISTEN_PORT",
                value: port.clone(),
            })?;
        }

        if let Some(addr) = lookup("STRATA_HTTP_ADDR") {
            self.node.http_addr = addr.parse().map_err(|_| ConfigError::InvalidValue {
                key: "STRATA_HTTP_ADDR",
                value: addr.clone(),
            })?;
        }

        if let Some(token) = lookup("STRATA_ADMIN_TOKEN") {
            if !token.is_empty() {
                self.node.admin_token = Some(token);
            }
        }

        if let Some(peers) = lookup("STRATA_BOOTSTRAP_PEERS") {
            self.node.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(())
    }

    /// Reject fatal settings; drop invalid shard ranges, clamp durations
    /// chrono cannot hold and flag an over-reserved GC budget with warnings.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.replication.factor < 1 {
            return Err(ConfigError::InvalidReplicationFactor(self.replication.factor));
        }

        // Errors on a zero or oversized shard count.
        ShardRouter::full(self.sharding.shard_count)?;

        if self.sharding.ranges.is_empty() {
            self.sharding.ranges = vec![ShardRange::full(self.sharding.shard_count)];
        }

        let (valid, invalid) = partition_ranges(&self.sharding.ranges, self.sharding.shard_count);
        for range in &invalid {
            warn!(
                start = range.start,
                end = range.end,
                shard_count = self.sharding.shard_count,
                "Dropping invalid shard range"
            );
        }
        if !invalid.is_empty() && valid.is_empty() {
            warn!("No valid shard ranges left, node will not originate any shard");
        }
        self.sharding.ranges = valid;

        if self.gc.max_storage_bytes > 0
            && self.gc.reserved_for_pinned_bytes > self.gc.max_storage_bytes
        {
            warn!(
                reserved = self.gc.reserved_for_pinned_bytes,
                max = self.gc.max_storage_bytes,
                "Reserved-for-pinned exceeds max storage, GC runs best-effort"
            );
        }

        if self.content_types.is_empty() {
            self.content_types = ContentType::ALL.to_vec();
        }

        for (key, value) in [
            ("gc.max_age_secs", &mut self.gc.max_age_secs),
            ("peers.prune_after_secs", &mut self.peers.prune_after_secs),
        ] {
            if *value > MAX_DURATION_SECS {
                warn!(key, value = *value, max = MAX_DURATION_SECS, "Duration too large, clamping");
                *value = MAX_DURATION_SECS;
            }
        }

        for (key, value) in [
            ("replication.sweep_interval_secs", &mut self.replication.sweep_interval_secs),
            ("replication.verify_interval_secs", &mut self.replication.verify_interval_secs),
            ("gc.interval_secs", &mut self.gc.interval_secs),
            ("node.announce_interval_secs", &mut self.node.announce_interval_secs),
        ] {
            if *value == 0 {
                warn!(key, "Interval of zero is not allowed, using one second");
                *value = 1;
            }
        }

        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.node.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(strata_store::database::default_data_dir()?),
        }
    }

    pub fn identity_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join(IDENTITY_FILE_NAME))
    }

    /// Shard router for the validated assignment.
    pub fn router(&self) -> Result<ShardRouter, ConfigError> {
        Ok(ShardRouter::new(
            self.sharding.shard_count,
            self.sharding.ranges.clone(),
        )?)
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_blob_size: self.storage.max_blob_size,
            max_storage_bytes: self.gc.max_storage_bytes,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.request_timeout_ms)
    }

    pub fn replication_settings(&self) -> ReplicationSettings {
        let r = &self.replication;
        ReplicationSettings {
            factor: r.factor,
            request_timeout: self.request_timeout(),
            max_retries: r.max_retries,
            verify_sample: r.verify_sample,
            backoff_base: Duration::from_secs(r.backoff_base_secs),
            backoff_max: Duration::from_secs(r.backoff_max_secs),
        }
    }

    pub fn gc_settings(&self) -> GcSettings {
        GcSettings {
            mode: self.gc.mode,
            max_storage_bytes: self.gc.max_storage_bytes,
            reserved_for_pinned_bytes: self.gc.reserved_for_pinned_bytes,
            max_age: (self.gc.max_age_secs > 0).then(|| duration_secs(self.gc.max_age_secs)),
            max_candidates: self.gc.max_candidates,
        }
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            replication: self.replication_settings(),
            gc: self.gc_settings(),
            accept_foreign_shards: self.replication.accept_foreign_shards,
            content_types: self.content_types.clone(),
        }
    }
}
