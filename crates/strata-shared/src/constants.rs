/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/strata/1.0.0";

/// Request/response protocol for replicate, verify and fetch
pub const REPLICATE_PROTOCOL: &str = "/strata/replicate/1.0.0";

/// GossipSub topic carrying node shard announcements
pub const ANNOUNCE_TOPIC: &str = "strata/announce/1";

/// Application name
pub const APP_NAME: &str = "Strata";

/// BLAKE3 derive-key context for the shard hash. Network constant.
pub const SHARD_HASH_CONTEXT: &str = "strata-shard-v1";

/// Default network-wide shard count
pub const DEFAULT_SHARD_COUNT: u32 = 1024;

/// Upper bound accepted for the shard count
pub const MAX_SHARD_COUNT: u32 = 1 << 20;

/// Default number of live copies per blob, local copy included
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Maximum blob size in bytes (50 MiB)
pub const MAX_BLOB_SIZE: usize = 50 * 1024 * 1024;

/// Maximum announcement size in bytes (64 KiB)
pub const MAX_ANNOUNCE_SIZE: usize = 65_536;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Default HTTP status bridge port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Outbound replicate/verify deadline in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Garbage collection interval in seconds (10 minutes)
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 600;

/// Reputation bounds
pub const MIN_REPUTATION: i64 = -1_000;
pub const MAX_REPUTATION: i64 = 1_000;
