//! # strata-node
//!
//! Long-running storage node. Stores content-addressed blobs for the shard
//! ranges it is configured for, keeps every locally originated blob at the
//! replication factor across the network, and reclaims space with a
//! durability-safe garbage collector.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use strata_net::{parse_multiaddrs, spawn_swarm, PeerDirectory, SwarmCommand, SwarmConfig};
use strata_store::{ContentStore, Database};

use strata_node::api::{self, AppState};
use strata_node::bridge::{spawn_background_tasks, spawn_notification_loop, Schedule, SwarmTransport};
use strata_node::events::event_channel;
use strata_node::{NodeConfig, PolicyFilter, SqlitePolicyStore, StorageNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strata_node=debug")),
        )
        .init();

    info!("Starting Strata storage node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::load()?;
    let data_dir = config.data_dir()?;
    info!(
        data_dir = %data_dir.display(),
        shard_count = config.sharding.shard_count,
        ranges = config.sharding.ranges.len(),
        replication_factor = config.replication.factor,
        gc_mode = ?config.gc.mode,
        admin_enabled = config.node.admin_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Storage, identity and policy
    // -----------------------------------------------------------------------
    let keypair = strata_net::load_or_generate_keypair(&config.identity_path()?)?;

    // Fails on a shard count that differs from the one persisted in the data dir.
    let store = Arc::new(
        ContentStore::open(&data_dir, config.router()?, config.store_limits())
            .await
            .context("Failed to open content store")?,
    );

    let policy_db = Database::open(&data_dir)?;
    let policy = Arc::new(PolicyFilter::load(Box::new(SqlitePolicyStore::new(policy_db)))?);

    // -----------------------------------------------------------------------
    // 4. Spawn the libp2p swarm (runs in background tokio task)
    // -----------------------------------------------------------------------
    let swarm_config = SwarmConfig {
        bootstrap_peers_path: config.node.bootstrap_peers_file.clone(),
        bootstrap_peers: parse_multiaddrs(&config.node.bootstrap_peers),
        listen_port: config.node.listen_port,
        extra_dials: parse_multiaddrs(&config.node.extra_dials),
        enable_mdns: config.node.enable_mdns,
        request_timeout: config.request_timeout(),
    };
    let (cmd_tx, notif_rx, local_peer_id) = spawn_swarm(keypair, swarm_config).await?;
    info!(peer_id = %local_peer_id, "Swarm started");

    // -----------------------------------------------------------------------
    // 5. Wire the node and start its background jobs
    // -----------------------------------------------------------------------
    let node = Arc::new(StorageNode::new(
        local_peer_id,
        store,
        Arc::new(PeerDirectory::new()),
        policy,
        Arc::new(SwarmTransport::new(cmd_tx.clone())),
        config.node_options(),
        event_channel(),
    ));

    spawn_notification_loop(node.clone(), cmd_tx.clone(), notif_rx);
    let jobs = spawn_background_tasks(node.clone(), cmd_tx.clone(), Schedule::from_config(&config));

    // -----------------------------------------------------------------------
    // 6. Run the HTTP status bridge (blocks until shutdown)
    // -----------------------------------------------------------------------
    let app_state = AppState::new(node, config.node.admin_token.clone());
    let result = tokio::select! {
        result = api::serve(app_state, config.node.http_addr) => {
            if let Err(ref e) = result {
                error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    for job in jobs {
        job.abort();
    }
    let _ = cmd_tx.send(SwarmCommand::Shutdown).await;

    result
}
