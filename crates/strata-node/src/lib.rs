//! # strata-node
//!
//! Storage node for the Strata network: content policy, replication,
//! garbage collection, the swarm bridge and the HTTP status bridge, wired
//! together by [`StorageNode`].

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod gc;
pub mod node;
pub mod policy;
pub mod replication;

#[cfg(test)]
pub(crate) mod testing;

pub use config::NodeConfig;
pub use error::{ApiError, ConfigError, NodeError};
pub use events::NodeEvent;
pub use gc::{GarbageCollector, GcReport, GcSettings, RetentionMode};
pub use node::{NodeOptions, NodeStatus, StorageNode};
pub use policy::{PolicyFilter, PolicyStore, SqlitePolicyStore};
pub use replication::{GoalState, ReplicaTransport, ReplicationManager, ReplicationSettings};
