//! # strata-store
//!
//! Local content-addressed storage for a Strata node.
//!
//! Payload bytes live as plain files under `<data_dir>/blobs`, named by the
//! hex CID. Everything else (per-blob metadata, replica sets, the node's
//! persisted shard count and the content policy) lives in a SQLite side-table
//! wrapped by [`Database`]. [`ContentStore`] ties the two together and is
//! the only type the rest of the node talks to for blob I/O.

pub mod blobs;
pub mod content;
pub mod database;
pub mod guard;
pub mod meta;
pub mod migrations;
pub mod models;
pub mod policy;

mod error;
mod locks;

pub use content::{ContentStore, StoreLimits};
pub use database::Database;
pub use error::{ProtectReason, Result, StoreError};
pub use guard::{ReplicaCheck, ReplicaGuard};
pub use models::*;
