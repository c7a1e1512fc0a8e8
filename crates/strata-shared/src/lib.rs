//! Types shared by every Strata crate: content identifiers, shard routing,
//! the peer wire protocol and network-wide constants.

pub mod cid;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod shard;
pub mod types;

pub use cid::{storage_proof, Cid};
pub use error::SharedError;
pub use shard::ShardRouter;
pub use types::{ConnectionState, ContentType, GuildId, ShardRange};
