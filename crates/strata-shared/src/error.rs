use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Invalid shard count {0}")]
    InvalidShardCount(u32),

    #[error("Invalid shard range {start}..={end} for shard count {shard_count}")]
    InvalidShardRange { start: u32, end: u32, shard_count: u32 },

    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Unknown content type: {0}")]
    UnknownContentType(String),
}
