use thiserror::Error;

/// Failures of outbound requests and local network plumbing.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer did not answer within the request deadline.
    #[error("Request timed out")]
    Timeout,

    /// Dial failure, dropped connection, unsupported protocol, stream I/O.
    #[error("Outbound request failed: {0}")]
    Outbound(String),

    #[error("Swarm command channel closed")]
    ChannelClosed,

    #[error("Identity key error: {0}")]
    Identity(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
