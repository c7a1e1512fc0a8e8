use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SharedError;

/// Application tag attached to every blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Message,
    Post,
    Media,
    Listing,
}

impl ContentType {
    pub const ALL: [ContentType; 4] = [Self::Message, Self::Post, Self::Media, Self::Listing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Post => "post",
            Self::Media => "media",
            Self::Listing => "listing",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "post" => Ok(Self::Post),
            "media" => Ok(Self::Media),
            "listing" => Ok(Self::Listing),
            other => Err(SharedError::UnknownContentType(other.to_string())),
        }
    }
}

/// Guild (community) tag used to scope content acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuildId(pub String);

impl GuildId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive range of shard numbers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShardRange {
    pub start: u32,
    pub end: u32,
}

impl ShardRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The whole shard space.
    pub fn full(shard_count: u32) -> Self {
        Self {
            start: 0,
            end: shard_count.saturating_sub(1),
        }
    }

    pub fn contains(&self, shard: u32) -> bool {
        shard >= self.start && shard <= self.end
    }

    pub fn is_valid_for(&self, shard_count: u32) -> bool {
        self.start <= self.end && self.end < shard_count
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_parse() {
        for ct in ContentType::ALL {
            assert_eq!(ct.as_str().parse::<ContentType>().unwrap(), ct);
        }
        assert!("video".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_shard_range_bounds() {
        let range = ShardRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(range.is_valid_for(21));
        assert!(!range.is_valid_for(20));
        assert!(!ShardRange::new(5, 4).is_valid_for(1024));
    }
}
