//! Share mode and cache policy selectors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How callers may share a model instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    /// One holder per instance
    Exclusive,
    /// Many holders share one instance
    #[default]
    Shared,
    /// Instances form a pool that callers are spread across
    Pooled,
    /// Shared only while the cache is under load
    Dynamic,
}

impl ShareMode {
    /// Whether another caller may attach to an instance created in this mode
    /// when the cache is not under load.
    pub fn is_shareable(&self) -> bool {
        matches!(self, ShareMode::Shared | ShareMode::Pooled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShareMode::Exclusive => "exclusive",
            ShareMode::Shared => "shared",
            ShareMode::Pooled => "pooled",
            ShareMode::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for ShareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(ShareMode::Exclusive),
            "shared" => Ok(ShareMode::Shared),
            "pooled" => Ok(ShareMode::Pooled),
            "dynamic" => Ok(ShareMode::Dynamic),
            other => Err(format!("unknown share mode: {}", other)),
        }
    }
}

/// Cache eviction policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
    /// Hard expiry after a time-to-live
    Ttl,
    /// Weighted score of idleness, usage and footprint
    Adaptive,
}

impl CachePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::Lru => "lru",
            CachePolicy::Lfu => "lfu",
            CachePolicy::Fifo => "fifo",
            CachePolicy::Ttl => "ttl",
            CachePolicy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(CachePolicy::Lru),
            "lfu" => Ok(CachePolicy::Lfu),
            "fifo" => Ok(CachePolicy::Fifo),
            "ttl" => Ok(CachePolicy::Ttl),
            "adaptive" => Ok(CachePolicy::Adaptive),
            other => Err(format!("unknown cache policy: {}", other)),
        }
    }
}
