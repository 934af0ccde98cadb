mod actor;
mod disk_cache;
mod eviction;
mod memory_cache;
mod storage;
mod store;

pub use actor::*;
pub use disk_cache::*;
pub use eviction::*;
pub use memory_cache::*;
pub use storage::*;
pub use store::*;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MEMORY_TIER_SIZE: usize = 64 * 1024 * 1024; // 64MB
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// The three cache namespaces the engine maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Static,
    Api,
    Video,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 3] = [PartitionKind::Static, PartitionKind::Api, PartitionKind::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKind::Static => "static",
            PartitionKind::Api => "api",
            PartitionKind::Video => "video",
        }
    }
}

/// A partition's persisted identity. A version bump supersedes the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub name: String,
    pub version: u32,
}

impl PartitionId {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse the `<name>-v<version>` form used for on-disk directories.
    pub fn parse(s: &str) -> Option<Self> {
        let (name, version) = s.rsplit_once("-v")?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, version.parse().ok()?))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.name, self.version)
    }
}

/// Byte budget and time-to-live for one partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy {
    pub budget_bytes: u64,
    pub ttl: Duration,
}

impl PartitionPolicy {
    pub fn new(budget_bytes: u64, ttl: Duration) -> Self {
        Self { budget_bytes, ttl }
    }

    /// Content at or above half the budget is never cached.
    pub fn admits(&self, size: u64) -> bool {
        size.saturating_mul(2) < self.budget_bytes
    }

    pub fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - cached_at).to_std() {
            Ok(age) => age > self.ttl,
            // cached_at in the future (clock skew): treat as fresh
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub kind: PartitionKind,
    pub id: PartitionId,
    pub policy: PartitionPolicy,
}

/// Metadata half of a cache entry; listable without touching content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

/// Metadata and content travel together so the two halves cannot diverge.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: CacheMeta,
    pub content: Bytes,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, content: Bytes, content_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            meta: CacheMeta {
                key: key.into(),
                size: content.len() as u64,
                content_type: content_type.into(),
                cached_at: now,
                last_accessed_at: now,
                access_count: 0,
            },
            content,
        }
    }
}

/// Content returned by a cache read.
#[derive(Debug, Clone)]
pub struct CachedContent {
    pub content: Bytes,
    pub meta: CacheMeta,
}

/// Result of a lookup that does not evict expired entries.
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(CachedContent),
    Stale(CachedContent),
    Miss,
}

impl Lookup {
    pub fn into_content(self) -> Option<CachedContent> {
        match self {
            Lookup::Fresh(c) | Lookup::Stale(c) => Some(c),
            Lookup::Miss => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Content at or above half the partition budget.
    TooLarge,
    /// Storage rejected the write; the content was not cached.
    Failed,
}

/// Shape of the `GET_CACHE_STATUS` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub video_count: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub usage_percentage: f64,
}
