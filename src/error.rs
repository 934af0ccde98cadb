//! Error types for the delivery engine.
//!
//! Each concern gets its own enum so callers can tell a degraded-but-valid
//! outcome (storage, network) apart from an explicit client error (range).

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Failures of the storage layer underneath the cache.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The cache actor is gone (shutdown or panicked).
    #[error("Cache actor unavailable")]
    Unavailable,
}

/// Failures while talking to the origin.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upstream returned status {0}")]
    Status(StatusCode),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Byte-range requests that cannot be satisfied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Malformed range header: {0}")]
    Malformed(String),

    #[error("Range {start}-{end} not satisfiable for length {length}")]
    NotSatisfiable { start: u64, end: u64, length: u64 },
}

impl RangeError {
    /// Total length to report in `Content-Range: bytes */<len>`, if known.
    pub fn length(&self) -> Option<u64> {
        match self {
            RangeError::NotSatisfiable { length, .. } => Some(*length),
            RangeError::Malformed(_) => None,
        }
    }
}

/// Hard failures of the delivery router, surfaced only when no fallback exists.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Range(#[from] RangeError),

    #[error("Video unavailable offline: {url}")]
    VideoUnavailable { url: String, source: NetworkError },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

/// Failures reported by a player when swapping sources.
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Source failed to load: {0}")]
    LoadFailed(String),

    #[error("Source switch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Player detached")]
    Detached,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
