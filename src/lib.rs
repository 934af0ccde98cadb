//! Client-side media delivery: a partitioned content cache, a request router
//! with offline fallbacks, byte-range answers from cached video, adaptive
//! quality selection and bandwidth-aware preloading, served through a local
//! HTTP proxy.

pub mod analytics;
pub mod bandwidth;
pub mod cache;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod preload;
pub mod proxy;
pub mod quality;
pub mod range;
pub mod router;

pub use engine::Engine;
pub use error::{ConfigError, DeliveryError, NetworkError, PlayerError, RangeError, StorageError};
