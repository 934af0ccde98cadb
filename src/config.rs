use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::analytics::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL};
use crate::bandwidth::ConnectionHint;
use crate::cache::{PartitionId, PartitionKind, PartitionPolicy, PartitionSpec, DEFAULT_MEMORY_TIER_SIZE};
use crate::error::ConfigError;
use crate::preload::{PreloadConfig as SchedulerConfig, DEFAULT_FINISHED_HISTORY, DEFAULT_MAX_CONCURRENCY};
use crate::quality::DriverConfig;
use crate::router::RouterConfig;

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;
const MAX_RETRIES: u32 = 10;

/// Full engine configuration. Every field has a default, so an empty file
/// (or no file at all) is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub preload: PreloadConfig,
    pub quality: QualityConfig,
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_connections: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PartitionConfig {
    pub budget_bytes: u64,
    pub ttl_secs: u64,
}

impl PartitionConfig {
    pub fn policy(&self) -> PartitionPolicy {
        PartitionPolicy::new(self.budget_bytes, Duration::from_secs(self.ttl_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// On-disk storage directory; in-memory storage when unset.
    pub dir: Option<PathBuf>,
    /// Bumping this supersedes (deletes) every partition of older versions.
    pub version: u32,
    pub memory_tier_bytes: usize,
    pub sweep_interval_secs: u64,
    pub eviction_watermark_percent: u64,
    #[serde(rename = "static")]
    pub static_assets: PartitionConfig,
    pub api: PartitionConfig,
    pub video: PartitionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            version: 1,
            memory_tier_bytes: DEFAULT_MEMORY_TIER_SIZE,
            sweep_interval_secs: 300,
            eviction_watermark_percent: crate::cache::DEFAULT_WATERMARK_PERCENT,
            static_assets: PartitionConfig {
                budget_bytes: 50 * MB,
                ttl_secs: DAY_SECS,
            },
            api: PartitionConfig {
                budget_bytes: 10 * MB,
                ttl_secs: 30 * 60,
            },
            video: PartitionConfig {
                budget_bytes: 500 * MB,
                ttl_secs: 7 * DAY_SECS,
            },
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn partition_specs(&self) -> Vec<PartitionSpec> {
        PartitionKind::ALL
            .iter()
            .map(|kind| {
                let partition = match kind {
                    PartitionKind::Static => &self.static_assets,
                    PartitionKind::Api => &self.api,
                    PartitionKind::Video => &self.video,
                };
                PartitionSpec {
                    kind: *kind,
                    id: PartitionId::new(kind.as_str(), self.version),
                    policy: partition.policy(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    pub range_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub video_revalidate_after_secs: u64,
    /// Connection type reported by the platform, used until the first
    /// transfer yields a measured estimate.
    pub connection_hint: Option<ConnectionHint>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            range_timeout_secs: 15,
            max_retries: 3,
            retry_delay_ms: 500,
            video_revalidate_after_secs: DAY_SECS,
            connection_hint: None,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            request_timeout: self.request_timeout(),
            range_timeout: Duration::from_secs(self.range_timeout_secs),
            revalidate_after: Duration::from_secs(self.video_revalidate_after_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    /// Finished jobs kept queryable.
    pub history: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout_secs: 60,
            history: DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl PreloadConfig {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.max_concurrency,
            timeout: Duration::from_secs(self.timeout_secs),
            history: self.history,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub evaluation_interval_ms: u64,
    pub switch_timeout_secs: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 2000,
            switch_timeout_secs: 10,
        }
    }
}

impl QualityConfig {
    pub fn driver(&self) -> DriverConfig {
        DriverConfig {
            evaluation_interval: Duration::from_millis(self.evaluation_interval_ms),
            switch_timeout: Duration::from_secs(self.switch_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    /// Collection endpoint; events are logged when unset.
    pub endpoint: Option<Url>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            endpoint: None,
        }
    }
}

impl AnalyticsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl EngineConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be positive".to_string()));
        }
        if self.preload.max_concurrency == 0 {
            return Err(ConfigError::Invalid("preload.max_concurrency must be positive".to_string()));
        }
        if self.analytics.batch_size == 0 {
            return Err(ConfigError::Invalid("analytics.batch_size must be positive".to_string()));
        }
        if self.quality.evaluation_interval_ms == 0 || self.cache.sweep_interval_secs == 0 || self.analytics.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }
        if self.network.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!("network.max_retries must be at most {}", MAX_RETRIES)));
        }
        if !(1..=100).contains(&self.cache.eviction_watermark_percent) {
            return Err(ConfigError::Invalid(
                "cache.eviction_watermark_percent must be within 1..=100".to_string(),
            ));
        }
        for spec in self.cache.partition_specs() {
            if spec.policy.budget_bytes == 0 {
                return Err(ConfigError::Invalid(format!("cache.{}.budget_bytes must be positive", spec.kind.as_str())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.api.ttl_secs, 1800);
        assert_eq!(config.cache.video.ttl_secs, 7 * DAY_SECS);
        assert_eq!(config.preload.max_concurrency, 3);

        let specs = config.cache.partition_specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[2].id.to_string(), "video-v1");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
server:
  listen: "0.0.0.0:8080"
cache:
  version: 4
  video:
    budget_bytes: 1048576
    ttl_secs: 60
network:
  connection_hint: 3g
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.cache.video.budget_bytes, MB);
        assert_eq!(config.cache.static_assets.budget_bytes, 50 * MB);
        assert_eq!(config.cache.partition_specs()[0].id.to_string(), "static-v4");
        assert_eq!(config.network.connection_hint, Some(ConnectionHint::ThreeG));
        assert_eq!(config.network.router().range_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "preload:\n  max_concurrency: 5").unwrap();
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.preload.max_concurrency, 5);
    }

    #[test]
    fn test_load_errors() {
        let missing = EngineConfig::load(Some(Path::new("/nonexistent/media.yaml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server: [not, a, map]").unwrap();
        assert!(matches!(EngineConfig::load(Some(file.path())), Err(ConfigError::Parse { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "preload:\n  max_concurrency: 0").unwrap();
        assert!(matches!(EngineConfig::load(Some(file.path())), Err(ConfigError::Invalid(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network:\n  max_retries: 40").unwrap();
        assert!(matches!(EngineConfig::load(Some(file.path())), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(EngineConfig::from_yaml("  \n").unwrap().cache.version, 1);
    }
}
