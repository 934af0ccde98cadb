//! Construction and teardown of the running delivery engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analytics::{AnalyticsHandle, EventSink, HttpSink, LogSink};
use crate::bandwidth::BandwidthEstimator;
use crate::cache::{CacheHandle, CacheStore, DiskCache, EntryStore, EvictionPolicy, MemoryStore};
use crate::config::EngineConfig;
use crate::control::ControlDispatcher;
use crate::error::{PlayerError, StorageError};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::preload::PreloadScheduler;
use crate::quality::{DriverConfig, PlaybackDriver, PlayerHandle, VideoSource, Viewport};
use crate::router::DeliveryRouter;

/// Every long-lived component, constructed once and injected where needed.
pub struct Engine {
    pub cache: CacheHandle,
    pub bandwidth: Arc<BandwidthEstimator>,
    pub fetcher: Arc<dyn Fetcher>,
    pub router: DeliveryRouter,
    pub preload: PreloadScheduler,
    pub analytics: AnalyticsHandle,
    pub control: ControlDispatcher,
    driver_config: DriverConfig,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Engine {
    /// Build the engine with the storage backend and fetcher the config names.
    pub async fn start(config: &EngineConfig) -> Result<Self, StorageError> {
        let backend: Arc<dyn EntryStore> = match &config.cache.dir {
            Some(dir) => Arc::new(DiskCache::new(dir).await?),
            None => Arc::new(MemoryStore::new()),
        };
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
            config.network.request_timeout(),
            config.network.max_retries,
            config.network.retry_delay(),
        ));
        let sink: Arc<dyn EventSink> = match &config.analytics.endpoint {
            Some(endpoint) => Arc::new(HttpSink::new(endpoint.clone(), fetcher.clone())),
            None => Arc::new(LogSink),
        };
        Self::start_with(config, backend, fetcher, sink).await
    }

    /// Build the engine around explicit dependencies.
    pub async fn start_with(
        config: &EngineConfig,
        backend: Arc<dyn EntryStore>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, StorageError> {
        let store = CacheStore::open(backend, config.cache.partition_specs(), config.cache.memory_tier_bytes)
            .await?
            .with_eviction_policy(EvictionPolicy::new(config.cache.eviction_watermark_percent));
        let (cache, cache_task) = CacheHandle::spawn(store, config.cache.sweep_interval());

        let bandwidth = Arc::new(BandwidthEstimator::new());
        bandwidth.set_hint(config.network.connection_hint);

        let (preload, preload_task) =
            PreloadScheduler::start(config.preload.scheduler(), cache.clone(), fetcher.clone(), bandwidth.clone());
        let (analytics, analytics_task) =
            AnalyticsHandle::spawn(sink, config.analytics.batch_size, config.analytics.flush_interval());
        let router = DeliveryRouter::new(cache.clone(), fetcher.clone(), bandwidth.clone(), config.network.router());
        let control = ControlDispatcher::new(cache.clone(), preload.clone());

        info!(
            storage = if config.cache.dir.is_some() { "disk" } else { "memory" },
            version = config.cache.version,
            "delivery engine started"
        );

        Ok(Self {
            cache,
            bandwidth,
            fetcher,
            router,
            preload,
            analytics,
            control,
            driver_config: config.quality.driver(),
            tasks: vec![
                ("cache", cache_task),
                ("preload", preload_task),
                ("analytics", analytics_task),
            ],
        })
    }

    /// A playback driver for one video, wired to the engine's estimator,
    /// preloader and analytics, with the configured evaluation timing.
    pub fn driver(
        &self,
        video_id: impl Into<String>,
        player: Arc<dyn PlayerHandle>,
        sources: Vec<VideoSource>,
        viewport: Viewport,
    ) -> Result<PlaybackDriver, PlayerError> {
        let driver = PlaybackDriver::new(
            video_id,
            player,
            sources,
            viewport,
            self.bandwidth.clone(),
            self.driver_config.clone(),
            Some(self.analytics.clone()),
        )?;
        Ok(driver.with_preload(self.preload.clone()))
    }

    /// Stop preloads, flush analytics and cache state, then wait for every task.
    pub async fn shutdown(self) {
        self.preload.shutdown();
        self.analytics.shutdown().await;
        if let Err(e) = self.cache.shutdown().await {
            warn!(error = %e, "cache shutdown flush failed");
        }

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "task ended abnormally");
            }
        }
        info!("delivery engine stopped");
    }
}
