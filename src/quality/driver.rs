use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{buffer_health, source_for, QualityController, QualityLevel, QualitySwitch, VideoSource, Viewport};
use crate::analytics::{AnalyticsHandle, PlaybackSession, SessionSummary};
use crate::bandwidth::{BandwidthEstimator, NetworkClass};
use crate::error::PlayerError;
use crate::preload::{Priority, PreloadScheduler};

pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SWITCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A position jump beyond one evaluation interval plus this is a seek.
const SEEK_TOLERANCE_SECS: f64 = 2.0;

/// What the driver reads from the player on each evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnapshot {
    pub position: f64,
    pub duration: Option<f64>,
    /// Seconds buffered ahead of `position`.
    pub buffered_ahead: f64,
    pub paused: bool,
    pub ended: bool,
}

/// The media element being driven.
#[async_trait]
pub trait PlayerHandle: Send + Sync {
    async fn snapshot(&self) -> Result<PlayerSnapshot, PlayerError>;

    /// Swap to `source`, seek to `position` and resume playback if `resume`.
    async fn load_source(&self, source: &VideoSource, position: f64, resume: bool) -> Result<(), PlayerError>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub evaluation_interval: Duration,
    pub switch_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            switch_timeout: DEFAULT_SWITCH_TIMEOUT,
        }
    }
}

/// Periodically evaluates one player and switches its source when the
/// controller asks for a different rung.
pub struct PlaybackDriver {
    video_id: String,
    player: Arc<dyn PlayerHandle>,
    sources: Vec<VideoSource>,
    current: VideoSource,
    controller: QualityController,
    bandwidth: Arc<BandwidthEstimator>,
    session: PlaybackSession,
    preload: Option<PreloadScheduler>,
    config: DriverConfig,
    last_position: Option<f64>,
    ended: bool,
    stop: CancellationToken,
}

impl PlaybackDriver {
    pub fn new(
        video_id: impl Into<String>,
        player: Arc<dyn PlayerHandle>,
        mut sources: Vec<VideoSource>,
        viewport: Viewport,
        bandwidth: Arc<BandwidthEstimator>,
        config: DriverConfig,
        analytics: Option<AnalyticsHandle>,
    ) -> Result<Self, PlayerError> {
        let video_id = video_id.into();
        sources.sort_by_key(|s| s.quality);

        let network = QualityLevel::for_network(bandwidth.classify());
        let controller = QualityController::new(viewport, network);
        let current = source_for(&sources, controller.active())
            .cloned()
            .ok_or_else(|| PlayerError::LoadFailed(format!("{} has no sources", video_id)))?;
        let session = PlaybackSession::new(video_id.clone(), current.clone(), analytics);

        Ok(Self {
            video_id,
            player,
            sources,
            current,
            controller,
            bandwidth,
            session,
            preload: None,
            config,
            last_position: None,
            ended: false,
            stop: CancellationToken::new(),
        })
    }

    pub fn with_preload(mut self, preload: PreloadScheduler) -> Self {
        self.preload = Some(preload);
        self
    }

    pub fn active_quality(&self) -> QualityLevel {
        self.controller.active()
    }

    pub fn current_source(&self) -> &VideoSource {
        &self.current
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    /// Cancelling this token stops [`PlaybackDriver::run`] and aborts an
    /// in-flight switch.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Hand the initial source to the player, paused at the start.
    pub async fn load(&mut self) -> Result<(), PlayerError> {
        let source = self.current.clone();
        self.switch_source(&source, 0.0, false).await?;
        info!(video_id = %self.video_id, quality = %source.quality, "initial source loaded");
        self.preload_neighbours();
        Ok(())
    }

    /// One evaluation. Returns the switch that was applied, if any.
    pub async fn tick(&mut self) -> Option<QualitySwitch> {
        let snapshot = match self.player.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(video_id = %self.video_id, error = %e, "player snapshot unavailable");
                return None;
            }
        };
        self.session.set_duration(snapshot.duration);
        self.track_transport(&snapshot);

        if snapshot.paused || snapshot.ended {
            return None;
        }

        let health = buffer_health(snapshot.buffered_ahead);
        let class = self.bandwidth.classify();
        let network = QualityLevel::for_network(class);
        self.session.progress(snapshot.position, health, class);

        let switch = self.controller.evaluate(health, network)?;
        self.apply(switch, &snapshot, health, class).await
    }

    /// Evaluate on every interval tick until stopped, then finalize the session.
    pub async fn run(mut self) -> SessionSummary {
        let stop = self.stop.clone();
        let mut ticker = interval(self.config.evaluation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        let summary = self.session.finalize();
        info!(
            video_id = %summary.video_id,
            watch_time = summary.watch_time_secs,
            quality_changes = summary.quality_changes,
            rebuffer_ratio = summary.rebuffer_ratio,
            "playback session finished"
        );
        summary
    }

    fn track_transport(&mut self, snapshot: &PlayerSnapshot) {
        let position = snapshot.position;
        if let Some(last) = self.last_position {
            let drift = self.config.evaluation_interval.as_secs_f64() + SEEK_TOLERANCE_SECS;
            if (position - last).abs() > drift {
                self.session.seek(last, position);
            }
        }
        self.last_position = Some(position);

        if snapshot.ended {
            if !self.ended {
                self.session.buffer_end(position);
                self.session.ended(position);
                self.ended = true;
            }
            return;
        }
        self.ended = false;

        if snapshot.paused {
            self.session.pause(position);
            return;
        }
        self.session.play(position);
        if snapshot.buffered_ahead <= 0.0 {
            self.session.buffer_start(position);
        } else {
            self.session.buffer_end(position);
        }
    }

    async fn apply(
        &mut self,
        switch: QualitySwitch,
        snapshot: &PlayerSnapshot,
        health: f64,
        class: NetworkClass,
    ) -> Option<QualitySwitch> {
        let source = match source_for(&self.sources, switch.to) {
            Some(source) if source.url != self.current.url => source.clone(),
            // no distinct variant for that rung
            _ => {
                self.controller.revert(&switch);
                return None;
            }
        };

        if let Err(e) = self.switch_source(&source, snapshot.position, !snapshot.paused).await {
            warn!(
                video_id = %self.video_id,
                from = %switch.from,
                to = %switch.to,
                error = %e,
                "quality switch failed; staying on current source"
            );
            self.controller.revert(&switch);
            self.session.error(snapshot.position, e.to_string());
            return None;
        }

        info!(
            video_id = %self.video_id,
            from = %switch.from,
            to = %switch.to,
            reason = ?switch.reason,
            health,
            "quality switched"
        );
        self.current = source.clone();
        self.session.quality_change(source, snapshot.position, health, class);
        self.preload_neighbours();
        Some(switch)
    }

    async fn switch_source(&self, source: &VideoSource, position: f64, resume: bool) -> Result<(), PlayerError> {
        let limit = self.config.switch_timeout;
        tokio::select! {
            _ = self.stop.cancelled() => Err(PlayerError::Detached),
            result = timeout(limit, self.player.load_source(source, position, resume)) => {
                result.unwrap_or(Err(PlayerError::Timeout(limit)))
            }
        }
    }

    /// Warm the cache with the rungs either side of the active one.
    fn preload_neighbours(&self) {
        let Some(preload) = &self.preload else {
            return;
        };
        let active = self.controller.active();
        for level in [active.step_down(), active.step_up()].into_iter().flatten() {
            if level > self.controller.ceiling() {
                continue;
            }
            if let Some(source) = self.sources.iter().find(|s| s.quality == level) {
                preload.enqueue(format!("{}@{}", self.video_id, level), vec![source.clone()], Priority::Low);
            }
        }
    }
}
