use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{AnalyticsEvent, AnalyticsHandle, EventKind};
use crate::bandwidth::NetworkClass;
use crate::quality::{QualityLevel, VideoSource};

/// Immutable record of a finished playback session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub video_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub watch_time_secs: f64,
    pub buffering_time_secs: f64,
    /// Buffering time over watch plus buffering time.
    pub rebuffer_ratio: f64,
    pub quality_changes: u32,
    pub seeks: u32,
    pub buffering_events: u32,
    pub average_buffer_health: Option<f64>,
    pub peak_quality: QualityLevel,
    pub final_quality: QualityLevel,
}

/// Metrics for one playback of one video.
///
/// Every state change is mirrored to analytics when a handle is attached.
/// [`PlaybackSession::finalize`] consumes the session, so a summary can never
/// be amended afterwards.
pub struct PlaybackSession {
    id: String,
    video_id: String,
    source: VideoSource,
    duration: Option<f64>,
    started_at: DateTime<Utc>,
    watch_time: Duration,
    playing_since: Option<Instant>,
    buffering_time: Duration,
    buffering_since: Option<Instant>,
    quality_changes: u32,
    seeks: u32,
    buffering_events: u32,
    health_total: f64,
    health_samples: u64,
    peak: QualityLevel,
    analytics: Option<AnalyticsHandle>,
}

impl PlaybackSession {
    pub fn new(video_id: impl Into<String>, source: VideoSource, analytics: Option<AnalyticsHandle>) -> Self {
        let video_id = video_id.into();
        let started_at = Utc::now();
        let session = Self {
            id: session_id(&video_id, started_at),
            video_id,
            peak: source.quality,
            source,
            duration: None,
            started_at,
            watch_time: Duration::ZERO,
            playing_since: None,
            buffering_time: Duration::ZERO,
            buffering_since: None,
            quality_changes: 0,
            seeks: 0,
            buffering_events: 0,
            health_total: 0.0,
            health_samples: 0,
            analytics,
        };
        session.emit(EventKind::Load, 0.0, |_| {});
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn quality(&self) -> QualityLevel {
        self.source.quality
    }

    pub fn is_playing(&self) -> bool {
        self.playing_since.is_some()
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering_since.is_some()
    }

    pub fn set_duration(&mut self, duration: Option<f64>) {
        self.duration = duration.filter(|d| d.is_finite() && *d > 0.0);
    }

    pub fn play(&mut self, position: f64) {
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
            self.emit(EventKind::Play, position, |_| {});
        }
    }

    pub fn pause(&mut self, position: f64) {
        if self.stop_clock() {
            self.emit(EventKind::Pause, position, |_| {});
        }
    }

    pub fn seek(&mut self, from: f64, to: f64) {
        self.seeks += 1;
        self.emit(EventKind::Seek, to, |e| e.message = Some(format!("from {:.1}", from)));
    }

    pub fn buffer_start(&mut self, position: f64) {
        if self.buffering_since.is_none() {
            self.buffering_since = Some(Instant::now());
            self.buffering_events += 1;
            self.emit(EventKind::BufferStart, position, |_| {});
        }
    }

    pub fn buffer_end(&mut self, position: f64) {
        if let Some(since) = self.buffering_since.take() {
            self.buffering_time += since.elapsed();
            self.emit(EventKind::BufferEnd, position, |_| {});
        }
    }

    /// Fold in a buffer-health reading and report progress.
    pub fn progress(&mut self, position: f64, health: f64, network: NetworkClass) {
        if health.is_finite() {
            self.health_total += health;
            self.health_samples += 1;
        }
        self.emit(EventKind::Progress, position, |e| {
            e.buffer_health = Some(health);
            e.network = Some(network);
        });
    }

    pub fn quality_change(&mut self, source: VideoSource, position: f64, health: f64, network: NetworkClass) {
        self.quality_changes += 1;
        self.peak = self.peak.max(source.quality);
        self.source = source;
        self.emit(EventKind::QualityChange, position, |e| {
            e.buffer_health = Some(health);
            e.network = Some(network);
        });
    }

    pub fn error(&mut self, position: f64, message: impl Into<String>) {
        let message = message.into();
        self.emit(EventKind::Error, position, |e| e.message = Some(message));
    }

    pub fn ended(&mut self, position: f64) {
        self.stop_clock();
        self.emit(EventKind::Ended, position, |_| {});
    }

    /// Stamp the end time and compute derived metrics.
    pub fn finalize(mut self) -> SessionSummary {
        self.stop_clock();
        if let Some(since) = self.buffering_since.take() {
            self.buffering_time += since.elapsed();
        }

        let watch = self.watch_time.as_secs_f64();
        let buffering = self.buffering_time.as_secs_f64();
        let rebuffer_ratio = if watch + buffering > 0.0 {
            buffering / (watch + buffering)
        } else {
            0.0
        };

        SessionSummary {
            session_id: self.id,
            video_id: self.video_id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            watch_time_secs: watch,
            buffering_time_secs: buffering,
            rebuffer_ratio,
            quality_changes: self.quality_changes,
            seeks: self.seeks,
            buffering_events: self.buffering_events,
            average_buffer_health: (self.health_samples > 0).then(|| self.health_total / self.health_samples as f64),
            peak_quality: self.peak,
            final_quality: self.source.quality,
        }
    }

    fn stop_clock(&mut self) -> bool {
        match self.playing_since.take() {
            Some(since) => {
                self.watch_time += since.elapsed();
                true
            }
            None => false,
        }
    }

    fn emit(&self, kind: EventKind, position: f64, fill: impl FnOnce(&mut AnalyticsEvent)) {
        let Some(analytics) = &self.analytics else {
            return;
        };
        let mut event = AnalyticsEvent {
            kind,
            session_id: self.id.clone(),
            video_id: self.video_id.clone(),
            source_url: self.source.url.to_string(),
            timestamp: Utc::now(),
            position,
            duration: self.duration,
            quality: Some(self.source.quality),
            bitrate: Some(self.source.bitrate_kbps),
            buffer_health: None,
            network: None,
            message: None,
        };
        fill(&mut event);
        analytics.record(event);
    }
}

fn session_id(video_id: &str, started_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(video_id.as_bytes());
    hasher.update(started_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hex::encode(&hasher.finalize()[..8])
}
