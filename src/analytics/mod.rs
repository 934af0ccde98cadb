//! Playback analytics: event taxonomy, batching and delivery sinks.

mod session;

pub use session::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use http::{Method, Request};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::bandwidth::NetworkClass;
use crate::error::NetworkError;
use crate::fetch::Fetcher;
use crate::quality::QualityLevel;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Play,
    Pause,
    Seek,
    Ended,
    Error,
    QualityChange,
    BufferStart,
    BufferEnd,
    Load,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: String,
    pub video_id: String,
    pub source_url: String,
    pub timestamp: DateTime<Utc>,
    pub position: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_health: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Destination for flushed batches.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, batch: &[AnalyticsEvent]) -> Result<(), NetworkError>;
}

/// Writes every event to the log. Used when no endpoint is configured.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn send(&self, batch: &[AnalyticsEvent]) -> Result<(), NetworkError> {
        for event in batch {
            info!(
                target: "media_delivery::analytics",
                kind = ?event.kind,
                video_id = %event.video_id,
                position = event.position,
                quality = ?event.quality,
                "playback event"
            );
        }
        Ok(())
    }
}

/// POSTs each batch as a JSON array to a collection endpoint.
pub struct HttpSink {
    endpoint: Url,
    fetcher: Arc<dyn Fetcher>,
}

impl HttpSink {
    pub fn new(endpoint: Url, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { endpoint, fetcher }
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn send(&self, batch: &[AnalyticsEvent]) -> Result<(), NetworkError> {
        let body = serde_json::to_vec(batch).map_err(|e| NetworkError::Connection(e.to_string()))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))
            .map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;

        let response = self.fetcher.send(request, None).await?;
        if !response.status().is_success() {
            return Err(NetworkError::Status(response.status()));
        }
        Ok(())
    }
}

enum Message {
    Event(AnalyticsEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to the batching task.
#[derive(Clone)]
pub struct AnalyticsHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl AnalyticsHandle {
    /// Spawn the batcher. A batch is sent once `batch_size` events are
    /// buffered or `flush_interval` has passed, whichever comes first.
    pub fn spawn(sink: Arc<dyn EventSink>, batch_size: usize, flush_interval: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batcher(rx, sink, batch_size.max(1), flush_interval));
        (Self { tx }, task)
    }

    /// Best effort: events recorded after shutdown are dropped.
    pub fn record(&self, event: AnalyticsEvent) {
        if self.tx.send(Message::Event(event)).is_err() {
            debug!("analytics batcher gone; event dropped");
        }
    }

    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Message::Flush(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush what is buffered and stop the batcher.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Message::Shutdown(reply)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn run_batcher(
    mut rx: mpsc::UnboundedReceiver<Message>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<AnalyticsEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Event(event)) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        deliver(sink.as_ref(), &mut buffer).await;
                        ticker.reset();
                    }
                }
                Some(Message::Flush(reply)) => {
                    deliver(sink.as_ref(), &mut buffer).await;
                    let _ = reply.send(());
                }
                Some(Message::Shutdown(reply)) => {
                    deliver(sink.as_ref(), &mut buffer).await;
                    let _ = reply.send(());
                    break;
                }
                None => {
                    deliver(sink.as_ref(), &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => deliver(sink.as_ref(), &mut buffer).await,
        }
    }
    debug!("analytics batcher stopped");
}

async fn deliver(sink: &dyn EventSink, buffer: &mut Vec<AnalyticsEvent>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    match sink.send(&batch).await {
        Ok(()) => debug!(count = batch.len(), "analytics batch sent"),
        Err(e) => warn!(count = batch.len(), error = %e, "analytics batch dropped"),
    }
}
