#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};

use media_delivery::analytics::{AnalyticsEvent, EventSink, LogSink};
use media_delivery::cache::{EntryStore, MemoryStore};
use media_delivery::config::EngineConfig;
use media_delivery::error::{NetworkError, PlayerError};
use media_delivery::fetch::{Fetcher, ProgressFn};
use media_delivery::quality::{PlayerHandle, PlayerSnapshot, VideoSource};
use media_delivery::Engine;

pub fn blob(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

#[derive(Clone)]
struct Route {
    status: StatusCode,
    content_type: String,
    body: Bytes,
}

/// Scripted origin. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<(Method, String)>>,
    offline: AtomicBool,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, content_type: &str, body: Bytes) {
        self.serve_status(url, StatusCode::OK, content_type, body);
    }

    pub fn serve_status(&self, url: &str, status: StatusCode, content_type: &str, body: Bytes) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status,
                content_type: content_type.to_string(),
                body,
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|(_, u)| u == url).count()
    }

    pub fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn send(&self, request: Request<Bytes>, progress: Option<&ProgressFn>) -> Result<Response<Bytes>, NetworkError> {
        let url = request.uri().to_string();
        self.requests
            .lock()
            .unwrap()
            .push((request.method().clone(), url.clone()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::Connection("network unreachable".to_string()));
        }

        let route = self.routes.lock().unwrap().get(&url).cloned();
        let route = route.unwrap_or(Route {
            status: StatusCode::NOT_FOUND,
            content_type: "text/plain".to_string(),
            body: Bytes::from_static(b"not found"),
        });

        if let Some(progress) = progress {
            let total = route.body.len() as u64;
            let step = (total / 4).max(1);
            let mut sent = 0;
            while sent < total {
                sent = (sent + step).min(total);
                progress(sent, Some(total));
            }
        }

        let mut response = Response::new(route.body.clone());
        *response.status_mut() = route.status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, route.content_type.parse().unwrap());
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, route.body.len().into());
        Ok(response)
    }
}

/// Player whose transport state is set by the test.
pub struct MockPlayer {
    snapshot: Mutex<PlayerSnapshot>,
    loads: Mutex<Vec<(VideoSource, f64, bool)>>,
    fail_loads: AtomicBool,
    hang_loads: AtomicBool,
}

impl MockPlayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(PlayerSnapshot {
                position: 0.0,
                duration: Some(120.0),
                buffered_ahead: 5.0,
                paused: true,
                ended: false,
            }),
            loads: Mutex::new(Vec::new()),
            fail_loads: AtomicBool::new(false),
            hang_loads: AtomicBool::new(false),
        })
    }

    pub fn playing(&self, position: f64, buffered_ahead: f64) {
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.position = position;
        snapshot.buffered_ahead = buffered_ahead;
        snapshot.paused = false;
        snapshot.ended = false;
    }

    pub fn pause(&self) {
        self.snapshot.lock().unwrap().paused = true;
    }

    pub fn end(&self) {
        self.snapshot.lock().unwrap().ended = true;
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn hang_loads(&self, hang: bool) {
        self.hang_loads.store(hang, Ordering::SeqCst);
    }

    pub fn loads(&self) -> Vec<(VideoSource, f64, bool)> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlayerHandle for MockPlayer {
    async fn snapshot(&self) -> Result<PlayerSnapshot, PlayerError> {
        Ok(*self.snapshot.lock().unwrap())
    }

    async fn load_source(&self, source: &VideoSource, position: f64, resume: bool) -> Result<(), PlayerError> {
        if self.hang_loads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(PlayerError::LoadFailed(format!("decode error in {}", source.url)));
        }
        self.loads
            .lock()
            .unwrap()
            .push((source.clone(), position, resume));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<AnalyticsEvent>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, batch: &[AnalyticsEvent]) -> Result<(), NetworkError> {
        self.events.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.network.request_timeout_secs = 2;
    config.network.range_timeout_secs = 2;
    config.preload.timeout_secs = 2;
    config
}

pub async fn start_engine(config: &EngineConfig, fetcher: Arc<MockFetcher>) -> Engine {
    start_engine_with(config, Arc::new(MemoryStore::new()), fetcher).await
}

pub async fn start_engine_with(config: &EngineConfig, backend: Arc<dyn EntryStore>, fetcher: Arc<MockFetcher>) -> Engine {
    Engine::start_with(config, backend, fetcher, Arc::new(LogSink))
        .await
        .expect("engine starts")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
