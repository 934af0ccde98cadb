//! Request classification and per-class caching strategies.
//!
//! | class      | partition | strategy                                   |
//! |------------|-----------|--------------------------------------------|
//! | video      | video     | cache-first, background revalidate, ranges |
//! | static     | static    | cache-first, stale on network failure       |
//! | navigation | static    | cache-first, offline page                  |
//! | api        | api       | network-first, cached copy within TTL      |
//! | other      | -         | network only                               |

mod offline;

pub use offline::{error_response, placeholder};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::header::{ACCEPT, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, RANGE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::bandwidth::BandwidthEstimator;
use crate::cache::{CacheHandle, CacheMeta, CachedContent, Lookup, PartitionKind, PutOutcome};
use crate::error::{DeliveryError, NetworkError};
use crate::fetch::{build_get, content_type_of, with_timeout, Fetcher};
use crate::range;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RANGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REVALIDATE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "webm", "ogv", "ogg", "mov", "mkv", "m3u8", "mpd", "ts", "m4s"];
const STATIC_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "woff", "woff2", "ttf", "otf", "eot",
];
const STATIC_DESTINATIONS: &[&str] = &["script", "style", "image", "font", "manifest"];

/// An inbound request as seen by the router.
#[derive(Debug, Clone)]
pub struct ContentRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ContentRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn range(&self) -> Option<&str> {
        self.headers.get(RANGE).and_then(|v| v.to_str().ok())
    }

    /// The request forwarded verbatim, minus hop-by-hop headers.
    fn into_upstream(self) -> Result<Request<Bytes>, NetworkError> {
        let mut builder = Request::builder().method(self.method).uri(self.url.as_str());
        for (key, value) in self.headers.iter() {
            if key != HOST && key != CONNECTION {
                builder = builder.header(key, value);
            }
        }
        builder
            .body(self.body)
            .map_err(|e| NetworkError::InvalidUrl(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Video,
    Static,
    Api,
    Navigation,
    Other,
}

impl RequestClass {
    pub fn partition(&self) -> Option<PartitionKind> {
        match self {
            RequestClass::Video => Some(PartitionKind::Video),
            RequestClass::Static | RequestClass::Navigation => Some(PartitionKind::Static),
            RequestClass::Api => Some(PartitionKind::Api),
            RequestClass::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Non-GET or non-http(s): forwarded untouched.
    Bypass,
    Deliver(RequestClass),
}

/// Classify from URL pattern and the declared content type.
pub fn classify(request: &ContentRequest) -> Route {
    if request.method != Method::GET || !matches!(request.url.scheme(), "http" | "https") {
        return Route::Bypass;
    }

    let path = request.url.path().to_ascii_lowercase();
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext);
    let accept = request.header(ACCEPT.as_str()).unwrap_or_default();
    let destination = request.header("sec-fetch-dest").unwrap_or_default();
    let has_extension = |list: &[&str]| extension.is_some_and(|ext| list.contains(&ext));

    let class = if destination == "video" || accept.starts_with("video/") || has_extension(VIDEO_EXTENSIONS) {
        RequestClass::Video
    } else if path.contains("/api/") || accept.starts_with("application/json") {
        RequestClass::Api
    } else if request.header("sec-fetch-mode") == Some("navigate") || accept.contains("text/html") {
        RequestClass::Navigation
    } else if has_extension(STATIC_EXTENSIONS) || STATIC_DESTINATIONS.contains(&destination) {
        RequestClass::Static
    } else {
        RequestClass::Other
    };
    Route::Deliver(class)
}

/// Cache key for a URL: the URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Hit,
    Miss,
    Stale,
}

impl Served {
    fn header(&self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Served::Hit => "HIT",
            Served::Miss => "MISS",
            Served::Stale => "STALE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub request_timeout: Duration,
    /// Applies to video fetches made to answer a `Range` request.
    pub range_timeout: Duration,
    /// Cached videos older than this are refreshed in the background.
    pub revalidate_after: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            range_timeout: DEFAULT_RANGE_TIMEOUT,
            revalidate_after: DEFAULT_REVALIDATE_AFTER,
        }
    }
}

/// Answers every request from cache, network or a synthetic fallback.
#[derive(Clone)]
pub struct DeliveryRouter {
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
    bandwidth: Arc<BandwidthEstimator>,
    config: RouterConfig,
    revalidating: Arc<Mutex<HashSet<String>>>,
}

impl DeliveryRouter {
    pub fn new(
        cache: CacheHandle,
        fetcher: Arc<dyn Fetcher>,
        bandwidth: Arc<BandwidthEstimator>,
        config: RouterConfig,
    ) -> Self {
        Self {
            cache,
            fetcher,
            bandwidth,
            config,
            revalidating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Only a range error, a video with neither network nor cache, or a
    /// failed bypass is an `Err`; every other failure degrades to a fallback
    /// response.
    pub async fn handle(&self, request: ContentRequest) -> Result<Response<Bytes>, DeliveryError> {
        let class = match classify(&request) {
            Route::Bypass => return self.bypass(request).await,
            Route::Deliver(class) => class,
        };
        debug!(url = %request.url, ?class, "routing request");

        match class {
            RequestClass::Video => self.video(request).await,
            RequestClass::Api => Ok(self.network_first(request).await),
            RequestClass::Static | RequestClass::Navigation => Ok(self.cache_first(request, class).await),
            RequestClass::Other => Ok(self.network_only(request).await),
        }
    }

    async fn bypass(&self, request: ContentRequest) -> Result<Response<Bytes>, DeliveryError> {
        debug!(method = %request.method, url = %request.url, "bypassing cache");
        let upstream = request.into_upstream()?;
        let response = with_timeout(self.config.request_timeout, self.fetcher.send(upstream, None)).await?;
        Ok(relay(response, None))
    }

    async fn fetch_upstream(&self, request: &ContentRequest, limit: Duration) -> Result<Response<Bytes>, NetworkError> {
        let upstream = build_get(&request.url, &request.headers)?;
        let started = Instant::now();
        let response = with_timeout(limit, self.fetcher.send(upstream, None)).await?;
        if response.status().is_success() {
            self.bandwidth
                .record_sample(response.body().len() as u64, started.elapsed());
        }
        Ok(response)
    }

    async fn store(&self, kind: PartitionKind, key: &str, body: Bytes, content_type: &str) {
        match self.cache.put(kind, key, body, content_type).await {
            PutOutcome::Stored => debug!(partition = kind.as_str(), key, "cached"),
            outcome => debug!(partition = kind.as_str(), key, ?outcome, "not cached"),
        }
    }

    async fn cache_first(&self, request: ContentRequest, class: RequestClass) -> Response<Bytes> {
        let kind = PartitionKind::Static;
        let key = cache_key(&request.url);

        let stale = match self.cache.lookup(kind, &key).await {
            Lookup::Fresh(cached) => return cached_response(cached, Served::Hit),
            Lookup::Stale(cached) => Some(cached),
            Lookup::Miss => None,
        };

        match self.fetch_upstream(&request, self.config.request_timeout).await {
            Ok(response) if !response.status().is_server_error() => {
                if response.status().is_success() {
                    let content_type = content_type_of(response.headers());
                    self.store(kind, &key, response.body().clone(), &content_type).await;
                }
                relay(response, Some(Served::Miss))
            }
            outcome => {
                log_failure(&request.url, &outcome);
                match (stale, outcome) {
                    (Some(cached), _) => cached_response(cached, Served::Stale),
                    (None, Ok(response)) => relay(response, Some(Served::Miss)),
                    (None, Err(_)) => placeholder(class),
                }
            }
        }
    }

    async fn network_first(&self, request: ContentRequest) -> Response<Bytes> {
        let kind = PartitionKind::Api;
        let key = cache_key(&request.url);

        match self.fetch_upstream(&request, self.config.request_timeout).await {
            Ok(response) if !response.status().is_server_error() => {
                if response.status().is_success() {
                    let content_type = content_type_of(response.headers());
                    self.store(kind, &key, response.body().clone(), &content_type).await;
                }
                relay(response, Some(Served::Miss))
            }
            outcome => {
                log_failure(&request.url, &outcome);
                // `get` honours the TTL: an expired copy is never served
                match (self.cache.get(kind, &key).await, outcome) {
                    (Some(cached), _) => cached_response(cached, Served::Stale),
                    (None, Ok(response)) => relay(response, Some(Served::Miss)),
                    (None, Err(_)) => placeholder(RequestClass::Api),
                }
            }
        }
    }

    async fn network_only(&self, request: ContentRequest) -> Response<Bytes> {
        match self.fetch_upstream(&request, self.config.request_timeout).await {
            Ok(response) => relay(response, None),
            Err(e) => {
                warn!(url = %request.url, error = %e, "upstream unavailable");
                placeholder(RequestClass::Other)
            }
        }
    }

    async fn video(&self, request: ContentRequest) -> Result<Response<Bytes>, DeliveryError> {
        let kind = PartitionKind::Video;
        let key = cache_key(&request.url);
        let range = request.range().map(str::to_string);

        let stale = match self.cache.lookup(kind, &key).await {
            Lookup::Fresh(cached) => {
                self.revalidate_if_old(&request, &cached.meta);
                return serve_video(&cached.content, &cached.meta.content_type, range.as_deref(), Served::Hit);
            }
            Lookup::Stale(cached) => Some(cached),
            Lookup::Miss => None,
        };

        let limit = if range.is_some() {
            self.config.range_timeout
        } else {
            self.config.request_timeout
        };
        let error = match self.fetch_upstream(&request, limit).await {
            Ok(response) if response.status().is_success() => {
                let content_type = content_type_of(response.headers());
                let body = response.into_body();
                self.store(kind, &key, body.clone(), &content_type).await;
                return serve_video(&body, &content_type, range.as_deref(), Served::Miss);
            }
            Ok(response) if !response.status().is_server_error() => return Ok(relay(response, Some(Served::Miss))),
            Ok(response) => NetworkError::Status(response.status()),
            Err(e) => e,
        };

        match stale {
            Some(cached) => {
                warn!(url = %request.url, error = %error, "serving expired video copy");
                serve_video(&cached.content, &cached.meta.content_type, range.as_deref(), Served::Stale)
            }
            None => {
                warn!(url = %request.url, error = %error, "video unavailable");
                Err(DeliveryError::VideoUnavailable {
                    url: request.url.to_string(),
                    source: error,
                })
            }
        }
    }

    fn revalidate_if_old(&self, request: &ContentRequest, meta: &CacheMeta) {
        let age = (Utc::now() - meta.cached_at).to_std().unwrap_or_default();
        if age < self.config.revalidate_after {
            return;
        }

        {
            let mut revalidating = self.revalidating.lock().unwrap_or_else(|p| p.into_inner());
            if !revalidating.insert(meta.key.clone()) {
                return;
            }
        }

        let router = self.clone();
        let request = ContentRequest::get(request.url.clone());
        let key = meta.key.clone();
        tokio::spawn(async move {
            match router.fetch_upstream(&request, router.config.request_timeout).await {
                Ok(response) if response.status().is_success() => {
                    let content_type = content_type_of(response.headers());
                    router
                        .store(PartitionKind::Video, &key, response.into_body(), &content_type)
                        .await;
                    info!(key = %key, "video revalidated");
                }
                Ok(response) => debug!(key = %key, status = %response.status(), "revalidation skipped"),
                Err(e) => debug!(key = %key, error = %e, "revalidation failed"),
            }
            router
                .revalidating
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&key);
        });
    }
}

fn log_failure(url: &Url, outcome: &Result<Response<Bytes>, NetworkError>) {
    match outcome {
        Ok(response) => warn!(url = %url, status = %response.status(), "upstream error"),
        Err(e) => warn!(url = %url, error = %e, "upstream unavailable"),
    }
}

fn serve_video(content: &Bytes, content_type: &str, range: Option<&str>, served: Served) -> Result<Response<Bytes>, DeliveryError> {
    let mut response = range::respond(content, content_type, range)?.into_response();
    response.headers_mut().insert(X_CACHE, served.header());
    Ok(response)
}

fn cached_response(cached: CachedContent, served: Served) -> Response<Bytes> {
    let mut response = Response::new(cached.content);
    *response.status_mut() = StatusCode::OK;
    let length = response.body().len() as u64;
    let headers = response.headers_mut();
    if let Ok(content_type) = HeaderValue::from_str(&cached.meta.content_type) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(X_CACHE, served.header());
    response
}

/// Pass an upstream response on with a buffered body.
fn relay(mut response: Response<Bytes>, served: Option<Served>) -> Response<Bytes> {
    let length = response.body().len() as u64;
    let headers = response.headers_mut();
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    if let Some(served) = served {
        headers.insert(X_CACHE, served.header());
    }
    response
}
