//! Upstream fetching over the hyper-util client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, RANGE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::cache::DEFAULT_CONTENT_TYPE;
use crate::error::NetworkError;

/// Called with `(bytes_received, total_if_known)` as body frames arrive.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// A successful, fully received GET.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
    pub elapsed: Duration,
}

/// Anything that can carry a request to the origin.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Send a request and buffer the whole response, whatever its status.
    async fn send(&self, request: Request<Bytes>, progress: Option<&ProgressFn>) -> Result<Response<Bytes>, NetworkError>;

    /// GET `url`, treating any non-2xx status as a failure.
    async fn fetch(
        &self,
        url: &Url,
        headers: &HeaderMap,
        progress: Option<&ProgressFn>,
    ) -> Result<FetchedContent, NetworkError> {
        let request = build_get(url, headers)?;
        let started = Instant::now();
        let response = self.send(request, progress).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status(status));
        }
        Ok(FetchedContent {
            status,
            content_type: content_type_of(response.headers()),
            body: response.into_body(),
            elapsed: started.elapsed(),
        })
    }
}

/// A GET for `url` carrying the given headers minus hop-by-hop ones.
///
/// `Range` is dropped too: the engine always fetches whole resources and
/// slices them itself.
pub fn build_get(url: &Url, headers: &HeaderMap) -> Result<Request<Bytes>, NetworkError> {
    let mut builder = Request::builder().method(Method::GET).uri(url.as_str());
    for (key, value) in headers.iter() {
        if key != HOST && key != CONNECTION && key != RANGE {
            builder = builder.header(key, value);
        }
    }
    builder
        .body(Bytes::new())
        .map_err(|e| NetworkError::InvalidUrl(format!("{}: {}", url, e)))
}

pub fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Run a fetch under a deadline; expiry is reported like any network failure.
pub async fn with_timeout<T, F>(limit: Duration, future: F) -> Result<T, NetworkError>
where
    F: std::future::Future<Output = Result<T, NetworkError>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout(limit)),
    }
}

/// HTTP/1.1 client with per-attempt timeout and exponential-backoff retry.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration, max_retries: u32, retry_delay: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            request_timeout,
            max_retries,
            retry_delay,
        }
    }

    async fn send_once(&self, request: Request<Bytes>, progress: Option<&ProgressFn>) -> Result<Response<Bytes>, NetworkError> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(body));

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;

        let (parts, mut incoming) = response.into_parts();
        let total = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let mut body = BytesMut::new();
        while let Some(frame) = incoming.frame().await {
            let frame = frame.map_err(|e| NetworkError::Connection(e.to_string()))?;
            if let Ok(chunk) = frame.into_data() {
                body.extend_from_slice(&chunk);
                if let Some(progress) = progress {
                    progress(body.len() as u64, total);
                }
            }
        }

        Ok(Response::from_parts(parts, body.freeze()))
    }

    /// Delay before retry `attempt` (1-based): `retry_delay * 2^(attempt-1)`,
    /// saturating instead of overflowing.
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }

    fn retryable(result: &Result<Response<Bytes>, NetworkError>) -> bool {
        match result {
            Ok(response) => response.status().is_server_error(),
            Err(NetworkError::Connection(_)) | Err(NetworkError::Timeout(_)) => true,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn send(&self, request: Request<Bytes>, progress: Option<&ProgressFn>) -> Result<Response<Bytes>, NetworkError> {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt)).await;
                debug!(attempt, max = self.max_retries, uri = %request.uri(), "retrying upstream request");
            }

            let result = with_timeout(self.request_timeout, self.send_once(clone_request(&request), progress)).await;
            if attempt >= self.max_retries || !Self::retryable(&result) {
                if let Err(e) = &result {
                    warn!(uri = %request.uri(), error = %e, attempts = attempt + 1, "upstream request failed");
                }
                return result;
            }
            attempt += 1;
        }
    }
}

fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut clone = Request::new(request.body().clone());
    *clone.method_mut() = request.method().clone();
    *clone.uri_mut() = request.uri().clone();
    *clone.version_mut() = request.version();
    *clone.headers_mut() = request.headers().clone();
    clone
}
