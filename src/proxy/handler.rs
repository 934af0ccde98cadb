use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::bandwidth::{BandwidthEstimator, NetworkClass};
use crate::cache::{CacheHandle, CacheStats, CacheStatus, PartitionKind};
use crate::control::{ControlCommand, ControlDispatcher};
use crate::engine::Engine;
use crate::router::{error_response, ContentRequest, DeliveryRouter};

pub type ProxyBody = Full<Bytes>;

/// Shared state for every connection.
pub struct ProxyState {
    router: DeliveryRouter,
    control: ControlDispatcher,
    cache: CacheHandle,
    bandwidth: Arc<BandwidthEstimator>,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ProxyState {
    pub fn new(engine: &Engine, max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            router: engine.router.clone(),
            control: engine.control.clone(),
            cache: engine.cache.clone(),
            bandwidth: engine.bandwidth.clone(),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Connection slots not currently in use.
    pub fn available_connections(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PartitionReport {
    partition: PartitionKind,
    #[serde(flatten)]
    status: CacheStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    #[serde(flatten)]
    video: CacheStatus,
    partitions: Vec<PartitionReport>,
    stats: CacheStats,
    bandwidth_kbps: Option<f64>,
    network: NetworkClass,
}

fn full(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let body = body.into();
    let length = body.len() as u64;
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => full(status, "application/json", body),
        Err(e) => full(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
    }
}

fn into_proxy_body(response: Response<Bytes>) -> Response<ProxyBody> {
    response.map(Full::new)
}

/// The `url` query parameter of a `/fetch` request.
fn fetch_target(uri: &hyper::Uri) -> Option<Url> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "url")
        .and_then(|(_, value)| Url::parse(&value).ok())
}

/// Entry point for every proxied request.
///
/// Absolute-form requests and `/fetch?url=` go through the delivery router;
/// `POST /control` and `GET /status` are answered locally.
pub async fn handle_request<B>(req: Request<B>, state: Arc<ProxyState>) -> Result<Response<ProxyBody>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    let Ok(_permit) = state.semaphore.acquire().await else {
        return Ok(full(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "Shutting down"));
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return Ok(full(StatusCode::BAD_REQUEST, "text/plain", "Unreadable request body"));
        }
    };

    if parts.uri.scheme().is_some() {
        let Ok(url) = Url::parse(&parts.uri.to_string()) else {
            return Ok(full(StatusCode::BAD_REQUEST, "text/plain", "Invalid target URL"));
        };
        return Ok(deliver(&state, parts.method, url, parts.headers, body).await);
    }

    let route = (parts.method.clone(), parts.uri.path().to_string());
    let response = match (&route.0, route.1.as_str()) {
        (&Method::POST, "/control") => control(&state, &body).await,
        (&Method::GET, "/status") => status(&state).await,
        (_, "/fetch") => match fetch_target(&parts.uri) {
            Some(url) => deliver(&state, parts.method, url, parts.headers, body).await,
            None => full(StatusCode::BAD_REQUEST, "text/plain", "Missing or invalid url parameter"),
        },
        _ => full(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

async fn deliver(
    state: &ProxyState,
    method: Method,
    url: Url,
    headers: hyper::HeaderMap,
    body: Bytes,
) -> Response<ProxyBody> {
    let request = ContentRequest {
        method,
        url,
        headers,
        body,
    };
    match state.router.handle(request).await {
        Ok(response) => into_proxy_body(response),
        Err(e) => {
            debug!(error = %e, "delivery failed");
            into_proxy_body(error_response(&e))
        }
    }
}

async fn control(state: &ProxyState, body: &Bytes) -> Response<ProxyBody> {
    let command: ControlCommand = match serde_json::from_slice(body) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "rejected control message");
            return json(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({ "success": false, "error": e.to_string() }),
            );
        }
    };
    let reply = state.control.dispatch(command).await;
    let status = if reply.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    json(status, &reply)
}

async fn status(state: &ProxyState) -> Response<ProxyBody> {
    let mut partitions = Vec::new();
    for kind in PartitionKind::ALL {
        match state.cache.status(kind).await {
            Ok(status) => partitions.push(PartitionReport { partition: kind, status }),
            Err(e) => {
                return full(StatusCode::SERVICE_UNAVAILABLE, "text/plain", e.to_string());
            }
        }
    }
    let video = partitions
        .iter()
        .find(|p| p.partition == PartitionKind::Video)
        .map(|p| p.status.clone());
    let (Some(video), Ok(stats)) = (video, state.cache.stats().await) else {
        return full(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "Cache unavailable");
    };

    json(
        StatusCode::OK,
        &StatusReport {
            video,
            partitions,
            stats,
            bandwidth_kbps: state.bandwidth.estimate(),
            network: state.bandwidth.classify(),
        },
    )
}
