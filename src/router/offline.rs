use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Response, StatusCode};
use serde_json::json;

use super::RequestClass;
use crate::error::DeliveryError;
use crate::range::not_satisfiable;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline</title>
<style>
body { font-family: system-ui, sans-serif; text-align: center; padding: 4rem 1rem; color: #333; }
h1 { font-size: 1.5rem; }
</style>
</head>
<body>
<h1>You are offline</h1>
<p>This page is not available without a connection. Cached videos can still be played.</p>
</body>
</html>
"#;

fn unavailable(content_type: &'static str, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    let length = response.body().len() as u64;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Synthetic response for a request that has neither network nor cache.
pub fn placeholder(class: RequestClass) -> Response<Bytes> {
    match class {
        RequestClass::Navigation => unavailable("text/html; charset=utf-8", Bytes::from_static(OFFLINE_PAGE.as_bytes())),
        RequestClass::Api => {
            let body = json!({
                "error": "offline",
                "offline": true,
                "message": "No network connection and no cached response available",
            });
            unavailable("application/json", Bytes::from(body.to_string()))
        }
        RequestClass::Video => video_unavailable(),
        RequestClass::Static | RequestClass::Other => {
            unavailable("text/plain; charset=utf-8", Bytes::from_static(b"Service Unavailable"))
        }
    }
}

fn video_unavailable() -> Response<Bytes> {
    let mut response = unavailable(
        "text/plain; charset=utf-8",
        Bytes::from_static(b"Video unavailable offline"),
    );
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("30"));
    response
}

/// HTTP rendering of a hard delivery failure.
pub fn error_response(err: &DeliveryError) -> Response<Bytes> {
    match err {
        DeliveryError::Range(range) => not_satisfiable(range),
        DeliveryError::VideoUnavailable { .. } => video_unavailable(),
        DeliveryError::Network(e) => {
            let mut response = unavailable("text/plain; charset=utf-8", Bytes::from(e.to_string()));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            response
        }
    }
}
