mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_RANGE, RANGE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::oneshot;

use common::{blob, start_engine, test_config, MockFetcher};
use media_delivery::proxy::{handle_request, ProxyServer, ProxyState};
use media_delivery::Engine;

const VIDEO: &str = "http://cdn.test/v/intro_480p.mp4";

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    engine: Engine,
}

async fn serve(fetcher: Arc<MockFetcher>) -> Running {
    let engine = start_engine(&test_config(), fetcher).await;
    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), ProxyState::new(&engine, 8))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));
    Running { addr, stop, engine }
}

fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn send(request: Request<Full<Bytes>>) -> (StatusCode, http::HeaderMap, Bytes) {
    let response = client().request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

fn fetch_uri(addr: SocketAddr, target: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    format!("http://{}/fetch?url={}", addr, encoded)
}

#[tokio::test]
async fn test_fetch_endpoint_serves_ranges() {
    let fetcher = MockFetcher::new();
    let content = blob(1000);
    fetcher.serve(VIDEO, "video/mp4", content.clone());
    let running = serve(fetcher.clone()).await;

    let request = Request::get(fetch_uri(running.addr, VIDEO))
        .header(RANGE, "bytes=100-199")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(request).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[CONTENT_RANGE], "bytes 100-199/1000");
    assert_eq!(body, content.slice(100..200));

    let request = Request::get(fetch_uri(running.addr, VIDEO))
        .header(RANGE, "bytes=5000-")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, _) = send(request).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers[CONTENT_RANGE], "bytes */1000");
    assert_eq!(fetcher.calls(VIDEO), 1);

    let _ = running.stop.send(());
    running.engine.shutdown().await;
}

#[tokio::test]
async fn test_control_and_status_endpoints() {
    let fetcher = MockFetcher::new();
    fetcher.serve(VIDEO, "video/mp4", blob(300));
    fetcher.set_delay(std::time::Duration::from_millis(5));
    let running = serve(fetcher).await;

    let warm = Request::get(fetch_uri(running.addr, VIDEO))
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(send(warm).await.0, StatusCode::OK);

    let status = Request::get(format!("http://{}/status", running.addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (code, _, body) = send(status).await;
    assert_eq!(code, StatusCode::OK);
    let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["videoCount"], 1);
    assert_eq!(report["totalSize"], 300);
    assert_eq!(report["partitions"].as_array().unwrap().len(), 3);
    assert!(report["bandwidthKbps"].is_number());

    let clear = Request::post(format!("http://{}/control", running.addr))
        .body(Full::new(Bytes::from_static(br#"{"type":"CLEAR_VIDEO_CACHE"}"#)))
        .unwrap();
    let (code, _, body) = send(clear).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(&body[..], br#"{"success":true}"#);

    let bogus = Request::post(format!("http://{}/control", running.addr))
        .body(Full::new(Bytes::from_static(br#"{"type":"REBOOT"}"#)))
        .unwrap();
    assert_eq!(send(bogus).await.0, StatusCode::BAD_REQUEST);

    let unknown = Request::get(format!("http://{}/nowhere", running.addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(send(unknown).await.0, StatusCode::NOT_FOUND);

    let _ = running.stop.send(());
    running.engine.shutdown().await;
}

#[tokio::test]
async fn test_absolute_form_request_is_delivered() {
    let fetcher = MockFetcher::new();
    fetcher.set_offline(true);
    let engine = start_engine(&test_config(), fetcher).await;
    let state = Arc::new(ProxyState::new(&engine, 4));
    assert_eq!(state.max_connections(), 4);

    let request = Request::builder()
        .method(Method::GET)
        .uri(VIDEO)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = handle_request(request, state.clone()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "30");
    // the slot is released once the response is built
    assert_eq!(state.available_connections(), 4);
    assert_eq!(state.max_connections(), 4);

    engine.shutdown().await;
}
