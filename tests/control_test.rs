mod common;

use bytes::Bytes;
use url::Url;

use common::{blob, eventually, start_engine, test_config, MockFetcher};
use media_delivery::cache::PartitionKind;
use media_delivery::control::{ControlCommand, ControlReply};
use media_delivery::router::ContentRequest;

fn command(json: &str) -> ControlCommand {
    serde_json::from_str(json).unwrap()
}

#[tokio::test]
async fn test_status_of_empty_video_partition() {
    let engine = start_engine(&test_config(), MockFetcher::new()).await;

    let reply = engine.control.dispatch(command(r#"{"type":"GET_CACHE_STATUS"}"#)).await;
    let json = serde_json::to_value(&reply).unwrap();
    assert_eq!(json["videoCount"], 0);
    assert_eq!(json["totalSize"], 0);
    assert_eq!(json["maxSize"], test_config().cache.video.budget_bytes);
    assert_eq!(json["usagePercentage"], 0.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_preload_then_remove_video() {
    let fetcher = MockFetcher::new();
    let url = "http://cdn.test/v/trailer_720p.mp4";
    fetcher.serve(url, "video/mp4", blob(2048));
    let engine = start_engine(&test_config(), fetcher.clone()).await;

    let reply = engine
        .control
        .dispatch(command(&format!(r#"{{"type":"PRELOAD_VIDEO","url":"{}","priority":"high"}}"#, url)))
        .await;
    assert!(reply.is_success());

    assert!(eventually(|| engine.preload.progress(url).is_some_and(|j| j.state.is_terminal())).await);
    match engine.control.dispatch(ControlCommand::GetCacheStatus).await {
        ControlReply::Status(status) => {
            assert_eq!(status.video_count, 1);
            assert_eq!(status.total_size, 2048);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    let reply = engine
        .control
        .dispatch(ControlCommand::RemoveVideo {
            url: Url::parse(url).unwrap(),
        })
        .await;
    assert_eq!(serde_json::to_value(&reply).unwrap(), serde_json::json!({"success": true, "removed": 1}));
    assert_eq!(engine.cache.size_of(PartitionKind::Video).await, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_by_pattern_across_partitions() {
    let fetcher = MockFetcher::new();
    let keep = "http://site.test/assets/app.css";
    let drop_script = "http://site.test/assets/app.js";
    let drop_api = "http://site.test/api/list.js";
    for url in [keep, drop_script, drop_api] {
        fetcher.serve(url, "text/plain", Bytes::from_static(b"x"));
    }
    let engine = start_engine(&test_config(), fetcher).await;
    for url in [keep, drop_script, drop_api] {
        engine
            .router
            .handle(ContentRequest::get(Url::parse(url).unwrap()))
            .await
            .unwrap();
    }

    let reply = engine
        .control
        .dispatch(command(r#"{"type":"INVALIDATE_CACHE","pattern":"\\.js$"}"#))
        .await;
    assert_eq!(
        reply,
        ControlReply::Done {
            success: true,
            removed: Some(2),
            error: None
        }
    );
    assert!(engine.cache.get(PartitionKind::Static, keep).await.is_some());
    assert!(engine.cache.get(PartitionKind::Static, drop_script).await.is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_pattern_reports_failure() {
    let engine = start_engine(&test_config(), MockFetcher::new()).await;

    let reply = engine
        .control
        .dispatch(ControlCommand::InvalidateCache {
            pattern: "([unclosed".to_string(),
        })
        .await;
    assert!(!reply.is_success());
    let json = serde_json::to_value(&reply).unwrap();
    assert!(json["error"].as_str().unwrap().starts_with("invalid pattern"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_clear_all_caches() {
    let fetcher = MockFetcher::new();
    let video = "http://cdn.test/v/a.mp4";
    let script = "http://site.test/assets/a.js";
    fetcher.serve(video, "video/mp4", blob(100));
    fetcher.serve(script, "application/javascript", blob(10));
    let engine = start_engine(&test_config(), fetcher).await;
    for url in [video, script] {
        engine
            .router
            .handle(ContentRequest::get(Url::parse(url).unwrap()))
            .await
            .unwrap();
    }
    assert_eq!(engine.cache.size_of(PartitionKind::Video).await, 100);

    let video_only = engine.control.dispatch(ControlCommand::ClearVideoCache).await;
    assert!(video_only.is_success());
    assert_eq!(engine.cache.size_of(PartitionKind::Video).await, 0);
    assert_eq!(engine.cache.size_of(PartitionKind::Static).await, 10);

    let all = engine.control.dispatch(command(r#"{"type":"CLEAR_ALL_CACHES"}"#)).await;
    assert!(all.is_success());
    for kind in PartitionKind::ALL {
        assert_eq!(engine.cache.size_of(kind).await, 0);
    }

    engine.shutdown().await;
}
