mod common;

use std::time::Duration;

use bytes::Bytes;
use url::Url;

use common::{blob, eventually, start_engine, test_config, MockFetcher};
use media_delivery::bandwidth::ConnectionHint;
use media_delivery::cache::PartitionKind;
use media_delivery::preload::{JobState, Priority};
use media_delivery::quality::{ladder_sources, QualityLevel, VideoSource};

fn serve_ladder(fetcher: &MockFetcher, base: &str) -> Vec<VideoSource> {
    let sources = ladder_sources(&Url::parse(base).unwrap());
    for source in &sources {
        fetcher.serve(source.url.as_str(), "video/mp4", blob(1000 + source.quality as usize));
    }
    sources
}

#[tokio::test]
async fn test_preload_stores_into_video_partition() {
    let fetcher = MockFetcher::new();
    let sources = serve_ladder(&fetcher, "http://cdn.test/v/intro.mp4");
    let engine = start_engine(&test_config(), fetcher.clone()).await;

    assert!(engine.preload.enqueue("intro", sources, Priority::High));
    assert!(eventually(|| engine.preload.progress("intro").map(|j| j.state) == Some(JobState::Loaded)).await);

    let job = engine.preload.progress("intro").unwrap();
    assert_eq!(job.progress, 100);
    // no samples and no hint: medium link, medium source
    let selected = job.selected.unwrap();
    assert_eq!(selected.quality, QualityLevel::Medium);
    assert!(engine
        .cache
        .get(PartitionKind::Video, selected.url.as_str())
        .await
        .is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_slow_link_preloads_low() {
    let fetcher = MockFetcher::new();
    let sources = serve_ladder(&fetcher, "http://cdn.test/v/intro.mp4");
    let mut config = test_config();
    config.network.connection_hint = Some(ConnectionHint::TwoG);
    let engine = start_engine(&config, fetcher.clone()).await;

    engine.preload.enqueue("intro", sources, Priority::Medium);
    assert!(eventually(|| engine.preload.progress("intro").map(|j| j.state) == Some(JobState::Loaded)).await);

    let requested: Vec<String> = fetcher.requests().into_iter().map(|(_, url)| url).collect();
    assert_eq!(requested, vec!["http://cdn.test/v/intro_360p.mp4".to_string()]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_millis(30));
    let mut config = test_config();
    config.preload.max_concurrency = 2;
    let engine = start_engine(&config, fetcher.clone()).await;

    for i in 0..6 {
        let url = format!("http://cdn.test/v/clip{}.mp4", i);
        fetcher.serve(&url, "video/mp4", blob(100));
        let source = VideoSource::from_url(Url::parse(&url).unwrap());
        engine.preload.enqueue(format!("clip{}", i), vec![source], Priority::Medium);
    }

    assert!(
        eventually(|| (0..6).all(|i| {
            engine.preload.progress(&format!("clip{}", i)).map(|j| j.state) == Some(JobState::Loaded)
        }))
        .await
    );
    assert!(fetcher.max_in_flight() <= 2);
    assert_eq!(fetcher.requests().len(), 6);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_priority_order_fifo_within_tier() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_millis(50));
    let mut config = test_config();
    config.preload.max_concurrency = 1;
    let engine = start_engine(&config, fetcher.clone()).await;

    let enqueue = |id: &str, priority| {
        let url = format!("http://cdn.test/v/{}.mp4", id);
        fetcher.serve(&url, "video/mp4", blob(10));
        engine
            .preload
            .enqueue(id, vec![VideoSource::from_url(Url::parse(&url).unwrap())], priority);
    };

    enqueue("first", Priority::Low);
    assert!(eventually(|| fetcher.requests().len() == 1).await);

    enqueue("low", Priority::Low);
    enqueue("high-a", Priority::High);
    enqueue("medium", Priority::Medium);
    enqueue("high-b", Priority::High);

    assert!(eventually(|| fetcher.requests().len() == 5).await);
    let order: Vec<String> = fetcher.requests().into_iter().map(|(_, url)| url).collect();
    assert_eq!(
        order,
        vec![
            "http://cdn.test/v/first.mp4",
            "http://cdn.test/v/high-a.mp4",
            "http://cdn.test/v/high-b.mp4",
            "http://cdn.test/v/medium.mp4",
            "http://cdn.test/v/low.mp4",
        ]
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_in_flight_discards_bytes() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_millis(300));
    let url = "http://cdn.test/v/long.mp4";
    fetcher.serve(url, "video/mp4", blob(500));
    let engine = start_engine(&test_config(), fetcher.clone()).await;

    engine
        .preload
        .enqueue("long", vec![VideoSource::from_url(Url::parse(url).unwrap())], Priority::High);
    assert!(eventually(|| engine.preload.progress("long").map(|j| j.state) == Some(JobState::Loading)).await);

    assert!(engine.preload.cancel("long"));
    assert!(!engine.preload.cancel("long"));
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(engine.preload.progress("long").unwrap().state, JobState::Cancelled);
    assert!(engine.cache.get(PartitionKind::Video, url).await.is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_job_never_fetches() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_millis(100));
    let mut config = test_config();
    config.preload.max_concurrency = 1;
    let engine = start_engine(&config, fetcher.clone()).await;

    for id in ["busy", "waiting"] {
        let url = format!("http://cdn.test/v/{}.mp4", id);
        fetcher.serve(&url, "video/mp4", blob(10));
        engine
            .preload
            .enqueue(id, vec![VideoSource::from_url(Url::parse(&url).unwrap())], Priority::Medium);
    }
    assert!(engine.preload.cancel("waiting"));
    assert!(eventually(|| engine.preload.progress("busy").map(|j| j.state) == Some(JobState::Loaded)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fetcher.calls("http://cdn.test/v/waiting.mp4"), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_failure_is_not_retried() {
    let fetcher = MockFetcher::new();
    fetcher.set_offline(true);
    let url = "http://cdn.test/v/gone.mp4";
    let engine = start_engine(&test_config(), fetcher.clone()).await;

    engine
        .preload
        .enqueue("gone", vec![VideoSource::from_url(Url::parse(url).unwrap())], Priority::High);
    assert!(eventually(|| engine.preload.progress("gone").map(|j| j.state) == Some(JobState::Failed)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fetcher.calls(url), 1);
    assert!(engine.preload.progress("gone").unwrap().error.is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_preload_timeout_fails_job() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_secs(5));
    let url = "http://cdn.test/v/slow.mp4";
    fetcher.serve(url, "video/mp4", Bytes::from_static(b"never"));
    let mut config = test_config();
    config.preload.timeout_secs = 1;
    let engine = start_engine(&config, fetcher).await;

    engine
        .preload
        .enqueue("slow", vec![VideoSource::from_url(Url::parse(url).unwrap())], Priority::High);
    let mut failed = false;
    for _ in 0..30 {
        if engine.preload.progress("slow").map(|j| j.state) == Some(JobState::Failed) {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(failed);
    assert!(engine.preload.progress("slow").unwrap().error.unwrap().contains("timed out"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_enqueue_rejected_while_pending() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_millis(100));
    let url = "http://cdn.test/v/dup.mp4";
    fetcher.serve(url, "video/mp4", blob(10));
    let engine = start_engine(&test_config(), fetcher.clone()).await;
    let source = VideoSource::from_url(Url::parse(url).unwrap());

    assert!(engine.preload.enqueue("dup", vec![source.clone()], Priority::Low));
    assert!(!engine.preload.enqueue("dup", vec![source.clone()], Priority::High));
    assert!(eventually(|| engine.preload.progress("dup").map(|j| j.state) == Some(JobState::Loaded)).await);

    // terminal jobs may be queued again; the cached copy short-circuits the fetch
    assert!(engine.preload.enqueue("dup", vec![source], Priority::Low));
    assert!(eventually(|| engine.preload.progress("dup").map(|j| j.state) == Some(JobState::Loaded)).await);
    assert_eq!(fetcher.calls(url), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_finished_jobs_are_bounded() {
    let fetcher = MockFetcher::new();
    let mut config = test_config();
    config.preload.max_concurrency = 1;
    config.preload.history = 4;
    let engine = start_engine(&config, fetcher.clone()).await;

    for i in 0..10 {
        let url = format!("http://cdn.test/v/batch{}.mp4", i);
        fetcher.serve(&url, "video/mp4", blob(64));
        let source = VideoSource::from_url(Url::parse(&url).unwrap());
        assert!(engine.preload.enqueue(format!("batch{}", i), vec![source], Priority::Medium));
    }
    assert!(eventually(|| engine.preload.progress("batch9").map(|j| j.state) == Some(JobState::Loaded)).await);

    let retained: Vec<usize> = (0..10)
        .filter(|i| engine.preload.progress(&format!("batch{}", i)).is_some())
        .collect();
    assert_eq!(retained, vec![6, 7, 8, 9]);
    // forgotten jobs can be queued again
    let url = "http://cdn.test/v/batch0.mp4";
    assert!(engine
        .preload
        .enqueue("batch0", vec![VideoSource::from_url(Url::parse(url).unwrap())], Priority::High));

    engine.shutdown().await;
}
