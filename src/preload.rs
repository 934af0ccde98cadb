//! Bandwidth-aware background fetching into the video partition.
//!
//! Jobs wait in a priority queue (high before medium before low, FIFO within
//! a tier) and drain into a pool bounded by a semaphore. Each job fetches one
//! source picked by the current network class. Finished jobs stay queryable
//! in a bounded history; the oldest finished job is dropped once the history
//! is full.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bandwidth::{BandwidthEstimator, NetworkClass};
use crate::cache::{CacheHandle, Lookup, PartitionKind, PutOutcome};
use crate::error::NetworkError;
use crate::fetch::{with_timeout, Fetcher};
use crate::quality::{QualityLevel, VideoSource};

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_PRELOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FINISHED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Loading,
    Loaded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Loaded | JobState::Failed | JobState::Cancelled)
    }
}

/// Snapshot of one preload job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadJob {
    pub video_id: String,
    pub sources: Vec<VideoSource>,
    pub priority: Priority,
    /// 0-100.
    pub progress: u8,
    pub state: JobState,
    pub selected: Option<VideoSource>,
    pub bytes_loaded: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreloadEvent {
    Started { video_id: String, quality: QualityLevel },
    Progress { video_id: String, percent: u8 },
    Finished { video_id: String, state: JobState },
}

#[derive(Debug, Clone)]
pub struct PreloadConfig {
    pub max_concurrency: usize,
    pub timeout: Duration,
    /// Finished jobs kept for `progress` queries.
    pub history: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: DEFAULT_PRELOAD_TIMEOUT,
            history: DEFAULT_FINISHED_HISTORY,
        }
    }
}

/// Pick the candidate to fetch for the current network class.
///
/// Slow links never fetch `high` or `ultra` unless nothing else exists. The
/// target is `low`, `medium` or `high` for slow, medium and fast links; the
/// nearest candidate wins and ties go to the lower quality.
pub fn select_source(sources: &[VideoSource], class: NetworkClass) -> Option<&VideoSource> {
    let target = QualityLevel::for_network(class);
    let narrowed: Vec<&VideoSource> = sources
        .iter()
        .filter(|s| class != NetworkClass::Slow || s.quality <= QualityLevel::Medium)
        .collect();
    let pool = if narrowed.is_empty() {
        sources.iter().collect()
    } else {
        narrowed
    };
    pool.into_iter().min_by_key(|s| (s.quality.distance(target), s.quality))
}

struct QueuedJob {
    priority: Priority,
    seq: u64,
    video_id: String,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // max-heap: higher priority first, then the earlier sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Tracked {
    job: PreloadJob,
    seq: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<QueuedJob>,
    jobs: HashMap<String, Tracked>,
    /// Ids of finished jobs, oldest first.
    finished: VecDeque<String>,
    history: usize,
    next_seq: u64,
}

impl State {
    /// Record that `video_id` reached a terminal state and drop the oldest
    /// finished jobs beyond the history bound.
    fn retire(&mut self, video_id: &str) {
        self.finished.retain(|id| id != video_id);
        self.finished.push_back(video_id.to_string());
        while self.finished.len() > self.history {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.jobs.get(&oldest).is_some_and(|t| t.job.state.is_terminal()) {
                self.jobs.remove(&oldest);
            }
        }
    }
}

struct Dispatch {
    video_id: String,
    seq: u64,
    source: VideoSource,
    token: CancellationToken,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    permits: Arc<Semaphore>,
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
    bandwidth: Arc<BandwidthEstimator>,
    timeout: Duration,
    events: broadcast::Sender<PreloadEvent>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct PreloadScheduler {
    inner: Arc<Inner>,
}

impl PreloadScheduler {
    /// Create the scheduler and spawn its dispatcher task.
    pub fn start(
        config: PreloadConfig,
        cache: CacheHandle,
        fetcher: Arc<dyn Fetcher>,
        bandwidth: Arc<BandwidthEstimator>,
    ) -> (Self, JoinHandle<()>) {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                history: config.history,
                ..State::default()
            }),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            cache,
            fetcher,
            bandwidth,
            timeout: config.timeout,
            events,
            shutdown: CancellationToken::new(),
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone()));
        (Self { inner }, dispatcher)
    }

    /// Queue a video for preloading. Returns `false` if it is already queued
    /// or loading, or the scheduler has shut down.
    pub fn enqueue(&self, video_id: impl Into<String>, sources: Vec<VideoSource>, priority: Priority) -> bool {
        let video_id = video_id.into();
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        {
            let mut state = self.inner.lock();
            if let Some(existing) = state.jobs.get(&video_id) {
                if !existing.job.state.is_terminal() {
                    return false;
                }
            }

            state.finished.retain(|id| id != &video_id);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.insert(
                video_id.clone(),
                Tracked {
                    job: PreloadJob {
                        video_id: video_id.clone(),
                        sources,
                        priority,
                        progress: 0,
                        state: JobState::Queued,
                        selected: None,
                        bytes_loaded: 0,
                        error: None,
                    },
                    seq,
                    token: self.inner.shutdown.child_token(),
                },
            );
            state.queue.push(QueuedJob {
                priority,
                seq,
                video_id: video_id.clone(),
            });
        }

        debug!(video_id = %video_id, ?priority, "preload queued");
        self.inner.notify.notify_one();
        true
    }

    /// Cancel a queued or in-flight job. Partial bytes are discarded.
    pub fn cancel(&self, video_id: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(tracked) = state.jobs.get_mut(video_id) else {
            return false;
        };
        if tracked.job.state.is_terminal() {
            return false;
        }
        tracked.job.state = JobState::Cancelled;
        tracked.token.cancel();
        // queued entries are skipped lazily by the dispatcher
        state.retire(video_id);
        drop(state);

        info!(video_id, "preload cancelled");
        self.inner.emit(PreloadEvent::Finished {
            video_id: video_id.to_string(),
            state: JobState::Cancelled,
        });
        true
    }

    pub fn progress(&self, video_id: &str) -> Option<PreloadJob> {
        self.inner.lock().jobs.get(video_id).map(|t| t.job.clone())
    }

    /// Number of jobs waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|t| t.job.state == JobState::Queued)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreloadEvent> {
        self.inner.events.subscribe()
    }

    /// Abort every job and stop the dispatcher. Jobs are discarded.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.lock();
        state.queue.clear();
        state.jobs.clear();
        state.finished.clear();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PreloadEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Pop the next runnable job and mark it loading.
    fn next_job(&self) -> Option<Dispatch> {
        let class = self.bandwidth.classify();
        let mut state = self.lock();

        while let Some(queued) = state.queue.pop() {
            let Some(tracked) = state.jobs.get_mut(&queued.video_id) else {
                continue;
            };
            if tracked.seq != queued.seq || tracked.job.state != JobState::Queued {
                continue;
            }

            match select_source(&tracked.job.sources, class).cloned() {
                Some(source) => {
                    tracked.job.state = JobState::Loading;
                    tracked.job.selected = Some(source.clone());
                    return Some(Dispatch {
                        video_id: queued.video_id,
                        seq: queued.seq,
                        source,
                        token: tracked.token.clone(),
                    });
                }
                None => {
                    tracked.job.state = JobState::Failed;
                    tracked.job.error = Some("no candidate sources".to_string());
                    warn!(video_id = %queued.video_id, "preload has no sources");
                    state.retire(&queued.video_id);
                }
            }
        }
        None
    }

    /// Record transfer progress for run `seq`; returns a changed percentage.
    fn update_progress(&self, video_id: &str, seq: u64, loaded: u64, total: Option<u64>) -> Option<u8> {
        let mut state = self.lock();
        let tracked = state.jobs.get_mut(video_id)?;
        if tracked.seq != seq || tracked.job.state != JobState::Loading {
            return None;
        }
        tracked.job.bytes_loaded = loaded;
        let percent = match total {
            // 100 is reserved for a stored result
            Some(total) if total > 0 => ((loaded.saturating_mul(100) / total).min(99)) as u8,
            _ => tracked.job.progress,
        };
        if percent == tracked.job.progress {
            return None;
        }
        tracked.job.progress = percent;
        Some(percent)
    }

    fn finish(&self, video_id: &str, seq: u64, state: JobState, error: Option<String>) {
        {
            let mut guard = self.lock();
            let Some(tracked) = guard.jobs.get_mut(video_id) else {
                return;
            };
            // a cancel or re-enqueue already superseded this run
            if tracked.seq != seq || tracked.job.state != JobState::Loading {
                return;
            }
            tracked.job.state = state;
            tracked.job.error = error;
            if state == JobState::Loaded {
                tracked.job.progress = 100;
            }
            guard.retire(video_id);
        }
        self.emit(PreloadEvent::Finished {
            video_id: video_id.to_string(),
            state,
        });
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let permit = tokio::select! {
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };

        let job = loop {
            if let Some(job) = inner.next_job() {
                break job;
            }
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = inner.shutdown.cancelled() => return,
            }
        };

        tokio::spawn(run_job(inner.clone(), job, permit));
    }
    debug!("preload dispatcher stopped");
}

async fn run_job(inner: Arc<Inner>, job: Dispatch, _permit: OwnedSemaphorePermit) {
    let Dispatch {
        video_id,
        seq,
        source,
        token,
    } = job;
    let key = crate::router::cache_key(&source.url);

    inner.emit(PreloadEvent::Started {
        video_id: video_id.clone(),
        quality: source.quality,
    });

    if let Lookup::Fresh(_) = inner.cache.lookup(PartitionKind::Video, &key).await {
        debug!(video_id = %video_id, url = %source.url, "preload already cached");
        inner.finish(&video_id, seq, JobState::Loaded, None);
        return;
    }

    let progress = {
        let inner = inner.clone();
        let video_id = video_id.clone();
        move |loaded: u64, total: Option<u64>| {
            if let Some(percent) = inner.update_progress(&video_id, seq, loaded, total) {
                inner.emit(PreloadEvent::Progress {
                    video_id: video_id.clone(),
                    percent,
                });
            }
        }
    };

    let headers = HeaderMap::new();
    let fetch = with_timeout(inner.timeout, inner.fetcher.fetch(&source.url, &headers, Some(&progress)));
    let result = tokio::select! {
        _ = token.cancelled() => Err(NetworkError::Cancelled),
        result = fetch => result,
    };

    match result {
        Ok(fetched) => {
            inner.bandwidth.record_sample(fetched.body.len() as u64, fetched.elapsed);
            if token.is_cancelled() {
                return;
            }
            let size = fetched.body.len();
            match inner
                .cache
                .put(PartitionKind::Video, &key, fetched.body, &fetched.content_type)
                .await
            {
                PutOutcome::Stored => {
                    info!(video_id = %video_id, quality = %source.quality, size, "preload stored");
                    inner.finish(&video_id, seq, JobState::Loaded, None);
                }
                outcome => {
                    warn!(video_id = %video_id, ?outcome, size, "preloaded video not cached");
                    inner.finish(&video_id, seq, JobState::Failed, Some(format!("not cached: {:?}", outcome)));
                }
            }
        }
        Err(NetworkError::Cancelled) => debug!(video_id = %video_id, "preload transfer aborted"),
        Err(e) => {
            warn!(video_id = %video_id, url = %source.url, error = %e, "preload failed");
            inner.finish(&video_id, seq, JobState::Failed, Some(e.to_string()));
        }
    }
}
