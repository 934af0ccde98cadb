//! JSON control messages from the page to the engine.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheHandle, CacheStatus, PartitionKind};
use crate::preload::{Priority, PreloadScheduler};
use crate::quality::VideoSource;
use crate::router::cache_key;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    PreloadVideo {
        url: Url,
        #[serde(default)]
        priority: Priority,
    },
    RemoveVideo {
        url: Url,
    },
    ClearVideoCache,
    ClearAllCaches,
    InvalidateCache {
        pattern: String,
    },
    GetCacheStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
    Status(CacheStatus),
    Done {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        removed: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlReply {
    fn ok() -> Self {
        ControlReply::Done {
            success: true,
            removed: None,
            error: None,
        }
    }

    fn removed(count: usize) -> Self {
        ControlReply::Done {
            success: true,
            removed: Some(count),
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        ControlReply::Done {
            success: false,
            removed: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ControlReply::Status(_) => true,
            ControlReply::Done { success, .. } => *success,
        }
    }
}

#[derive(Clone)]
pub struct ControlDispatcher {
    cache: CacheHandle,
    preload: PreloadScheduler,
}

impl ControlDispatcher {
    pub fn new(cache: CacheHandle, preload: PreloadScheduler) -> Self {
        Self { cache, preload }
    }

    pub async fn dispatch(&self, command: ControlCommand) -> ControlReply {
        match command {
            ControlCommand::PreloadVideo { url, priority } => {
                let video_id = cache_key(&url);
                let queued = self
                    .preload
                    .enqueue(video_id.clone(), vec![VideoSource::from_url(url)], priority);
                info!(video_id = %video_id, ?priority, queued, "preload requested");
                ControlReply::ok()
            }
            ControlCommand::RemoveVideo { url } => match self.cache.delete(PartitionKind::Video, &cache_key(&url)).await {
                Ok(removed) => ControlReply::removed(removed as usize),
                Err(e) => {
                    warn!(url = %url, error = %e, "remove video failed");
                    ControlReply::failed(e)
                }
            },
            ControlCommand::ClearVideoCache => match self.cache.clear(PartitionKind::Video).await {
                Ok(()) => ControlReply::ok(),
                Err(e) => ControlReply::failed(e),
            },
            ControlCommand::ClearAllCaches => match self.cache.clear_all().await {
                Ok(()) => ControlReply::ok(),
                Err(e) => ControlReply::failed(e),
            },
            ControlCommand::InvalidateCache { pattern } => {
                let regex = match Regex::new(&pattern) {
                    Ok(regex) => regex,
                    Err(e) => return ControlReply::failed(format!("invalid pattern: {}", e)),
                };
                match self.cache.invalidate(regex).await {
                    Ok(count) => {
                        info!(pattern = %pattern, count, "cache invalidated");
                        ControlReply::removed(count)
                    }
                    Err(e) => ControlReply::failed(e),
                }
            }
            ControlCommand::GetCacheStatus => match self.cache.status(PartitionKind::Video).await {
                Ok(status) => ControlReply::Status(status),
                Err(e) => ControlReply::failed(e),
            },
        }
    }
}
