//! Actor wrapper that gives the cache store a single owner.
//!
//! Every component talks to the cache through a cloneable `CacheHandle`; the
//! actor task applies commands one at a time, so no two mutations of a
//! partition ever interleave.

use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CacheMeta, CacheStats, CacheStatus, CacheStore, CachedContent, Lookup, PartitionKind, PartitionPolicy, PutOutcome};
use crate::error::StorageError;

const COMMAND_BUFFER: usize = 256;

enum Command {
    Put {
        kind: PartitionKind,
        key: String,
        content: Bytes,
        content_type: String,
        reply: oneshot::Sender<PutOutcome>,
    },
    Get {
        kind: PartitionKind,
        key: String,
        reply: oneshot::Sender<Option<CachedContent>>,
    },
    Lookup {
        kind: PartitionKind,
        key: String,
        reply: oneshot::Sender<Lookup>,
    },
    Delete {
        kind: PartitionKind,
        key: String,
        reply: oneshot::Sender<Result<bool, StorageError>>,
    },
    ListMeta {
        kind: PartitionKind,
        reply: oneshot::Sender<Vec<CacheMeta>>,
    },
    SizeOf {
        kind: PartitionKind,
        reply: oneshot::Sender<u64>,
    },
    Policy {
        kind: PartitionKind,
        reply: oneshot::Sender<Option<PartitionPolicy>>,
    },
    Clear {
        kind: PartitionKind,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    Invalidate {
        pattern: Regex,
        reply: oneshot::Sender<usize>,
    },
    Sweep {
        reply: oneshot::Sender<usize>,
    },
    Status {
        kind: PartitionKind,
        reply: oneshot::Sender<CacheStatus>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable async front end to the cache actor.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<Command>,
}

impl CacheHandle {
    /// Start the actor. `sweep_interval` drives the periodic TTL sweep and
    /// access-stat flush.
    pub fn spawn(store: CacheStore, sweep_interval: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run(store, rx, sweep_interval));
        (Self { tx }, task)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| StorageError::Unavailable)?;
        rx.await.map_err(|_| StorageError::Unavailable)
    }

    /// Store content. A dead actor reads as "not cached".
    pub async fn put(&self, kind: PartitionKind, key: &str, content: Bytes, content_type: &str) -> PutOutcome {
        self.request(|reply| Command::Put {
            kind,
            key: key.to_string(),
            content,
            content_type: content_type.to_string(),
            reply,
        })
        .await
        .unwrap_or(PutOutcome::Failed)
    }

    pub async fn get(&self, kind: PartitionKind, key: &str) -> Option<CachedContent> {
        self.request(|reply| Command::Get {
            kind,
            key: key.to_string(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn lookup(&self, kind: PartitionKind, key: &str) -> Lookup {
        self.request(|reply| Command::Lookup {
            kind,
            key: key.to_string(),
            reply,
        })
        .await
        .unwrap_or(Lookup::Miss)
    }

    pub async fn delete(&self, kind: PartitionKind, key: &str) -> Result<bool, StorageError> {
        self.request(|reply| Command::Delete {
            kind,
            key: key.to_string(),
            reply,
        })
        .await?
    }

    pub async fn list_meta(&self, kind: PartitionKind) -> Vec<CacheMeta> {
        self.request(|reply| Command::ListMeta { kind, reply })
            .await
            .unwrap_or_default()
    }

    pub async fn size_of(&self, kind: PartitionKind) -> u64 {
        self.request(|reply| Command::SizeOf { kind, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn policy(&self, kind: PartitionKind) -> Option<PartitionPolicy> {
        self.request(|reply| Command::Policy { kind, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn clear(&self, kind: PartitionKind) -> Result<(), StorageError> {
        self.request(|reply| Command::Clear { kind, reply }).await?
    }

    pub async fn clear_all(&self) -> Result<(), StorageError> {
        self.request(|reply| Command::ClearAll { reply }).await?
    }

    pub async fn invalidate(&self, pattern: Regex) -> Result<usize, StorageError> {
        self.request(|reply| Command::Invalidate { pattern, reply }).await
    }

    pub async fn sweep(&self) -> Result<usize, StorageError> {
        self.request(|reply| Command::Sweep { reply }).await
    }

    pub async fn status(&self, kind: PartitionKind) -> Result<CacheStatus, StorageError> {
        self.request(|reply| Command::Status { kind, reply }).await
    }

    pub async fn stats(&self) -> Result<CacheStats, StorageError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Flush pending writes and stop the actor.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run(mut store: CacheStore, mut rx: mpsc::Receiver<Command>, sweep_interval: Duration) {
    let mut sweep = tokio::time::interval(sweep_interval);
    // the first tick fires immediately; skip it
    sweep.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                if let Some(reply) = apply(&mut store, command).await {
                    flush(&mut store).await;
                    let _ = reply.send(());
                    info!("cache actor stopped");
                    return;
                }
            }
            _ = sweep.tick() => {
                let removed = store.sweep().await;
                debug!(removed, "periodic cache sweep");
                flush(&mut store).await;
            }
        }
    }

    flush(&mut store).await;
    info!("cache actor stopped, all handles dropped");
}

async fn flush(store: &mut CacheStore) {
    if let Err(e) = store.flush().await {
        warn!(error = %e, "failed to flush cache index");
    }
}

/// Apply one command. Returns the reply channel when the command was a shutdown.
async fn apply(store: &mut CacheStore, command: Command) -> Option<oneshot::Sender<()>> {
    match command {
        Command::Put {
            kind,
            key,
            content,
            content_type,
            reply,
        } => {
            let _ = reply.send(store.put(kind, &key, content, &content_type).await);
        }
        Command::Get { kind, key, reply } => {
            let _ = reply.send(store.get(kind, &key).await);
        }
        Command::Lookup { kind, key, reply } => {
            let _ = reply.send(store.lookup(kind, &key).await);
        }
        Command::Delete { kind, key, reply } => {
            let _ = reply.send(store.delete(kind, &key).await);
        }
        Command::ListMeta { kind, reply } => {
            let _ = reply.send(store.list_meta(kind));
        }
        Command::SizeOf { kind, reply } => {
            let _ = reply.send(store.size_of(kind));
        }
        Command::Policy { kind, reply } => {
            let _ = reply.send(store.policy(kind));
        }
        Command::Clear { kind, reply } => {
            let _ = reply.send(store.clear(kind).await);
        }
        Command::ClearAll { reply } => {
            let _ = reply.send(store.clear_all().await);
        }
        Command::Invalidate { pattern, reply } => {
            let _ = reply.send(store.invalidate(&pattern).await);
        }
        Command::Sweep { reply } => {
            let _ = reply.send(store.sweep().await);
        }
        Command::Status { kind, reply } => {
            let _ = reply.send(store.status(kind));
        }
        Command::Stats { reply } => {
            let _ = reply.send(store.stats());
        }
        Command::Shutdown { reply } => return Some(reply),
    }
    None
}
