//! Partitioned cache store with size and age bounds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    CacheEntry, CacheMeta, CacheStatus, CachedContent, EntryStore, EvictionPolicy, Lookup, MemoryCache,
    PartitionId, PartitionKind, PartitionPolicy, PartitionSpec, PutOutcome,
};
use crate::error::StorageError;

struct Partition {
    id: PartitionId,
    policy: PartitionPolicy,
    index: HashMap<String, CacheMeta>,
    used: u64,
    /// Access stats changed since the last flush.
    dirty: bool,
}

impl Partition {
    fn new(spec: &PartitionSpec) -> Self {
        Self {
            id: spec.id.clone(),
            policy: spec.policy,
            index: HashMap::new(),
            used: 0,
            dirty: false,
        }
    }

    fn insert(&mut self, meta: CacheMeta) {
        self.used = self.used.saturating_add(meta.size);
        if let Some(old) = self.index.insert(meta.key.clone(), meta) {
            self.used = self.used.saturating_sub(old.size);
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheMeta> {
        let removed = self.index.remove(key)?;
        self.used = self.used.saturating_sub(removed.size);
        Some(removed)
    }

    fn metas(&self) -> Vec<CacheMeta> {
        self.index.values().cloned().collect()
    }
}

/// Running counters across all partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub stores: u64,
    pub rejected: u64,
    pub failed_writes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Owns every partition's index and is the only write path into storage.
///
/// The store is driven by a single task (see `CacheHandle`), so it needs no
/// internal locking.
pub struct CacheStore {
    backend: Arc<dyn EntryStore>,
    partitions: HashMap<PartitionKind, Partition>,
    memory: MemoryCache,
    eviction: EvictionPolicy,
    stats: CacheStats,
}

impl CacheStore {
    /// Open the store: delete superseded partitions, then load the current ones.
    ///
    /// A partition that fails to load starts empty rather than failing startup.
    pub async fn open(
        backend: Arc<dyn EntryStore>,
        specs: Vec<PartitionSpec>,
        memory_tier_size: usize,
    ) -> Result<Self, StorageError> {
        let current: HashSet<PartitionId> = specs.iter().map(|s| s.id.clone()).collect();
        for existing in backend.partitions().await? {
            if !current.contains(&existing) {
                info!(partition = %existing, "deleting superseded cache partition");
                if let Err(e) = backend.drop_partition(&existing).await {
                    warn!(partition = %existing, error = %e, "failed to delete superseded partition");
                }
            }
        }

        let mut partitions = HashMap::new();
        for spec in &specs {
            let mut partition = Partition::new(spec);
            match backend.load_index(&spec.id).await {
                Ok(metas) => {
                    for meta in metas {
                        partition.insert(meta);
                    }
                }
                Err(e) => {
                    warn!(partition = %spec.id, error = %e, "failed to load cache partition, starting empty");
                }
            }
            info!(
                partition = %spec.id,
                entries = partition.index.len(),
                used = partition.used,
                budget = spec.policy.budget_bytes,
                "cache partition ready"
            );
            partitions.insert(spec.kind, partition);
        }

        Ok(Self {
            backend,
            partitions,
            memory: MemoryCache::new(memory_tier_size),
            eviction: EvictionPolicy::default(),
            stats: CacheStats::default(),
        })
    }

    pub fn with_eviction_policy(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn policy(&self, kind: PartitionKind) -> Option<PartitionPolicy> {
        self.partitions.get(&kind).map(|p| p.policy)
    }

    /// Store content. Never fails: storage errors degrade to "not cached".
    pub async fn put(&mut self, kind: PartitionKind, key: &str, content: Bytes, content_type: &str) -> PutOutcome {
        let Some(partition) = self.partitions.get(&kind) else {
            return PutOutcome::Failed;
        };
        let size = content.len() as u64;
        if !partition.policy.admits(size) {
            debug!(partition = %partition.id, key, size, "content too large for partition, not caching");
            self.stats.rejected += 1;
            return PutOutcome::TooLarge;
        }

        let pid = partition.id.clone();
        let entry = CacheEntry::new(key, content, content_type, Utc::now());
        if let Err(e) = self.backend.write(&pid, &entry).await {
            warn!(partition = %pid, key, error = %e, "cache write failed");
            self.stats.failed_writes += 1;
            return PutOutcome::Failed;
        }

        self.memory.put(kind, key, entry.content.clone());
        if let Some(partition) = self.partitions.get_mut(&kind) {
            partition.insert(entry.meta);
        }
        self.stats.stores += 1;

        // the write above has landed; eviction only ever removes other entries
        self.enforce_budget(kind, Some(key)).await;
        PutOutcome::Stored
    }

    /// Read content; expired entries are deleted and reported as a miss.
    pub async fn get(&mut self, kind: PartitionKind, key: &str) -> Option<CachedContent> {
        match self.read_entry(kind, key).await {
            Lookup::Fresh(content) => Some(content),
            Lookup::Stale(_) => {
                self.stats.misses += 1;
                self.stats.expirations += 1;
                if let Err(e) = self.delete(kind, key).await {
                    warn!(key, error = %e, "failed to delete expired entry");
                }
                None
            }
            Lookup::Miss => None,
        }
    }

    /// Read content without evicting it when expired.
    pub async fn lookup(&mut self, kind: PartitionKind, key: &str) -> Lookup {
        let found = self.read_entry(kind, key).await;
        if matches!(found, Lookup::Stale(_)) {
            self.stats.stale_hits += 1;
        }
        found
    }

    async fn read_entry(&mut self, kind: PartitionKind, key: &str) -> Lookup {
        let Some(partition) = self.partitions.get(&kind) else {
            return Lookup::Miss;
        };
        let Some(meta) = partition.index.get(key) else {
            self.stats.misses += 1;
            return Lookup::Miss;
        };
        let expired = partition.policy.is_expired(meta.cached_at, Utc::now());
        let pid = partition.id.clone();

        let content = match self.memory.get(kind, key) {
            Some(content) => content,
            None => match self.backend.read(&pid, key).await {
                Ok(Some(content)) => {
                    self.memory.put(kind, key, content.clone());
                    content
                }
                Ok(None) => {
                    // index and storage disagree; drop the orphaned metadata
                    warn!(partition = %pid, key, "cache metadata without content, dropping");
                    if let Some(partition) = self.partitions.get_mut(&kind) {
                        partition.remove(key);
                    }
                    self.stats.misses += 1;
                    return Lookup::Miss;
                }
                Err(e) => {
                    warn!(partition = %pid, key, error = %e, "cache read failed");
                    self.stats.misses += 1;
                    return Lookup::Miss;
                }
            },
        };

        if expired {
            let meta = self.partitions[&kind].index[key].clone();
            return Lookup::Stale(CachedContent { content, meta });
        }

        let Some(partition) = self.partitions.get_mut(&kind) else {
            return Lookup::Miss;
        };
        let Some(meta) = partition.index.get_mut(key) else {
            return Lookup::Miss;
        };
        meta.last_accessed_at = Utc::now();
        meta.access_count += 1;
        partition.dirty = true;
        self.stats.hits += 1;
        Lookup::Fresh(CachedContent {
            content,
            meta: meta.clone(),
        })
    }

    /// Delete one entry. Returns whether it existed.
    pub async fn delete(&mut self, kind: PartitionKind, key: &str) -> Result<bool, StorageError> {
        let Some(partition) = self.partitions.get(&kind) else {
            return Ok(false);
        };
        if !partition.index.contains_key(key) {
            return Ok(false);
        }
        let pid = partition.id.clone();
        self.backend.remove(&pid, key).await?;
        self.memory.remove(kind, key);
        if let Some(partition) = self.partitions.get_mut(&kind) {
            partition.remove(key);
        }
        Ok(true)
    }

    pub fn list_meta(&self, kind: PartitionKind) -> Vec<CacheMeta> {
        let mut metas = self.partitions.get(&kind).map(Partition::metas).unwrap_or_default();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        metas
    }

    pub fn size_of(&self, kind: PartitionKind) -> u64 {
        self.partitions.get(&kind).map(|p| p.used).unwrap_or(0)
    }

    pub fn contains(&self, kind: PartitionKind, key: &str) -> bool {
        self.partitions
            .get(&kind)
            .map(|p| p.index.contains_key(key))
            .unwrap_or(false)
    }

    /// Delete every entry of one partition.
    pub async fn clear(&mut self, kind: PartitionKind) -> Result<(), StorageError> {
        let Some(partition) = self.partitions.get_mut(&kind) else {
            return Ok(());
        };
        self.backend.drop_partition(&partition.id).await?;
        partition.index.clear();
        partition.used = 0;
        partition.dirty = false;
        self.memory.clear_partition(kind);
        info!(partition = %partition.id, "cache partition cleared");
        Ok(())
    }

    pub async fn clear_all(&mut self) -> Result<(), StorageError> {
        for kind in PartitionKind::ALL {
            self.clear(kind).await?;
        }
        Ok(())
    }

    /// Delete every entry, in any partition, whose key matches `pattern`.
    pub async fn invalidate(&mut self, pattern: &Regex) -> usize {
        let mut removed = 0;
        for kind in PartitionKind::ALL {
            let keys: Vec<String> = match self.partitions.get(&kind) {
                Some(p) => p.index.keys().filter(|k| pattern.is_match(k)).cloned().collect(),
                None => continue,
            };
            for key in keys {
                match self.delete(kind, &key).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key, error = %e, "failed to invalidate cache entry"),
                }
            }
        }
        info!(pattern = pattern.as_str(), removed, "cache invalidated");
        removed
    }

    /// Delete entries past their partition TTL, then retry any eviction a
    /// failed delete left over. Returns the number of expired entries removed.
    pub async fn sweep(&mut self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for kind in PartitionKind::ALL {
            let expired = match self.partitions.get(&kind) {
                Some(p) => self.eviction.select_expired(&p.metas(), &p.policy, now),
                None => continue,
            };
            for key in expired {
                match self.delete(kind, &key).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key, error = %e, "failed to delete expired entry"),
                }
            }
            self.enforce_budget(kind, None).await;
        }
        if removed > 0 {
            self.stats.expirations += removed as u64;
            info!(removed, "expired cache entries swept");
        }
        removed
    }

    async fn enforce_budget(&mut self, kind: PartitionKind, protect: Option<&str>) {
        let victims = match self.partitions.get(&kind) {
            Some(p) if p.used > p.policy.budget_bytes => {
                self.eviction.select_victims(&p.metas(), p.policy.budget_bytes, protect)
            }
            _ => return,
        };
        self.evict(kind, victims).await;
    }

    /// Delete `victims`, counting only entries that were actually removed.
    async fn evict(&mut self, kind: PartitionKind, victims: Vec<String>) -> usize {
        let mut evicted = 0;
        for key in victims {
            match self.delete(kind, &key).await {
                Ok(true) => {
                    evicted += 1;
                    debug!(partition = kind.as_str(), key, "evicted");
                }
                Ok(false) => debug!(partition = kind.as_str(), key, "eviction victim already gone"),
                // left in the index, so the next pass picks it up again
                Err(e) => warn!(partition = kind.as_str(), key, error = %e, "eviction delete failed"),
            }
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    /// Persist access statistics of partitions touched since the last flush.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        for partition in self.partitions.values_mut() {
            if !partition.dirty {
                continue;
            }
            let metas = partition.metas();
            self.backend.save_index(&partition.id, &metas).await?;
            partition.dirty = false;
        }
        Ok(())
    }

    pub fn status(&self, kind: PartitionKind) -> CacheStatus {
        let (count, used, budget) = match self.partitions.get(&kind) {
            Some(p) => (p.index.len(), p.used, p.policy.budget_bytes),
            None => (0, 0, 0),
        };
        let usage_percentage = if budget > 0 {
            (used as f64 / budget as f64) * 100.0
        } else {
            0.0
        };
        CacheStatus {
            video_count: count,
            total_size: used,
            max_size: budget,
            usage_percentage,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}
