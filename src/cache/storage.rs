//! Storage backend trait and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheMeta, PartitionId};
use crate::error::StorageError;

/// Persistence underneath the cache store.
///
/// A `CacheEntry` is written and removed as one record: implementations must
/// never leave metadata without content or content without metadata.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Partitions that currently exist in storage.
    async fn partitions(&self) -> Result<Vec<PartitionId>, StorageError>;

    /// Metadata of every entry in a partition, without content.
    async fn load_index(&self, partition: &PartitionId) -> Result<Vec<CacheMeta>, StorageError>;

    async fn write(&self, partition: &PartitionId, entry: &CacheEntry) -> Result<(), StorageError>;

    async fn read(&self, partition: &PartitionId, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, partition: &PartitionId, key: &str) -> Result<(), StorageError>;

    /// Persist access statistics (last access time, access count).
    async fn save_index(&self, partition: &PartitionId, metas: &[CacheMeta]) -> Result<(), StorageError>;

    async fn drop_partition(&self, partition: &PartitionId) -> Result<(), StorageError>;
}

/// Storage kept entirely in process memory.
///
/// An optional quota makes writes fail with `QuotaExceeded` once the stored
/// bytes would pass it, mirroring a browser-style storage quota.
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<PartitionId, HashMap<String, CacheEntry>>>,
    quota: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

/// Bytes held across all partitions, leaving out the entry a write replaces.
fn stored_bytes(partitions: &HashMap<PartitionId, HashMap<String, CacheEntry>>, replacing: (&PartitionId, &str)) -> u64 {
    partitions
        .iter()
        .flat_map(|(pid, entries)| {
            entries
                .values()
                .filter(move |e| !(pid == replacing.0 && e.meta.key == replacing.1))
        })
        .map(|e| e.meta.size)
        .sum()
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn partitions(&self) -> Result<Vec<PartitionId>, StorageError> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn load_index(&self, partition: &PartitionId) -> Result<Vec<CacheMeta>, StorageError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .map(|entries| entries.values().map(|e| e.meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn write(&self, partition: &PartitionId, entry: &CacheEntry) -> Result<(), StorageError> {
        let mut partitions = self.partitions.write().await;
        if let Some(quota) = self.quota {
            let used = stored_bytes(&partitions, (partition, entry.meta.key.as_str()));
            if used.saturating_add(entry.meta.size) > quota {
                return Err(StorageError::QuotaExceeded(format!(
                    "{} bytes stored, {} more requested, quota {}",
                    used, entry.meta.size, quota
                )));
            }
        }

        partitions
            .entry(partition.clone())
            .or_default()
            .insert(entry.meta.key.clone(), entry.clone());
        Ok(())
    }

    async fn read(&self, partition: &PartitionId, key: &str) -> Result<Option<Bytes>, StorageError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .and_then(|entries| entries.get(key))
            .map(|e| e.content.clone()))
    }

    async fn remove(&self, partition: &PartitionId, key: &str) -> Result<(), StorageError> {
        let mut partitions = self.partitions.write().await;
        if let Some(entries) = partitions.get_mut(partition) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn save_index(&self, partition: &PartitionId, metas: &[CacheMeta]) -> Result<(), StorageError> {
        let mut partitions = self.partitions.write().await;
        if let Some(entries) = partitions.get_mut(partition) {
            for meta in metas {
                if let Some(entry) = entries.get_mut(&meta.key) {
                    entry.meta.last_accessed_at = meta.last_accessed_at;
                    entry.meta.access_count = meta.access_count;
                }
            }
        }
        Ok(())
    }

    async fn drop_partition(&self, partition: &PartitionId) -> Result<(), StorageError> {
        self.partitions.write().await.remove(partition);
        Ok(())
    }
}
