use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{CacheEntry, CacheMeta, EntryStore, PartitionId};
use crate::error::StorageError;

const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";
const INDEX_FILE: &str = "index.json";
const MAX_HEADER_LEN: u32 = 64 * 1024;

/// On-disk storage: one directory per partition, one file per entry.
///
/// Entry file layout: `u32` big-endian header length, JSON `CacheMeta`
/// header, then the raw content. Files are written to a temp name and renamed
/// into place so a crash never leaves a half-written record behind.
pub struct DiskCache {
    cache_dir: PathBuf,
}

impl DiskCache {
    pub async fn new(cache_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).await?;
        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn partition_dir(&self, partition: &PartitionId) -> PathBuf {
        self.cache_dir.join(partition.to_string())
    }

    fn get_cache_path(&self, partition: &PartitionId, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = hex::encode(hasher.finalize());
        self.partition_dir(partition).join(hash).with_extension(ENTRY_EXT)
    }

    async fn read_header(path: &Path) -> Result<CacheMeta, StorageError> {
        let mut file = fs::File::open(path).await?;
        let len = file.read_u32().await?;
        if len > MAX_HEADER_LEN {
            return Err(StorageError::Corrupt {
                key: path.display().to_string(),
                reason: format!("header length {} exceeds limit", len),
            });
        }
        let mut header = vec![0u8; len as usize];
        file.read_exact(&mut header).await?;
        Ok(serde_json::from_slice(&header)?)
    }

    async fn read_index_file(dir: &Path) -> HashMap<String, CacheMeta> {
        let path = dir.join(INDEX_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_slice::<Vec<CacheMeta>>(&raw) {
            Ok(metas) => metas.into_iter().map(|m| (m.key.clone(), m)).collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable cache index");
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl EntryStore for DiskCache {
    async fn partitions(&self) -> Result<Vec<PartitionId>, StorageError> {
        let mut found = Vec::new();
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = item.file_name().to_str().and_then(PartitionId::parse) {
                found.push(id);
            }
        }
        Ok(found)
    }

    async fn load_index(&self, partition: &PartitionId) -> Result<Vec<CacheMeta>, StorageError> {
        let dir = self.partition_dir(partition);
        if fs::metadata(&dir).await.is_err() {
            return Ok(Vec::new());
        }

        let flushed = Self::read_index_file(&dir).await;
        let mut metas = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(item) = entries.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(ENTRY_EXT) => match Self::read_header(&path).await {
                    Ok(mut meta) => {
                        // access stats flushed later win over the write-time header
                        if let Some(saved) = flushed.get(&meta.key) {
                            meta.last_accessed_at = saved.last_accessed_at;
                            meta.access_count = saved.access_count;
                        }
                        metas.push(meta);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "removing unreadable cache entry");
                        let _ = fs::remove_file(&path).await;
                    }
                },
                Some(TMP_EXT) => {
                    let _ = fs::remove_file(&path).await;
                }
                _ => {}
            }
        }
        debug!(partition = %partition, entries = metas.len(), "loaded cache partition");
        Ok(metas)
    }

    async fn write(&self, partition: &PartitionId, entry: &CacheEntry) -> Result<(), StorageError> {
        fs::create_dir_all(self.partition_dir(partition)).await?;

        let header = serde_json::to_vec(&entry.meta)?;
        let mut record = Vec::with_capacity(4 + header.len() + entry.content.len());
        record.extend_from_slice(&(header.len() as u32).to_be_bytes());
        record.extend_from_slice(&header);
        record.extend_from_slice(&entry.content);

        let cache_path = self.get_cache_path(partition, &entry.meta.key);
        let tmp_path = cache_path.with_extension(TMP_EXT);
        fs::write(&tmp_path, &record).await?;
        if let Err(e) = fs::rename(&tmp_path, &cache_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, partition: &PartitionId, key: &str) -> Result<Option<Bytes>, StorageError> {
        let cache_path = self.get_cache_path(partition, key);
        let raw = match fs::read(&cache_path).await {
            Ok(raw) => Bytes::from(raw),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if raw.len() < 4 {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "truncated header".to_string(),
            });
        }
        let header_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        let offset = 4 + header_len;
        if offset > raw.len() {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "header overruns record".to_string(),
            });
        }
        Ok(Some(raw.slice(offset..)))
    }

    async fn remove(&self, partition: &PartitionId, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.get_cache_path(partition, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_index(&self, partition: &PartitionId, metas: &[CacheMeta]) -> Result<(), StorageError> {
        let dir = self.partition_dir(partition);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(INDEX_FILE);
        let tmp = dir.join(format!("{}.{}", INDEX_FILE, TMP_EXT));
        fs::write(&tmp, serde_json::to_vec(metas)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn drop_partition(&self, partition: &PartitionId) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.partition_dir(partition)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_disk_roundtrip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).await.unwrap();
        let pid = PartitionId::new("video", 2);

        let entry = CacheEntry::new(
            "http://cdn/clip_720p.mp4",
            Bytes::from_static(b"0123456789"),
            "video/mp4",
            Utc::now(),
        );
        disk.write(&pid, &entry).await.unwrap();

        let content = disk.read(&pid, "http://cdn/clip_720p.mp4").await.unwrap();
        assert_eq!(content, Some(Bytes::from_static(b"0123456789")));

        let mut touched = entry.meta.clone();
        touched.access_count = 7;
        touched.last_accessed_at = entry.meta.cached_at + Duration::seconds(5);
        disk.save_index(&pid, &[touched.clone()]).await.unwrap();

        let reopened = DiskCache::new(dir.path()).await.unwrap();
        assert_eq!(reopened.partitions().await.unwrap(), vec![pid.clone()]);
        let metas = reopened.load_index(&pid).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].size, 10);
        assert_eq!(metas[0].access_count, 7);
        assert_eq!(metas[0].content_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_disk_remove_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).await.unwrap();
        let pid = PartitionId::new("static", 1);
        let entry = CacheEntry::new("http://x/app.css", Bytes::from_static(b"body{}"), "text/css", Utc::now());

        disk.write(&pid, &entry).await.unwrap();
        disk.remove(&pid, "http://x/app.css").await.unwrap();
        disk.remove(&pid, "http://x/app.css").await.unwrap();
        assert!(disk.read(&pid, "http://x/app.css").await.unwrap().is_none());

        disk.write(&pid, &entry).await.unwrap();
        disk.drop_partition(&pid).await.unwrap();
        assert!(disk.partitions().await.unwrap().is_empty());
        assert!(disk.load_index(&pid).await.unwrap().is_empty());
    }
}
