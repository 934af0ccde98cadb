use bytes::Bytes;
use lru::LruCache;

use super::PartitionKind;

type HotKey = (PartitionKind, String);

/// Byte-bounded in-memory tier sitting in front of the storage backend.
///
/// Blobs larger than a quarter of the tier go straight to the backend so a
/// single video cannot flush everything else out.
pub struct MemoryCache {
    store: LruCache<HotKey, Bytes>,
    max_size: usize,
    current_size: usize,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            store: LruCache::unbounded(),
            max_size,
            current_size: 0,
        }
    }

    pub fn max_item_size(&self) -> usize {
        self.max_size / 4
    }

    pub fn get(&mut self, kind: PartitionKind, key: &str) -> Option<Bytes> {
        self.store.get(&(kind, key.to_string())).cloned()
    }

    pub fn put(&mut self, kind: PartitionKind, key: &str, data: Bytes) {
        self.remove(kind, key);
        if data.len() > self.max_item_size() {
            return;
        }

        self.current_size = self.current_size.saturating_add(data.len());
        while self.current_size > self.max_size {
            match self.store.pop_lru() {
                Some((_, removed)) => {
                    self.current_size = self.current_size.saturating_sub(removed.len());
                }
                None => break,
            }
        }

        self.store.put((kind, key.to_string()), data);
    }

    pub fn remove(&mut self, kind: PartitionKind, key: &str) {
        if let Some(removed) = self.store.pop(&(kind, key.to_string())) {
            self.current_size = self.current_size.saturating_sub(removed.len());
        }
    }

    pub fn clear_partition(&mut self, kind: PartitionKind) {
        let keys: Vec<HotKey> = self
            .store
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(key, _)| key.clone())
            .collect();
        for (k, key) in keys {
            self.remove(k, &key);
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_by_bytes() {
        let mut cache = MemoryCache::new(100);
        cache.put(PartitionKind::Static, "a", Bytes::from(vec![0u8; 20]));
        cache.put(PartitionKind::Static, "b", Bytes::from(vec![0u8; 20]));
        cache.put(PartitionKind::Static, "c", Bytes::from(vec![0u8; 20]));
        cache.put(PartitionKind::Static, "d", Bytes::from(vec![0u8; 20]));
        assert_eq!(cache.current_size(), 80);

        // touch a so b becomes the least recently used
        assert!(cache.get(PartitionKind::Static, "a").is_some());
        cache.put(PartitionKind::Static, "e", Bytes::from(vec![0u8; 25]));
        assert!(cache.current_size() <= 100);
        assert!(cache.get(PartitionKind::Static, "b").is_none());
        assert!(cache.get(PartitionKind::Static, "a").is_some());
    }

    #[test]
    fn test_large_items_bypass() {
        let mut cache = MemoryCache::new(100);
        cache.put(PartitionKind::Video, "big", Bytes::from(vec![0u8; 26]));
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn test_clear_partition_only_touches_that_kind() {
        let mut cache = MemoryCache::new(1000);
        cache.put(PartitionKind::Video, "k", Bytes::from_static(b"video"));
        cache.put(PartitionKind::Api, "k", Bytes::from_static(b"api"));
        cache.clear_partition(PartitionKind::Video);
        assert!(cache.get(PartitionKind::Video, "k").is_none());
        assert_eq!(cache.get(PartitionKind::Api, "k"), Some(Bytes::from_static(b"api")));
        assert_eq!(cache.current_size(), 3);
    }
}
