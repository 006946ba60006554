//! Versioned module payload cache
//!
//! Payloads are keyed by `<prefix>-<path>-v<version>`, with a
//! `-compressed` variant for gzip-compressed entries. Entries older than the
//! retention window are purged when read. Storage failures are logged and
//! swallowed: a broken cache only costs a download.

pub mod store;

pub use store::{CacheEntry, CacheStore, EntryMetadata, FsCacheStore, MemoryCacheStore, NullCacheStore};

use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::descriptor::ModuleDescriptor;

const COMPRESSED_SUFFIX: &str = "-compressed";

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub entries: usize,
    pub total_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache manager
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    prefix: String,
    retention: Duration,
    compress: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            prefix: config.prefix.clone(),
            retention: config.retention(),
            compress: config.compress,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Open the filesystem cache described by `config`.
    ///
    /// Falls back to a store that keeps nothing when caching is disabled or
    /// the directory is unusable; never fails.
    pub async fn open(config: &CacheConfig) -> Self {
        if !config.enabled {
            info!("Module cache disabled");
            return Self::disabled(config);
        }

        let Some(dir) = config.resolved_dir() else {
            warn!("No cache directory available; module cache disabled");
            return Self::disabled(config);
        };

        match FsCacheStore::open(&dir).await {
            Ok(store) => {
                info!("Module cache initialized at: {:?}", dir);
                Self::new(Arc::new(store), config)
            }
            Err(e) => {
                warn!("Module cache unavailable, continuing without it: {}", e);
                Self::disabled(config)
            }
        }
    }

    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()), config)
    }

    pub fn disabled(config: &CacheConfig) -> Self {
        Self::new(Arc::new(NullCacheStore), config)
    }

    pub fn backend(&self) -> &'static str {
        self.store.name()
    }

    /// Version-qualified cache key
    pub fn key(&self, path: &str, version: &str, compressed: bool) -> String {
        format!(
            "{}-{}-v{}{}",
            self.prefix,
            path,
            version,
            if compressed { COMPRESSED_SUFFIX } else { "" }
        )
    }

    fn is_stale(&self, metadata: &EntryMetadata) -> bool {
        let age_ms = Utc::now().timestamp_millis() - metadata.stored_at;
        age_ms >= self.retention.as_millis() as i64
    }

    async fn purge(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!("Failed to delete cache entry {}: {}", key, e);
        }
    }

    /// Cached payload for `path` at `version`, if present and fresh
    pub async fn get(&self, path: &str, version: &str) -> Option<Vec<u8>> {
        for compressed in [true, false] {
            let key = self.key(path, version, compressed);
            let entry = match self.store.read(&key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cache read failed for {}: {}", key, e);
                    continue;
                }
            };

            if self.is_stale(&entry.metadata) {
                debug!("Cache entry {} is stale, purging", key);
                self.purge(&key).await;
                continue;
            }

            let data = if entry.metadata.compressed {
                match decompress(&entry.data) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Cache entry {} failed to decompress: {}", key, e);
                        self.purge(&key).await;
                        continue;
                    }
                }
            } else {
                entry.data
            };

            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit: {} ({} bytes)", key, data.len());
            return Some(data);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss: {}@{}", path, version);
        None
    }

    /// Store a payload. Failures are logged and swallowed.
    pub async fn put(&self, path: &str, version: &str, data: &[u8]) {
        let original_size = data.len() as u64;
        let entry = if self.compress {
            match compress(data) {
                Ok(compressed) => CacheEntry::new(
                    &self.key(path, version, true),
                    compressed,
                    original_size,
                    true,
                ),
                Err(e) => {
                    warn!("Failed to compress {}@{}: {}", path, version, e);
                    CacheEntry::new(&self.key(path, version, false), data.to_vec(), original_size, false)
                }
            }
        } else {
            CacheEntry::new(&self.key(path, version, false), data.to_vec(), original_size, false)
        };

        let key = entry.metadata.key.clone();
        match self.store.write(entry).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Cached {} ({} bytes)", key, original_size);
            }
            Err(e) => warn!("Failed to cache {}: {}", key, e),
        }
    }

    pub async fn get_module(&self, descriptor: &ModuleDescriptor) -> Option<Vec<u8>> {
        self.get(&descriptor.path, &descriptor.version).await
    }

    pub async fn put_module(&self, descriptor: &ModuleDescriptor, data: &[u8]) {
        self.put(&descriptor.path, &descriptor.version, data).await
    }

    /// Size of a fresh cached payload, without counting a hit
    pub async fn peek_size(&self, path: &str, version: &str) -> Option<u64> {
        for compressed in [true, false] {
            let key = self.key(path, version, compressed);
            if let Ok(Some(metadata)) = self.store.metadata(&key).await
                && !self.is_stale(&metadata)
            {
                return Some(metadata.original_size);
            }
        }
        None
    }

    /// Delete both variants of an entry
    pub async fn remove(&self, path: &str, version: &str) {
        for compressed in [true, false] {
            self.purge(&self.key(path, version, compressed)).await;
        }
    }

    /// Delete every entry
    pub async fn clear(&self) {
        match self.store.clear().await {
            Ok(()) => info!("Module cache cleared"),
            Err(e) => warn!("Failed to clear module cache: {}", e),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let (entries, total_size_bytes) = match self.store.list().await {
            Ok(list) => (list.len(), list.iter().map(|m| m.size).sum()),
            Err(e) => {
                warn!("Failed to list cache entries: {}", e);
                (0, 0)
            }
        };

        CacheStats {
            backend: self.backend().to_string(),
            entries,
            total_size_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
