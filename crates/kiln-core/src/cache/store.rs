//! Cache storage backends

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{LoaderError, LoaderResult};

/// Metadata stored alongside a cached payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    /// Stored payload size in bytes
    pub size: u64,
    /// Size of the module binary before compression
    pub original_size: u64,
    /// Write time, unix millis
    pub stored_at: i64,
    pub compressed: bool,
}

impl EntryMetadata {
    pub fn stored_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.stored_at)
            .single()
            .unwrap_or_default()
    }
}

/// A cached payload with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub metadata: EntryMetadata,
    pub data: Vec<u8>,
}

impl CacheEntry {
    /// New entry stamped with the current time
    pub fn new(key: &str, data: Vec<u8>, original_size: u64, compressed: bool) -> Self {
        Self {
            metadata: EntryMetadata {
                key: key.to_string(),
                size: data.len() as u64,
                original_size,
                stored_at: Utc::now().timestamp_millis(),
                compressed,
            },
            data,
        }
    }

    pub fn with_stored_at(mut self, stored_at: DateTime<Utc>) -> Self {
        self.metadata.stored_at = stored_at.timestamp_millis();
        self
    }
}

/// Persistent key/value storage for module payloads
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend name, for diagnostics
    fn name(&self) -> &'static str;

    async fn read(&self, key: &str) -> LoaderResult<Option<CacheEntry>>;

    /// Metadata only, without reading the payload
    async fn metadata(&self, key: &str) -> LoaderResult<Option<EntryMetadata>>;

    async fn write(&self, entry: CacheEntry) -> LoaderResult<()>;

    async fn delete(&self, key: &str) -> LoaderResult<()>;

    async fn clear(&self) -> LoaderResult<()>;

    /// Metadata of every stored entry
    async fn list(&self) -> LoaderResult<Vec<EntryMetadata>>;
}

/// Payload file plus a JSON metadata sidecar per key
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> LoaderResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            LoaderError::Io(format!("failed to create cache directory {:?}: {}", dir, e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Readable file name for `key`; the hash suffix keeps keys that
    /// sanitize to the same text apart
    fn file_stem(key: &str) -> String {
        let readable: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' | '_' => c,
                _ => '_',
            })
            .collect();
        let hash = blake3::hash(key.as_bytes()).to_hex();
        format!("{}-{}", readable, &hash.as_str()[..16])
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", Self::file_stem(key)))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(key)))
    }

    async fn read_metadata_file(path: &Path) -> LoaderResult<Option<EntryMetadata>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LoaderError::Io(format!("corrupt cache metadata {:?}: {}", path, e)))
    }

    async fn remove_if_exists(path: &Path) -> LoaderResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn read(&self, key: &str) -> LoaderResult<Option<CacheEntry>> {
        let Some(metadata) = self.metadata(key).await? else {
            return Ok(None);
        };

        let data = match tokio::fs::read(self.payload_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() as u64 != metadata.size {
            debug!(
                "Cache payload size mismatch for {}: expected {}, got {}",
                key,
                metadata.size,
                data.len()
            );
            return Ok(None);
        }

        Ok(Some(CacheEntry { metadata, data }))
    }

    async fn metadata(&self, key: &str) -> LoaderResult<Option<EntryMetadata>> {
        Self::read_metadata_file(&self.metadata_path(key)).await
    }

    async fn write(&self, entry: CacheEntry) -> LoaderResult<()> {
        let key = entry.metadata.key.clone();
        let sidecar = serde_json::to_vec_pretty(&entry.metadata)
            .map_err(|e| LoaderError::Io(format!("failed to serialize cache metadata: {}", e)))?;

        // Payload first; an entry is visible only once its sidecar exists.
        tokio::fs::write(self.payload_path(&key), &entry.data).await?;
        tokio::fs::write(self.metadata_path(&key), sidecar).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> LoaderResult<()> {
        Self::remove_if_exists(&self.metadata_path(key)).await?;
        Self::remove_if_exists(&self.payload_path(key)).await
    }

    async fn clear(&self) -> LoaderResult<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .extension()
                .is_some_and(|ext| ext == "bin" || ext == "json")
            {
                Self::remove_if_exists(&path).await?;
            }
        }
        Ok(())
    }

    async fn list(&self) -> LoaderResult<Vec<EntryMetadata>> {
        let mut result = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Ok(Some(metadata)) = Self::read_metadata_file(&path).await
            {
                result.push(metadata);
            }
        }
        Ok(result)
    }
}

/// Process-lifetime in-memory store
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, key: &str) -> LoaderResult<Option<CacheEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn metadata(&self, key: &str) -> LoaderResult<Option<EntryMetadata>> {
        Ok(self.entries.lock().get(key).map(|e| e.metadata.clone()))
    }

    async fn write(&self, entry: CacheEntry) -> LoaderResult<()> {
        self.entries
            .lock()
            .insert(entry.metadata.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> LoaderResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> LoaderResult<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn list(&self) -> LoaderResult<Vec<EntryMetadata>> {
        Ok(self
            .entries
            .lock()
            .values()
            .map(|e| e.metadata.clone())
            .collect())
    }
}

/// Store that keeps nothing; every read misses
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCacheStore;

#[async_trait]
impl CacheStore for NullCacheStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn read(&self, _key: &str) -> LoaderResult<Option<CacheEntry>> {
        Ok(None)
    }

    async fn metadata(&self, _key: &str) -> LoaderResult<Option<EntryMetadata>> {
        Ok(None)
    }

    async fn write(&self, _entry: CacheEntry) -> LoaderResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> LoaderResult<()> {
        Ok(())
    }

    async fn clear(&self) -> LoaderResult<()> {
        Ok(())
    }

    async fn list(&self) -> LoaderResult<Vec<EntryMetadata>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::open(dir.path().join("modules")).await.unwrap();

        let key = "kiln-wasm-wasm/crypto.wasm-v3";
        store
            .write(CacheEntry::new(key, vec![0, 97, 115, 109], 4, false))
            .await
            .unwrap();

        let entry = store.read(key).await.unwrap().unwrap();
        assert_eq!(entry.data, vec![0, 97, 115, 109]);
        assert_eq!(entry.metadata.key, key);
        assert!(!entry.metadata.compressed);

        // slashes never escape the cache directory
        let payload = store.payload_path(key);
        assert_eq!(payload.parent(), Some(dir.path().join("modules").as_path()));
        assert!(payload.exists());
        assert!(
            payload
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("kiln-wasm-wasm_crypto.wasm-v3-"))
        );

        assert_eq!(store.list().await.unwrap().len(), 1);
        store.delete(key).await.unwrap();
        assert!(store.read(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_truncated_payload_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::open(dir.path()).await.unwrap();
        store
            .write(CacheEntry::new("k", vec![1, 2, 3], 3, false))
            .await
            .unwrap();
        std::fs::write(store.payload_path("k"), [1u8]).unwrap();

        assert!(store.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_keys_that_sanitize_alike_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::open(dir.path()).await.unwrap();
        let nested = "kiln-wasm-wasm/crypto.wasm-v1";
        let flat = "kiln-wasm-wasm_crypto.wasm-v1";

        store
            .write(CacheEntry::new(nested, vec![1], 1, false))
            .await
            .unwrap();
        store
            .write(CacheEntry::new(flat, vec![2, 2], 2, false))
            .await
            .unwrap();

        assert_ne!(store.payload_path(nested), store.payload_path(flat));
        assert_eq!(store.read(nested).await.unwrap().unwrap().data, vec![1]);
        assert_eq!(store.read(flat).await.unwrap().unwrap().data, vec![2, 2]);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fs_store_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::open(dir.path()).await.unwrap();
        for key in ["a", "b"] {
            store
                .write(CacheEntry::new(key, vec![7], 1, false))
                .await
                .unwrap();
        }
        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_null_store_always_misses() {
        let store = NullCacheStore;
        store
            .write(CacheEntry::new("k", vec![1], 1, false))
            .await
            .unwrap();
        assert!(store.read("k").await.unwrap().is_none());
        assert_eq!(store.name(), "disabled");
    }
}
