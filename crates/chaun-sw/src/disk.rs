//! Persistent cache storage: one JSON file per store.

use std::path::{Path, PathBuf};

use chaun_core::config::is_safe_store_name;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheBackend, CacheEntry, MemoryCacheStorage, RequestKey};
use crate::{ServiceWorkerError, SwResult};

const STORE_EXTENSION: &str = "json";

#[derive(Deserialize)]
struct StoreFile {
    name: String,
    entries: Vec<CacheEntry>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    name: &'a str,
    entries: Vec<&'a CacheEntry>,
}

/// Cache storage that survives restarts.
///
/// Every store is mirrored in memory and written through to
/// `<root>/<name>.json`. The file is written before the mirror changes, so
/// a failed write leaves both at their previous contents.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    inner: MemoryCacheStorage,
    write_lock: Mutex<()>,
}

impl DiskCacheStorage {
    /// Open (or create) the storage directory and load every store in it.
    pub async fn open(root: impl Into<PathBuf>) -> SwResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let inner = MemoryCacheStorage::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        let mut loaded = 0usize;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            match read_store(&path).await {
                Ok(cache) => {
                    inner.insert_cache(cache).await;
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache store"),
            }
        }

        info!(root = %root.display(), stores = loaded, "Disk cache storage opened");

        Ok(Self {
            root,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> SwResult<PathBuf> {
        if !is_safe_store_name(name) {
            return Err(ServiceWorkerError::CacheError(format!(
                "invalid cache store name '{}'",
                name
            )));
        }
        Ok(self.root.join(format!("{}.{}", name, STORE_EXTENSION)))
    }

    async fn open_store(&self, name: &str) -> SwResult<()> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;
        if self.inner.has(name).await? {
            return Ok(());
        }
        write_store(&path, &encode_store(name, None, &[])?).await?;
        self.inner.open(name).await
    }

    async fn delete_store(&self, name: &str) -> SwResult<bool> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(self.inner.delete(name).await? || removed)
    }

    /// One file write per batch, then the mirror.
    async fn store(&self, name: &str, entries: Vec<(RequestKey, CacheEntry)>) -> SwResult<()> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;
        let data = self
            .inner
            .with_store(name, |current| encode_store(name, current, &entries))
            .await?;
        write_store(&path, &data).await?;
        debug!(store = name, path = %path.display(), written = entries.len(), "Cache store persisted");
        // The mirror has no quota, so this cannot fail after the file landed.
        self.inner.put_all(name, entries).await
    }
}

/// Serialize `current` with `batch` applied, without touching `current`.
fn encode_store(
    name: &str,
    current: Option<&Cache>,
    batch: &[(RequestKey, CacheEntry)],
) -> SwResult<Vec<u8>> {
    let mut incoming: HashMap<&RequestKey, &CacheEntry> = HashMap::new();
    for (key, entry) in batch {
        incoming.insert(key, entry);
    }

    let mut entries: Vec<&CacheEntry> = current
        .into_iter()
        .flat_map(Cache::iter)
        .filter(|(key, _)| !incoming.contains_key(*key))
        .map(|(_, entry)| entry)
        .collect();
    entries.extend(incoming.into_values());

    serde_json::to_vec(&StoreFileRef { name, entries })
        .map_err(|e| ServiceWorkerError::Storage(e.to_string()))
}

async fn write_store(path: &Path, data: &[u8]) -> SwResult<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_store(path: &Path) -> SwResult<Cache> {
    let data = tokio::fs::read(path).await?;
    let file: StoreFile =
        serde_json::from_slice(&data).map_err(|e| ServiceWorkerError::Storage(e.to_string()))?;
    if !is_safe_store_name(&file.name) {
        return Err(ServiceWorkerError::Storage(format!(
            "invalid store name '{}'",
            file.name
        )));
    }
    Ok(Cache::from_entries(&file.name, file.entries))
}

impl CacheBackend for DiskCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(self.open_store(name))
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<bool>> {
        self.inner.has(name)
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<bool>> {
        Box::pin(self.delete_store(name))
    }

    fn keys(&self) -> BoxFuture<'_, SwResult<Vec<String>>> {
        self.inner.keys()
    }

    fn match_request<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, SwResult<Option<CacheEntry>>> {
        self.inner.match_request(name, key)
    }

    fn put<'a>(
        &'a self,
        name: &'a str,
        key: RequestKey,
        entry: CacheEntry,
    ) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(self.store(name, vec![(key, entry)]))
    }

    fn put_all<'a>(
        &'a self,
        name: &'a str,
        entries: Vec<(RequestKey, CacheEntry)>,
    ) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(self.store(name, entries))
    }

    fn entry_count<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<usize>> {
        self.inner.entry_count(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn entry(u: &str) -> (RequestKey, CacheEntry) {
        let key = RequestKey::get(&Url::parse(u).unwrap());
        let entry = CacheEntry {
            url: u.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: Vec::new(),
            body: vec![0x67, 0x6c, 0x54, 0x46],
            cached_at: 1,
        };
        (key, entry)
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (key, e) = entry("https://cdn.example.com/B5entry.glb");

        {
            let storage = DiskCacheStorage::open(dir.path()).await.unwrap();
            storage.put("app-cache-v1", key.clone(), e.clone()).await.unwrap();
        }

        let storage = DiskCacheStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["app-cache-v1"]);
        let found = storage.match_request("app-cache-v1", &key).await.unwrap();
        assert_eq!(found, Some(e));
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::open(dir.path()).await.unwrap();

        storage.open("app-cache-v1").await.unwrap();
        assert!(dir.path().join("app-cache-v1.json").exists());

        assert!(storage.delete("app-cache-v1").await.unwrap());
        assert!(!dir.path().join("app-cache-v1.json").exists());
        assert!(!storage.delete("app-cache-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unsafe_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::open(dir.path()).await.unwrap();

        let result = storage.open("../escape").await;
        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
    }

    #[tokio::test]
    async fn test_corrupt_store_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();

        let storage = DiskCacheStorage::open(dir.path()).await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("caches");
        let storage = DiskCacheStorage::open(&root).await.unwrap();
        storage.open("app-cache-v1").await.unwrap();

        // Nothing can be written under a root that is now a plain file.
        std::fs::remove_dir_all(&root).unwrap();
        std::fs::write(&root, b"").unwrap();

        let (key, e) = entry("https://cdn.example.com/B5sitting.glb");
        assert!(storage.put("app-cache-v1", key.clone(), e).await.is_err());
        assert!(storage.match_request("app-cache-v1", &key).await.unwrap().is_none());
        assert_eq!(storage.entry_count("app-cache-v1").await.unwrap(), 0);

        assert!(storage.open("app-cache-v2").await.is_err());
        assert!(!storage.has("app-cache-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::open(dir.path()).await.unwrap();
        storage.open("app-cache-v1").await.unwrap();

        // A non-empty directory where the store file belongs cannot be unlinked.
        let path = dir.path().join("app-cache-v1.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("pinned"), b"").unwrap();

        assert!(storage.delete("app-cache-v1").await.is_err());
        assert_eq!(storage.keys().await.unwrap(), vec!["app-cache-v1"]);
    }

    #[tokio::test]
    async fn test_put_all_written_in_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let (a_key, a) = entry("https://cdn.example.com/B5entry.glb");
        let (b_key, b) = entry("https://cdn.example.com/B5sitting.glb");

        {
            let storage = DiskCacheStorage::open(dir.path()).await.unwrap();
            storage.put("app-cache-v1", a_key.clone(), a.clone()).await.unwrap();
            let mut replacement = a.clone();
            replacement.body = b"glTF2".to_vec();
            storage
                .put_all(
                    "app-cache-v1",
                    vec![(a_key.clone(), replacement), (b_key.clone(), b.clone())],
                )
                .await
                .unwrap();
        }

        let storage = DiskCacheStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.entry_count("app-cache-v1").await.unwrap(), 2);
        let found = storage.match_request("app-cache-v1", &a_key).await.unwrap().unwrap();
        assert_eq!(found.body, b"glTF2");
        assert_eq!(storage.match_request("app-cache-v1", &b_key).await.unwrap(), Some(b));
    }
}
