//! Cache stores and the storage backend seam.

use bytes::Bytes;
use chaun_net::{Request, RequestId, Response};
use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{ServiceWorkerError, SwResult};

// ==================== Keys ====================

/// Cache key: exact method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

// ==================== Entries ====================

/// A cached response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in received order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under `key`, consuming it.
    ///
    /// Partial content is refused, as the platform Cache API does.
    pub fn from_response(key: &RequestKey, response: Response) -> SwResult<Self> {
        if response.status == StatusCode::PARTIAL_CONTENT {
            return Err(ServiceWorkerError::CacheError(format!(
                "partial response for {} cannot be cached",
                key.url
            )));
        }

        let status = response.status.as_u16();
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status,
            headers,
            body: response.into_bytes().to_vec(),
            cached_at: now_millis(),
        })
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Approximate storage footprint in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
            + self.url.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Rebuild a response served from the cache.
    pub fn to_response(&self) -> SwResult<Response> {
        let url = Url::parse(&self.url).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response::new(
            RequestId::new(),
            url,
            status,
            headers,
            Bytes::copy_from_slice(&self.body),
        )
        .cached())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A single named cache store.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Rebuild a cache from stored entries.
    pub fn from_entries(name: &str, entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut cache = Self::new(name);
        for entry in entries {
            cache.put(entry.key(), entry);
        }
        cache
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace an entry, returning the replaced one.
    pub fn put(&mut self, key: RequestKey, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(key, entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RequestKey, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

// ==================== Backend ====================

/// Cache storage seen by the lifecycle handlers.
///
/// Operations on one backend are atomic per key, and `put_all` is atomic
/// for the whole batch. Both implicitly create the named store.
pub trait CacheBackend: Send + Sync {
    /// Open a store, creating it if missing.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<()>>;

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<bool>>;

    /// Delete a store. Returns whether it existed.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<bool>>;

    /// Names of every store, sorted.
    fn keys(&self) -> BoxFuture<'_, SwResult<Vec<String>>>;

    fn match_request<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, SwResult<Option<CacheEntry>>>;

    fn put<'a>(
        &'a self,
        name: &'a str,
        key: RequestKey,
        entry: CacheEntry,
    ) -> BoxFuture<'a, SwResult<()>>;

    /// Store every entry or none of them.
    ///
    /// A later entry with the same key replaces an earlier one.
    fn put_all<'a>(
        &'a self,
        name: &'a str,
        entries: Vec<(RequestKey, CacheEntry)>,
    ) -> BoxFuture<'a, SwResult<()>>;

    /// Number of entries in a store (0 when missing).
    fn entry_count<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<usize>>;
}

// ==================== Memory Storage ====================

/// In-memory cache storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
    quota: Option<usize>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that refuses writes past `bytes` in total.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            quota: Some(bytes),
        }
    }

    /// Total bytes used across all stores.
    pub async fn usage(&self) -> usize {
        self.caches.read().await.values().map(Cache::size).sum()
    }

    /// Run `f` against the named store under the read lock.
    pub(crate) async fn with_store<R>(&self, name: &str, f: impl FnOnce(Option<&Cache>) -> R) -> R {
        f(self.caches.read().await.get(name))
    }

    pub(crate) async fn insert_cache(&self, cache: Cache) {
        self.caches.write().await.insert(cache.name.clone(), cache);
    }

    async fn open_store(&self, name: &str) -> SwResult<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn delete_store(&self, name: &str) -> SwResult<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn store_names(&self) -> SwResult<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn lookup(&self, name: &str, key: &RequestKey) -> SwResult<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned())
    }

    async fn store(&self, name: &str, entries: Vec<(RequestKey, CacheEntry)>) -> SwResult<()> {
        let mut caches = self.caches.write().await;

        if let Some(quota) = self.quota {
            let used: usize = caches.values().map(Cache::size).sum();
            let (replaced, added) = batch_footprint(caches.get(name), &entries);
            let needed = used - replaced + added;
            if needed > quota {
                return Err(ServiceWorkerError::QuotaExceeded { needed, quota });
            }
        }

        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for (key, entry) in entries {
            trace!(store = name, url = %key.url, bytes = entry.body.len(), "Cache put");
            cache.put(key, entry);
        }
        Ok(())
    }

    async fn count(&self, name: &str) -> SwResult<usize> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .map(Cache::len)
            .unwrap_or(0))
    }
}

impl CacheBackend for MemoryCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(self.open_store(name))
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<bool>> {
        Box::pin(async move { Ok(self.caches.read().await.contains_key(name)) })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SwResult<bool>> {
        Box::pin(self.delete_store(name))
    }

    fn keys(&self) -> BoxFuture<'_, SwResult<Vec<String>>> {
        Box::pin(self.store_names())
    }

    fn match_request<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, SwResult<Option<CacheEntry>>> {
        Box::pin(self.lookup(name, key))
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
        Box::pin(self.count(name))
    }
}

/// Bytes a batch frees by replacing existing entries, and bytes it adds.
fn batch_footprint(current: Option<&Cache>, entries: &[(RequestKey, CacheEntry)]) -> (usize, usize) {
    let mut latest: HashMap<&RequestKey, usize> = HashMap::new();
    for (key, entry) in entries {
        latest.insert(key, entry.size());
    }
    let replaced = latest
        .keys()
        .filter_map(|key| current.and_then(|cache| cache.match_request(key)))
        .map(CacheEntry::size)
        .sum();
    (replaced, latest.values().sum())
}
