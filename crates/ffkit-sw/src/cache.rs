//! Named cache buckets of request → response entries.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ffkit_net::{Request, Response};
use hashbrown::HashMap;
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys ====================

/// Identity of a cached request: method plus full URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Create a key.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key for `GET url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for a request.
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

// ==================== Entries ====================

/// A captured response stored under its request identity.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request identity.
    pub key: RequestKey,

    /// Response snapshot.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(key: RequestKey, response: Response) -> Self {
        Self {
            key,
            response,
            cached_at: now_millis(),
        }
    }
}

// ==================== Cache ====================

/// A single bucket.
#[derive(Debug, Default)]
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

    /// Match a request identity exactly.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store a response, replacing any previous entry for the same identity.
    pub fn put(&mut self, key: RequestKey, response: Response) -> Result<(), ServiceWorkerError> {
        if key.method != Method::GET.as_str() {
            return Err(ServiceWorkerError::CacheError(format!(
                "only GET requests can be cached, got {} {}",
                key.method, key.url
            )));
        }
        self.entries.insert(key.clone(), CacheEntry::new(key, response));
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All request identities.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Storage of named buckets.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the bucket if it does not exist.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// Whether a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// All bucket names, sorted.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a bucket. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Store `response` for `request` in bucket `name`, creating the bucket.
    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError>;

    /// Exact-identity lookup in bucket `name`.
    async fn match_request(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<Response>, ServiceWorkerError>;

    /// Snapshot of every entry in bucket `name`, sorted by URL.
    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError>;
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError> {
        let key = RequestKey::for_request(request);
        trace!(cache = name, url = %key.url, "Cache put");
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(key, response)
    }

    async fn match_request(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .map(|entry| entry.response.clone()))
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        let cache = caches
            .get(name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache {}", name)))?;
        let mut entries: Vec<CacheEntry> = cache.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.url.cmp(&b.key.url));
        Ok(entries)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;

    fn url(path: &str) -> Url {
        Url::parse("https://ff.test").unwrap().join(path).unwrap()
    }

    fn ok(path: &str, body: &'static str) -> Response {
        Response::new(url(path), StatusCode::OK, body)
    }

    #[test]
    fn test_key_ignores_fragment() {
        assert_eq!(
            RequestKey::get(&url("/menu#specials")),
            RequestKey::get(&url("/menu"))
        );
        assert_ne!(
            RequestKey::get(&url("/menu?day=mon")),
            RequestKey::get(&url("/menu"))
        );
    }

    #[test]
    fn test_cache_put_replaces() {
        let mut cache = Cache::new("app-v1");
        let key = RequestKey::get(&url("/style.css"));

        cache.put(key.clone(), ok("/style.css", "a")).unwrap();
        cache.put(key.clone(), ok("/style.css", "b")).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.match_request(&key).unwrap().response.body,
            Bytes::from_static(b"b")
        );
    }

    #[test]
    fn test_cache_rejects_non_get() {
        let mut cache = Cache::new("app-v1");
        let key = RequestKey::new(&Method::POST, &url("/api/posts"));
        assert!(cache.put(key, ok("/api/posts", "{}")).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("app-v1");
        let key = RequestKey::get(&url("/a.js"));
        cache.put(key.clone(), ok("/a.js", "")).unwrap();
        assert!(cache.delete(&key));
        assert!(cache.match_request(&key).is_none());
        assert!(!cache.delete(&key));
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.has("app-v1").await.unwrap());

        storage.open("app-v1").await.unwrap();
        assert!(storage.has("app-v1").await.unwrap());

        assert!(storage.delete("app-v1").await.unwrap());
        assert!(!storage.has("app-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_keys_sorted() {
        let storage = MemoryCacheStorage::new();
        storage.open("b").await.unwrap();
        storage.open("a").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_storage_put_and_match() {
        let storage = MemoryCacheStorage::new();
        let request = Request::get(url("/menu.json"));
        storage
            .put("app-v1", &request, ok("/menu.json", "[]"))
            .await
            .unwrap();

        let hit = storage
            .match_request("app-v1", &RequestKey::get(&url("/menu.json")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"[]"));

        let miss = storage
            .match_request("app-v2", &RequestKey::get(&url("/menu.json")))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_entries_of_missing_bucket() {
        let storage = MemoryCacheStorage::new();
        assert!(matches!(
            storage.entries("nope").await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }
}
