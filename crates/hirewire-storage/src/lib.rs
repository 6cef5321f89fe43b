//! Cache-aside storage capability + HTTP fetch utilities for hirewire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use moka::Expiry;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "hirewire-storage";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on entries held by [`MemoryCache`].
pub const MEMORY_CACHE_CAPACITY: u64 = 100_000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key not found in cache")]
    NotFound,
    #[error("invalid value for cache: {0}")]
    InvalidValue(String),
    #[error("invalid cache key")]
    InvalidKey,
    #[error("cache is closed")]
    Closed,
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Key/value store with per-key TTL. A `ttl` of zero selects the store default.
///
/// Callers must treat every error as a cache miss; `NotFound` is only
/// distinguished so misses and outages can be logged differently.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<String, CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

/// JSON helpers over any [`Cache`].
#[async_trait]
pub trait CacheExt: Cache {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<T, CacheError> {
        let raw = self.get(key).await?;
        serde_json::from_str(&raw).map_err(|e| CacheError::InvalidValue(e.to_string()))
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value).map_err(|e| CacheError::InvalidValue(e.to_string()))?;
        self.set(key, raw, ttl).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process TTL store backed by moka. Expired entries are dropped by the
/// cache's own housekeeping, not only when their key is read again.
pub struct MemoryCache {
    default_ttl: Duration,
    entries: moka::future::Cache<String, CachedValue>,
    closed: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl MemoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        let entries = moka::future::Cache::builder()
            .max_capacity(MEMORY_CACHE_CAPACITY)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            default_ttl,
            entries,
            closed: AtomicBool::new(false),
        }
    }

    /// Live entry count after pending evictions have been applied.
    pub async fn len(&self) -> usize {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count() as usize
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self, key: Option<&str>) -> Result<(), CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        if key.is_some_and(|k| k.trim().is_empty()) {
            return Err(CacheError::InvalidKey);
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.check_open(Some(key))?;
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        self.entries
            .insert(key.to_string(), CachedValue { value, ttl })
            .await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, CacheError> {
        self.check_open(Some(key))?;
        self.entries
            .get(key)
            .await
            .map(|entry| entry.value)
            .ok_or(CacheError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_open(Some(key))?;
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.check_open(None)?;
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        Ok(())
    }
}

/// Cache that fails every call. Used to exercise degraded (cache-less) paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingCache;

#[async_trait]
impl Cache for FailingCache {
    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn get(&self, _key: &str) -> Result<String, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin JSON GET client. One request per call, no retries; the per-request
/// timeout comes from [`HttpClientConfig::timeout`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();

            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound {
                    url: url.to_string(),
                });
            }
            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "fetched response body");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Payload {
        id: u64,
        tags: Vec<String>,
    }

    #[tokio::test]
    async fn set_then_get_round_trips_before_expiry() {
        let cache = MemoryCache::default();
        let value = Payload {
            id: 7,
            tags: vec!["rust".into()],
        };

        cache
            .set_json("item:7", &value, Duration::from_secs(60))
            .await
            .expect("set");
        let got: Payload = cache.get_json("item:7").await.expect("get");
        assert_eq!(got, value);
    }

    #[tokio::test]
    async fn expired_entries_read_as_not_found() {
        let cache = MemoryCache::default();
        cache
            .set("item:1", "1".into(), Duration::from_millis(20))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = cache.get("item:1").await.expect_err("expired");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn expired_keys_are_evicted_without_being_read() {
        let cache = MemoryCache::default();
        for threshold in 0..200 {
            cache
                .set(
                    &format!("hn:search:hiring:{threshold}"),
                    "[]".into(),
                    Duration::from_millis(10),
                )
                .await
                .expect("set");
        }
        // Past the first timer-wheel tick (about one second) so every entry is due.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        cache
            .set("hn:search:hiring:200", "[]".into(), Duration::from_secs(60))
            .await
            .expect("set fresh");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn overwrite_takes_the_new_ttl() {
        let cache = MemoryCache::default();
        cache
            .set("k", "old".into(), Duration::from_millis(20))
            .await
            .expect("set short");
        cache
            .set("k", "new".into(), Duration::from_secs(60))
            .await
            .expect("set long");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.expect("still live"), "new");
    }

    #[tokio::test]
    async fn zero_ttl_uses_store_default() {
        let cache = MemoryCache::new(Duration::from_secs(30));
        cache.set("k", "v".into(), Duration::ZERO).await.expect("set");
        assert_eq!(cache.get("k").await.expect("get"), "v");
    }

    #[tokio::test]
    async fn delete_clear_and_close() {
        let cache = MemoryCache::default();
        cache.set("a", "1".into(), Duration::ZERO).await.expect("set a");
        cache.set("b", "2".into(), Duration::ZERO).await.expect("set b");

        cache.delete("a").await.expect("delete");
        assert!(cache.get("a").await.expect_err("deleted").is_not_found());

        cache.clear().await.expect("clear");
        assert!(cache.get("b").await.expect_err("cleared").is_not_found());

        assert!(matches!(
            cache.set("", "x".into(), Duration::ZERO).await,
            Err(CacheError::InvalidKey)
        ));

        cache.close();
        assert!(matches!(cache.get("b").await, Err(CacheError::Closed)));
    }

    #[tokio::test]
    async fn undecodable_value_is_invalid_value() {
        let cache = MemoryCache::default();
        cache.set("k", "not json".into(), Duration::ZERO).await.expect("set");
        let err = cache.get_json::<Payload>("k").await.expect_err("decode");
        assert!(matches!(err, CacheError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn failing_cache_never_reports_not_found() {
        let err = FailingCache.get("k").await.expect_err("always fails");
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn fetcher_maps_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1, "tags": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/boom.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbage.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let base = server.uri();

        let ok: Payload = fetcher
            .get_json(&format!("{base}/ok.json"))
            .await
            .expect("ok");
        assert_eq!(ok.id, 1);

        let missing = fetcher
            .get_json::<Payload>(&format!("{base}/missing.json"))
            .await
            .expect_err("404");
        assert!(matches!(missing, FetchError::NotFound { .. }));

        let boom = fetcher
            .get_json::<Payload>(&format!("{base}/boom.json"))
            .await
            .expect_err("503");
        assert!(matches!(boom, FetchError::HttpStatus { status: 503, .. }));

        let garbage = fetcher
            .get_json::<Payload>(&format!("{base}/garbage.json"))
            .await
            .expect_err("decode");
        assert!(matches!(garbage, FetchError::Decode { .. }));
    }
}
