//! Upstream content API contract + the cache-aside client that backs both
//! pipeline stages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use hirewire_core::{ItemId, SourceError, SourcePost};
use hirewire_storage::{Cache, CacheError, CacheExt, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "hirewire-source";

pub const HIRING_AUTHOR: &str = "whoishiring";
pub const HIRING_SEARCH_QUERY: &str = "Ask+HN:+Who+is+hiring?";
/// How far back the hiring-thread search looks.
pub const SEARCH_WINDOW_MONTHS: u32 = 6;

#[async_trait]
pub trait JobSourceClient: Send + Sync {
    async fn get_item(&self, id: ItemId) -> Result<SourcePost, SourceError>;
    async fn get_top_stories(&self) -> Result<Vec<ItemId>, SourceError>;
    async fn search_hiring_threads(&self) -> Result<Vec<ItemId>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: Vec<SearchHit>,
    #[serde(default, rename = "nbHits")]
    pub nb_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "objectID")]
    pub object_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub api_base_url: String,
    pub search_base_url: String,
    pub cache_ttl: Duration,
}

impl Default for SourceClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://hacker-news.firebaseio.com/v0".to_string(),
            search_base_url: "https://hn.algolia.com/api/v1".to_string(),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub fn item_cache_key(id: ItemId) -> String {
    format!("hn:item:{id}")
}

pub fn search_cache_key(threshold: i64) -> String {
    format!("hn:search:hiring:{threshold}")
}

/// Unix seconds of `now` minus the search window.
pub fn hiring_search_threshold(now: DateTime<Utc>) -> i64 {
    now.checked_sub_months(Months::new(SEARCH_WINDOW_MONTHS))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .timestamp()
}

/// Keeps numeric object ids in upstream ranking order; logs and skips the rest.
pub fn numeric_hit_ids(hits: &[SearchHit]) -> Vec<ItemId> {
    hits.iter()
        .filter_map(|hit| match hit.object_id.parse::<ItemId>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(
                    id = %hit.object_id,
                    title = hit.title.as_deref().unwrap_or_default(),
                    author = hit.author.as_deref().unwrap_or_default(),
                    "invalid story id"
                );
                None
            }
        })
        .collect()
}

fn map_fetch_error(context: &str, err: FetchError) -> SourceError {
    match err {
        FetchError::NotFound { url } => SourceError::NotFound(url),
        other => SourceError::internal_with(context, other),
    }
}

pub struct CachingSourceClient {
    http: HttpFetcher,
    cache: Arc<dyn Cache>,
    config: SourceClientConfig,
}

impl CachingSourceClient {
    pub fn new(http: HttpFetcher, cache: Arc<dyn Cache>, config: SourceClientConfig) -> Self {
        Self {
            http,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &SourceClientConfig {
        &self.config
    }

    pub fn search_url(&self, threshold: i64) -> String {
        format!(
            "{}/search?tags=story,author_{HIRING_AUTHOR}&query={HIRING_SEARCH_QUERY}&numericFilters=created_at_i>{threshold}",
            self.config.search_base_url.trim_end_matches('/'),
        )
    }

    fn item_url(&self, id: ItemId) -> String {
        format!("{}/item/{id}.json", self.config.api_base_url.trim_end_matches('/'))
    }

    async fn cached<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        match self.cache.get_json::<T>(key).await {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(CacheError::NotFound) => {
                debug!(key, "cache miss");
                None
            }
            Err(err) => {
                warn!(key, error = %err, "cache error, falling back to upstream");
                None
            }
        }
    }

    async fn write_through<T>(&self, key: &str, value: &T)
    where
        T: Serialize + Sync,
    {
        if let Err(err) = self.cache.set_json(key, value, self.config.cache_ttl).await {
            warn!(key, error = %err, "failed to write cache entry");
        }
    }

    pub async fn search_hiring_threads_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ItemId>, SourceError> {
        let threshold = hiring_search_threshold(now);
        let key = search_cache_key(threshold);
        if let Some(ids) = self.cached::<Vec<ItemId>>(&key).await {
            return Ok(ids);
        }

        let url = self.search_url(threshold);
        debug!(%url, "searching for hiring threads");
        let response: SearchResponse = self.http.get_json(&url).await.map_err(|err| {
            error!(error = %err, "hiring thread search failed");
            map_fetch_error("searching hiring threads", err)
        })?;
        info!(total_hits = response.nb_hits, "search response stats");

        let ids = numeric_hit_ids(&response.hits);
        debug!(count = ids.len(), "fetched hiring threads");
        self.write_through(&key, &ids).await;
        Ok(ids)
    }
}

#[async_trait]
impl JobSourceClient for CachingSourceClient {
    async fn get_item(&self, id: ItemId) -> Result<SourcePost, SourceError> {
        let key = item_cache_key(id);
        if let Some(post) = self.cached::<SourcePost>(&key).await {
            return Ok(post);
        }

        let url = self.item_url(id);
        let post: Option<SourcePost> = self.http.get_json(&url).await.map_err(|err| {
            match &err {
                FetchError::NotFound { .. } => warn!(id, "item not found"),
                _ => error!(id, error = %err, "failed to fetch item"),
            }
            map_fetch_error("fetching item", err)
        })?;
        let Some(post) = post else {
            warn!(id, "item not found");
            return Err(SourceError::NotFound(url));
        };

        debug!(id, title = %post.title, "fetched item");
        self.write_through(&key, &post).await;
        Ok(post)
    }

    async fn get_top_stories(&self) -> Result<Vec<ItemId>, SourceError> {
        let url = format!("{}/topstories.json", self.config.api_base_url.trim_end_matches('/'));
        let ids: Vec<ItemId> = self.http.get_json(&url).await.map_err(|err| {
            error!(error = %err, "failed to fetch top stories");
            map_fetch_error("fetching top stories", err)
        })?;
        debug!(count = ids.len(), "fetched top stories");
        Ok(ids)
    }

    async fn search_hiring_threads(&self) -> Result<Vec<ItemId>, SourceError> {
        self.search_hiring_threads_at(Utc::now()).await
    }
}
