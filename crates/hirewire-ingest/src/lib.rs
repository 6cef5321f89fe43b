//! Ingestion pipeline: scheduler lifecycle, the two-stage story → comment
//! worker pools, and the publish sink they feed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hirewire_core::{ItemId, JobPosting, SourceError, SourcePost};
pub use hirewire_core::JOB_POSTINGS_SUBJECT;
use hirewire_source::{CachingSourceClient, JobSourceClient, SourceClientConfig, HIRING_AUTHOR};
use hirewire_storage::{HttpClientConfig, HttpFetcher, MemoryCache};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hirewire-ingest";

/// Capacity of both work queues. One slot is the closest tokio gets to an
/// unbuffered channel: a send parks until a worker takes the previous item.
pub const QUEUE_CAPACITY: usize = 1;

const HIRING_TITLE_MARKER: &str = "who is hiring?";

/// Retry knobs exposed through configuration. Nothing in the fetch or
/// publish paths reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub story_workers: usize,
    pub comment_workers: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            story_workers: 5,
            comment_workers: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_base_url: String,
    pub search_base_url: String,
    pub request_timeout: Duration,
    pub polling_interval: Duration,
    pub pools: PoolSizes,
    pub retry: RetryConfig,
    pub nats_url: String,
    pub nats_connect_timeout: Duration,
    pub cache_ttl: Duration,
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let source = SourceClientConfig::default();
        Self {
            api_base_url: source.api_base_url,
            search_base_url: source.search_base_url,
            request_timeout: Duration::from_secs(10),
            polling_interval: Duration::from_secs(15 * 60),
            pools: PoolSizes::default(),
            retry: RetryConfig::default(),
            nats_url: "nats://localhost:4222".to_string(),
            nats_connect_timeout: Duration::from_secs(10),
            cache_ttl: source.cache_ttl,
            user_agent: "hirewire-bot/0.1".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unparseable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        // `*_SECS` wins; the bare name takes a duration string like `15m`.
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .or_else(|| {
                    key.strip_suffix("_SECS")
                        .and_then(|bare| lookup(bare))
                        .and_then(|v| parse_duration(&v))
                })
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(default)
                .max(1)
        };

        Self {
            api_base_url: lookup("HN_API_BASE_URL").unwrap_or(defaults.api_base_url),
            search_base_url: lookup("HN_SEARCH_API_BASE_URL").unwrap_or(defaults.search_base_url),
            request_timeout: secs("HN_API_TIMEOUT_SECS", defaults.request_timeout),
            polling_interval: secs("POLLING_INTERVAL_SECS", defaults.polling_interval),
            pools: PoolSizes {
                story_workers: count("STORY_WORKERS", defaults.pools.story_workers),
                comment_workers: count("COMMENT_WORKERS", defaults.pools.comment_workers),
            },
            retry: RetryConfig {
                max_retries: lookup("MAX_RETRIES")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.retry.max_retries),
                retry_delay: secs("RETRY_DELAY_SECS", defaults.retry.retry_delay),
            },
            nats_url: lookup("NATS_URL").unwrap_or(defaults.nats_url),
            nats_connect_timeout: secs("NATS_CONN_TIMEOUT_SECS", defaults.nats_connect_timeout),
            cache_ttl: secs("CACHE_TTL_SECS", defaults.cache_ttl),
            user_agent: lookup("HIREWIRE_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.request_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn source_client_config(&self) -> SourceClientConfig {
        SourceClientConfig {
            api_base_url: self.api_base_url.clone(),
            search_base_url: self.search_base_url.clone(),
            cache_ttl: self.cache_ttl,
        }
    }
}

/// Parses duration strings made of number and unit pairs: `10s`, `15m`,
/// `1h30m`, `1.5h`, `250ms`. A bare `0` is zero.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }
    if raw.is_empty() {
        return None;
    }

    let mut rest = raw;
    let mut total_secs = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_secs = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "\u{b5}s" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total_secs += value * unit_secs;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total_secs).ok()
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("marshaling job posting: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publishing to NATS: {0}")]
    Transport(String),
}

/// Fire-and-forget sink for normalized postings.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_job_posting(&self, posting: &JobPosting) -> Result<(), PublishError>;

    /// Pushes out anything buffered. Called once per completed cycle.
    async fn flush(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

pub struct NatsPublisher {
    client: async_nats::Client,
    subject: String,
}

impl NatsPublisher {
    pub async fn connect(url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(connect_timeout)
            .connect(url)
            .await
            .with_context(|| format!("connecting to NATS at {url}"))?;
        Ok(Self::new(client))
    }

    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            subject: JOB_POSTINGS_SUBJECT.to_string(),
        }
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish_job_posting(&self, posting: &JobPosting) -> Result<(), PublishError> {
        let data = serde_json::to_vec(posting)?;
        let size = data.len();
        self.client
            .publish(self.subject.clone(), Bytes::from(data))
            .await
            .map_err(|e| {
                error!(id = %posting.id, error = %e, "failed to publish job posting");
                PublishError::Transport(e.to_string())
            })?;
        debug!(id = %posting.id, subject = %self.subject, size, "published job posting");
        Ok(())
    }

    async fn flush(&self) -> Result<(), PublishError> {
        self.client
            .flush()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// In-memory publisher that records every posting it accepts.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: RwLock<Vec<JobPosting>>,
    reject_ids: RwLock<HashSet<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish of the given posting id fail.
    pub fn reject(&self, id: impl Into<String>) {
        self.reject_ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into());
    }

    pub fn published(&self) -> Vec<JobPosting> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn published_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.published().into_iter().map(|p| p.id).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_job_posting(&self, posting: &JobPosting) -> Result<(), PublishError> {
        let rejected = self
            .reject_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&posting.id);
        if rejected {
            return Err(PublishError::Transport(format!(
                "posting {} rejected",
                posting.id
            )));
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(posting.clone());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to search hiring threads: {0}")]
    Search(#[source] SourceError),
    #[error("fetch cycle cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
enum CommentError {
    #[error("failed to fetch comment: {0}")]
    Fetch(#[from] SourceError),
    #[error("failed to publish job posting: {0}")]
    Publish(#[from] PublishError),
}

/// Per-cycle counters. Only ever incremented.
#[derive(Debug, Default)]
pub struct ProcessingStats {
    hiring_threads_found: AtomicU64,
    comments_processed: AtomicU64,
}

impl ProcessingStats {
    pub fn hiring_threads_found(&self) -> u64 {
        self.hiring_threads_found.load(Ordering::SeqCst)
    }

    pub fn comments_processed(&self) -> u64 {
        self.comments_processed.load(Ordering::SeqCst)
    }

    fn record_hiring_thread(&self) {
        self.hiring_threads_found.fetch_add(1, Ordering::SeqCst);
    }

    fn record_comment(&self) {
        self.comments_processed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub hiring_threads_found: u64,
    pub comments_processed: u64,
}

/// Monthly hiring thread heuristic: title marker (case-insensitive) posted by
/// the dedicated account (case-sensitive).
pub fn is_hiring_thread(post: &SourcePost) -> bool {
    post.title.to_lowercase().contains(HIRING_TITLE_MARKER) && post.by == HIRING_AUTHOR
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ItemId>>>;

/// Takes the next id off a queue shared by a pool. `None` once the queue is
/// closed and drained, or the cycle is cancelled.
async fn next_item(queue: &SharedReceiver, cancel: &CancellationToken) -> Option<ItemId> {
    let mut rx = queue.lock().await;
    tokio::select! {
        _ = cancel.cancelled() => None,
        id = rx.recv() => id,
    }
}

/// Fetches one story, classifies it and fans its child ids into the comment
/// queue. Blocks on the comment queue when the comment pool is saturated.
pub struct StoryProcessor {
    source: Arc<dyn JobSourceClient>,
    stats: Arc<ProcessingStats>,
}

impl StoryProcessor {
    pub fn new(source: Arc<dyn JobSourceClient>, stats: Arc<ProcessingStats>) -> Self {
        Self { source, stats }
    }

    pub async fn process_story(
        &self,
        id: ItemId,
        comments: &mpsc::Sender<ItemId>,
        cancel: &CancellationToken,
    ) {
        let post = match self.source.get_item(id).await {
            Ok(post) => post,
            Err(err) => {
                error!(id, error = %err, "failed to fetch story");
                return;
            }
        };

        if !is_hiring_thread(&post) {
            debug!(id, title = %post.title, author = %post.by, "not a hiring thread");
            return;
        }

        self.stats.record_hiring_thread();
        info!(
            id = post.id,
            title = %post.title,
            author = %post.by,
            time = post.time,
            comments_count = post.kids.len(),
            "found hiring thread"
        );

        for &comment_id in &post.kids {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = comments.send(comment_id) => {
                    if sent.is_err() {
                        warn!(id, comment_id, "comment queue closed, dropping remaining comments");
                        return;
                    }
                }
            }
        }
    }

    /// Pushes every candidate onto the story queue, then closes it by
    /// dropping the sender.
    pub async fn feed_stories(
        stories: Vec<ItemId>,
        queue: mpsc::Sender<ItemId>,
        cancel: CancellationToken,
    ) {
        for id in stories {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = queue.send(id) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn process_comment(
    source: &dyn JobSourceClient,
    publisher: &dyn Publisher,
    id: ItemId,
) -> Result<JobPosting, CommentError> {
    let comment = source.get_item(id).await?;
    let posting = comment.to_job_posting();
    debug!(comment_id = %posting.id, posted_at = %posting.posted_at, "processing job posting");
    publisher.publish_job_posting(&posting).await?;
    Ok(posting)
}

/// One polling iteration: search, then story fan-out, then comment fan-out.
#[derive(Clone)]
pub struct FetchCycle {
    source: Arc<dyn JobSourceClient>,
    publisher: Arc<dyn Publisher>,
    pools: PoolSizes,
}

impl FetchCycle {
    pub fn new(
        source: Arc<dyn JobSourceClient>,
        publisher: Arc<dyn Publisher>,
        pools: PoolSizes,
    ) -> Self {
        Self {
            source,
            publisher,
            pools: PoolSizes {
                story_workers: pools.story_workers.max(1),
                comment_workers: pools.comment_workers.max(1),
            },
        }
    }

    pub fn pools(&self) -> PoolSizes {
        self.pools
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<CycleSummary, IngestError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("fetch_cycle", %cycle_id);
        self.run_inner(cycle_id, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        cycle_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, IngestError> {
        let started_at = Utc::now();
        info!("starting to fetch who is hiring posts");

        let stories = self
            .source
            .search_hiring_threads()
            .await
            .map_err(IngestError::Search)?;
        let candidates = stories.len();
        info!(count = candidates, "found hiring threads");

        let stats = Arc::new(ProcessingStats::default());
        let (story_tx, story_rx) = mpsc::channel::<ItemId>(QUEUE_CAPACITY);
        let (comment_tx, comment_rx) = mpsc::channel::<ItemId>(QUEUE_CAPACITY);

        let comment_workers = self.spawn_comment_workers(comment_rx, &stats, cancel);
        let story_workers = self.spawn_story_workers(story_rx, &comment_tx, &stats, cancel);

        tokio::spawn(
            StoryProcessor::feed_stories(stories, story_tx, cancel.clone()).in_current_span(),
        );

        let completion = tokio::spawn(
            wait_for_workers(story_workers, comment_tx, comment_workers).in_current_span(),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("fetch cycle cancelled, abandoning workers");
                return Err(IngestError::Cancelled);
            }
            joined = completion => {
                if let Err(err) = joined {
                    error!(error = %err, "fetch cycle completion task failed");
                }
            }
        }

        if let Err(err) = self.publisher.flush().await {
            error!(error = %err, "failed to flush publisher");
        }

        let summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            candidates,
            hiring_threads_found: stats.hiring_threads_found(),
            comments_processed: stats.comments_processed(),
        };
        info!(
            hiring_threads_found = summary.hiring_threads_found,
            comments_processed = summary.comments_processed,
            "completed fetching who is hiring posts"
        );
        Ok(summary)
    }

    fn spawn_comment_workers(
        &self,
        queue: mpsc::Receiver<ItemId>,
        stats: &Arc<ProcessingStats>,
        cancel: &CancellationToken,
    ) -> JoinSet<()> {
        let queue: SharedReceiver = Arc::new(tokio::sync::Mutex::new(queue));
        let mut workers = JoinSet::new();
        for worker in 0..self.pools.comment_workers {
            let queue = queue.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();
            let source = self.source.clone();
            let publisher = self.publisher.clone();
            workers.spawn(
                async move {
                    while let Some(id) = next_item(&queue, &cancel).await {
                        match process_comment(source.as_ref(), publisher.as_ref(), id).await {
                            Ok(_) => stats.record_comment(),
                            Err(err) => {
                                error!(comment_id = id, error = %err, "failed to process comment")
                            }
                        }
                    }
                    debug!(worker, "comment worker exiting");
                }
                .in_current_span(),
            );
        }
        workers
    }

    fn spawn_story_workers(
        &self,
        queue: mpsc::Receiver<ItemId>,
        comments: &mpsc::Sender<ItemId>,
        stats: &Arc<ProcessingStats>,
        cancel: &CancellationToken,
    ) -> JoinSet<()> {
        let queue: SharedReceiver = Arc::new(tokio::sync::Mutex::new(queue));
        let mut workers = JoinSet::new();
        for worker in 0..self.pools.story_workers {
            let queue = queue.clone();
            let comments = comments.clone();
            let cancel = cancel.clone();
            let processor = StoryProcessor::new(self.source.clone(), stats.clone());
            workers.spawn(
                async move {
                    while let Some(id) = next_item(&queue, &cancel).await {
                        processor.process_story(id, &comments, &cancel).await;
                    }
                    debug!(worker, "story worker exiting");
                }
                .in_current_span(),
            );
        }
        workers
    }
}

/// Completion barrier. The comment queue closes once the last sender is
/// gone: every story worker owns one, and the orchestrator's own sender is
/// dropped here only after all story workers have exited.
async fn wait_for_workers(
    mut story_workers: JoinSet<()>,
    comment_tx: mpsc::Sender<ItemId>,
    mut comment_workers: JoinSet<()>,
) {
    while let Some(joined) = story_workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "story worker failed");
        }
    }
    drop(comment_tx);
    debug!("all story workers exited, comment queue closed");

    while let Some(joined) = comment_workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "comment worker failed");
        }
    }
}

/// Owns the polling timer. `Idle -> Active` happens once per instance until
/// [`Scheduler::stop`] clears the flag again.
pub struct Scheduler {
    cycle: FetchCycle,
    polling_interval: Duration,
    active: Mutex<bool>,
    cycles_started: AtomicU64,
}

impl Scheduler {
    pub fn new(cycle: FetchCycle, polling_interval: Duration) -> Self {
        Self {
            cycle,
            polling_interval,
            active: Mutex::new(false),
            cycles_started: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::SeqCst)
    }

    pub fn cycle(&self) -> &FetchCycle {
        &self.cycle
    }

    /// Runs one cycle immediately, then one per polling interval, until
    /// `cancel` fires. A caller that finds the scheduler already active
    /// returns `Ok(())` straight away.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), IngestError> {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if *active {
                debug!("scheduler already active");
                return Ok(());
            }
            *active = true;
        }

        info!(polling_interval = ?self.polling_interval, "scheduler started");
        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        if let Err(err) = self.run_cycle(&cancel).await {
            error!(error = %err, "initial fetch failed");
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("scheduler loop cancelled");
                    return Err(IngestError::Cancelled);
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle(&cancel).await {
                        error!(error = %err, "periodic fetch failed");
                    }
                }
            }
        }
    }

    /// Clears the active flag. An in-flight cycle keeps running.
    pub fn stop(&self) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = false;
        info!("scheduler stopped");
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, IngestError> {
        self.cycles_started.fetch_add(1, Ordering::SeqCst);
        self.cycle.run(cancel).await
    }
}

/// Wires the production collaborators: HTTP fetcher, in-process cache,
/// caching source client and NATS publisher.
pub async fn fetch_cycle_from_config(config: &IngestConfig) -> anyhow::Result<FetchCycle> {
    let http = HttpFetcher::new(config.http_client_config())?;
    let cache = Arc::new(MemoryCache::new(config.cache_ttl));
    let source = CachingSourceClient::new(http, cache, config.source_client_config());
    let publisher = NatsPublisher::connect(&config.nats_url, config.nats_connect_timeout).await?;
    Ok(FetchCycle::new(
        Arc::new(source),
        Arc::new(publisher),
        config.pools,
    ))
}

pub async fn scheduler_from_config(config: &IngestConfig) -> anyhow::Result<Scheduler> {
    let cycle = fetch_cycle_from_config(config).await?;
    Ok(Scheduler::new(cycle, config.polling_interval))
}
