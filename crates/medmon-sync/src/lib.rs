//! Orchestration: source registry, feed ingestion, search and scheduled reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, Utc};
use futures::future::join_all;
use medmon_adapters::{articles_from_feed, AdapterError, FeedTransport};
use medmon_core::{Article, CachedArticle, SourceConfig};
use medmon_storage::{HttpClientConfig, HttpFetcher, Store, StoreConfig, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

mod delivery;
mod report;
mod scheduler;
mod search;

pub use delivery::{Delivery, DeliveryError, SmtpDelivery, SmtpSettings};
pub use report::{default_report_filename, export_report_html, render_report};
pub use scheduler::{
    is_due, period_label, report_subject, DuePolicy, DueRunSummary, JobOutcome, ReportScheduler,
};
pub use search::{matches, parse_terms, resolve_range, SearchEngine, SearchQuery, TimeWindow};

pub const CRATE_NAME: &str = "medmon-sync";

/// Settings key holding the JSON-encoded source list.
pub const SOURCES_KEY: &str = "rss_sources";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub tick_cron: String,
    pub catch_up_minutes: u32,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("MEDMON_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./media_monitor.db")),
            user_agent: std::env::var("MEDMON_USER_AGENT")
                .unwrap_or_else(|_| "medmon-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("MEDMON_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("MEDMON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            tick_cron: std::env::var("MEDMON_TICK_CRON")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),
            catch_up_minutes: std::env::var("MEDMON_CATCH_UP_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_path.clone())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn due_policy(&self) -> DuePolicy {
        DuePolicy::with_catch_up_minutes(self.catch_up_minutes)
    }
}

/// Source of "now". Scheduling compares against local wall time, storage against UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().with_timezone(&Utc)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl FixedClock {
    pub fn utc(now: DateTime<Utc>) -> Self {
        Self(now.fixed_offset())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new(
            "Reuters World",
            "https://feeds.reuters.com/Reuters/worldNews",
            true,
        ),
        SourceConfig::new(
            "BBC World",
            "http://feeds.bbci.co.uk/news/world/rss.xml",
            true,
        ),
        SourceConfig::new("AP Top News", "https://feeds.apnews.com/apf-topnews", true),
    ]
}

/// Typed view over the source list kept in the settings table.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    store: Store,
}

impl SourceRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Every valid configured source. Malformed records are skipped with a warning;
    /// a setting that is not a list at all falls back to the defaults.
    pub async fn sources(&self) -> Result<Vec<SourceConfig>> {
        let raw: Option<Vec<serde_json::Value>> = match self.store.get_json(SOURCES_KEY, None).await {
            Ok(raw) => raw,
            Err(err @ StoreError::Json { .. }) => {
                warn!(error = %err, "source list is unreadable, using defaults");
                None
            }
            Err(err) => return Err(err).context("loading source list"),
        };
        let Some(raw) = raw else {
            return Ok(default_sources());
        };

        let mut sources = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            let source = match serde_json::from_value::<SourceConfig>(value) {
                Ok(source) => normalize_source(source),
                Err(err) => {
                    warn!(index, error = %err, "skipping malformed source record");
                    continue;
                }
            };
            if let Err(err) = source.validate() {
                warn!(index, error = %err, "skipping invalid source record");
                continue;
            }
            sources.push(source);
        }
        Ok(sources)
    }

    pub async fn enabled_sources(&self) -> Result<Vec<SourceConfig>> {
        Ok(self
            .sources()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    pub async fn save(&self, sources: &[SourceConfig]) -> Result<()> {
        let sources: Vec<SourceConfig> = sources.iter().cloned().map(normalize_source).collect();
        for source in &sources {
            source
                .validate()
                .with_context(|| format!("refusing to save source {:?}", source.name))?;
        }
        self.store
            .set_json(SOURCES_KEY, &sources)
            .await
            .context("saving source list")
    }

    /// Adds `source`, replacing any existing entry with the same name.
    pub async fn add(&self, source: SourceConfig) -> Result<()> {
        self.merge(vec![source]).await.map(|_| ())
    }

    /// Adds or replaces every source by name. Returns how many were written.
    pub async fn merge(&self, incoming: Vec<SourceConfig>) -> Result<usize> {
        let mut sources = self.sources().await?;
        let count = incoming.len();
        for source in incoming.into_iter().map(normalize_source) {
            match sources.iter_mut().find(|s| s.name == source.name) {
                Some(existing) => *existing = source,
                None => sources.push(source),
            }
        }
        self.save(&sources).await?;
        Ok(count)
    }

    /// Returns `false` when no source has that name.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let mut sources = self.sources().await?;
        let Some(source) = sources.iter_mut().find(|s| s.name == name.trim()) else {
            return Ok(false);
        };
        source.enabled = enabled;
        self.save(&sources).await?;
        Ok(true)
    }

    pub async fn remove(&self, name: &str) -> Result<bool> {
        let mut sources = self.sources().await?;
        let before = sources.len();
        sources.retain(|s| s.name != name.trim());
        if sources.len() == before {
            return Ok(false);
        }
        self.save(&sources).await?;
        Ok(true)
    }
}

fn normalize_source(source: SourceConfig) -> SourceConfig {
    SourceConfig {
        name: source.name.trim().to_string(),
        url: source.url.trim().to_string(),
        enabled: source.enabled,
    }
}

/// Parses `name|url|enabled` lines. `enabled` defaults to true and `0` disables.
pub fn parse_source_lines(text: &str) -> Vec<SourceConfig> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').map(str::trim).collect();
            if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
                return None;
            }
            let enabled = parts.get(2).map(|flag| *flag != "0").unwrap_or(true);
            Some(SourceConfig::new(parts[0], parts[1], enabled))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    sources: Vec<SourceConfig>,
}

/// Reads a `sources:` list from YAML.
pub fn parse_sources_yaml(text: &str) -> Result<Vec<SourceConfig>> {
    let file: SourcesFile = serde_yaml::from_str(text).context("parsing sources yaml")?;
    Ok(file.sources)
}

/// Result of fetching one source.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source: SourceConfig,
    pub result: Result<Vec<Article>, AdapterError>,
}

#[derive(Debug)]
pub struct FetchBatch {
    pub run_id: Uuid,
    pub outcomes: Vec<SourceOutcome>,
}

impl FetchBatch {
    /// Articles from every source that succeeded, in source order.
    pub fn articles(&self) -> Vec<Article> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .flatten()
            .cloned()
            .collect()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.source.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sources: usize,
    pub failed_sources: Vec<String>,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub write_errors: usize,
}

/// Pulls every enabled source and feeds the article cache.
#[derive(Clone)]
pub struct IngestionFetcher {
    store: Store,
    registry: SourceRegistry,
    transport: Arc<dyn FeedTransport>,
    clock: Arc<dyn Clock>,
}

impl IngestionFetcher {
    pub fn new(store: Store, transport: Arc<dyn FeedTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: SourceRegistry::new(store.clone()),
            store,
            transport,
            clock,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Fetches all enabled sources concurrently. A failing source only empties its own outcome.
    pub async fn fetch_articles(&self) -> Result<FetchBatch> {
        let run_id = Uuid::new_v4();
        let sources = self.registry.enabled_sources().await?;
        let now = self.clock.now_utc();

        let outcomes = join_all(sources.into_iter().map(|source| async move {
            let result = self.fetch_source(run_id, &source, now).await;
            if let Err(err) = &result {
                warn!(%run_id, source = %source.name, url = %source.url, error = %err, "source fetch failed");
            }
            SourceOutcome { source, result }
        }))
        .await;

        Ok(FetchBatch { run_id, outcomes })
    }

    async fn fetch_source(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<Article>, AdapterError> {
        let body = self.transport.fetch_feed(run_id, source).await?;
        articles_from_feed(&body, &source.name, now)
    }

    /// Fetches and inserts every article into the cache; duplicates are ignored.
    pub async fn refresh_and_cache(&self) -> Result<IngestSummary> {
        let started_at = self.clock.now_utc();
        let batch = self.fetch_articles().await?;
        let articles = batch.articles();

        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        let mut write_errors = 0usize;
        for article in &articles {
            let cached = CachedArticle::from_article(article.clone(), started_at);
            match self.store.insert_article_if_absent(&cached).await {
                Ok(true) => inserted += 1,
                Ok(false) => duplicates += 1,
                Err(err) => {
                    write_errors += 1;
                    warn!(run_id = %batch.run_id, dedup_key = %cached.dedup_key, error = %err, "caching article failed");
                }
            }
        }

        let summary = IngestSummary {
            run_id: batch.run_id,
            started_at,
            sources: batch.outcomes.len(),
            failed_sources: batch
                .failed_sources()
                .into_iter()
                .map(str::to_string)
                .collect(),
            fetched: articles.len(),
            inserted,
            duplicates,
            write_errors,
        };
        info!(
            run_id = %summary.run_id,
            sources = summary.sources,
            failed = summary.failed_sources.len(),
            fetched = summary.fetched,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "ingestion run finished"
        );
        Ok(summary)
    }
}

/// The wired-up monitor: store, ingestion, search and the report scheduler.
pub struct Monitor {
    pub config: MonitorConfig,
    pub store: Store,
    pub fetcher: IngestionFetcher,
    pub search: SearchEngine,
    pub scheduler: Arc<ReportScheduler>,
}

impl Monitor {
    /// Opens the database and wires HTTP feeds, SMTP delivery and the system clock.
    pub async fn open(config: MonitorConfig) -> Result<Self> {
        let store = Store::connect(&config.store_config())
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let delivery = Arc::new(SmtpDelivery::new(store.clone()));
        Ok(Self::with_parts(
            config,
            store,
            Arc::new(http),
            delivery,
            Arc::new(SystemClock),
        ))
    }

    pub fn with_parts(
        config: MonitorConfig,
        store: Store,
        transport: Arc<dyn FeedTransport>,
        delivery: Arc<dyn Delivery>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fetcher = IngestionFetcher::new(store.clone(), transport, clock.clone());
        let search = SearchEngine::new(store.clone(), fetcher.clone(), clock.clone());
        let scheduler = Arc::new(ReportScheduler::new(
            store.clone(),
            search.clone(),
            delivery,
            clock,
            config.due_policy(),
        ));
        Self {
            config,
            store,
            fetcher,
            search,
            scheduler,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        self.fetcher.registry()
    }

    /// Installs the once-a-minute ticker when the scheduler is enabled.
    pub async fn maybe_build_ticker(&self) -> Result<Option<tokio_cron_scheduler::JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = Arc::clone(&self.scheduler)
            .build_ticker(&self.config.tick_cron)
            .await?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use chrono::TimeZone;
    use medmon_adapters::StaticFeedTransport;

    use super::*;

    pub async fn store_in(dir: &Path) -> Store {
        Store::connect(&StoreConfig::new(dir.join("monitor.db")))
            .await
            .unwrap()
    }

    pub fn utc(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, hh, mm, 0).single().unwrap()
    }

    pub fn rss(items: &[(&str, &str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(title, link, date)| {
                format!(
                    "<item><title>{title}</title><link>{link}</link><description>{title} summary</description><pubDate>{date}</pubDate></item>"
                )
            })
            .collect();
        format!("<rss version=\"2.0\"><channel><title>t</title>{body}</channel></rss>")
    }

    pub fn fetcher(store: &Store, transport: StaticFeedTransport, now: DateTime<Utc>) -> IngestionFetcher {
        IngestionFetcher::new(
            store.clone(),
            Arc::new(transport),
            Arc::new(FixedClock::utc(now)),
        )
    }
}
