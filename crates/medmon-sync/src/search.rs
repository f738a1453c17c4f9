use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use medmon_core::{Article, SavedSearch};
use medmon_storage::Store;
use tracing::debug;

use crate::{Clock, IngestionFetcher};

/// Splits query text into lowercase terms: quoted phrases first, then the
/// remaining words split on whitespace and commas.
pub fn parse_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut remaining = String::with_capacity(text.len());
    let mut rest = text.trim();

    while let Some(open) = rest.find('"') {
        let after = &rest[open + 1..];
        match after.find('"') {
            // `""` holds no phrase; the second quote may still open one.
            Some(0) => {
                remaining.push_str(&rest[..=open]);
                rest = after;
            }
            Some(close) => {
                remaining.push_str(&rest[..open]);
                remaining.push(' ');
                let phrase = after[..close].trim().to_lowercase();
                if !phrase.is_empty() {
                    terms.push(phrase);
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    remaining.push_str(rest);

    terms.extend(
        remaining
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|word| !word.is_empty())
            .map(str::to_lowercase),
    );
    terms
}

/// True when every include term and no exclude term occurs in `title + " " + summary`.
pub fn matches(article: &Article, include: &[String], exclude: &[String]) -> bool {
    let haystack = format!("{} {}", article.title, article.summary).to_lowercase();
    include.iter().all(|term| haystack.contains(term.as_str()))
        && !exclude.iter().any(|term| haystack.contains(term.as_str()))
}

/// Inclusive UTC interval searched in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A non-zero `last_x_days` wins over explicit dates and reaches back no
/// further than the earliest representable instant. Otherwise the window
/// defaults to the last day; `date_from` starts at midnight UTC and `date_to`
/// covers its whole day.
pub fn resolve_range(
    now: DateTime<Utc>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    last_x_days: Option<u32>,
) -> TimeWindow {
    if let Some(days) = last_x_days.filter(|d| *d > 0) {
        return TimeWindow {
            start: now
                .checked_sub_signed(Duration::days(i64::from(days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: now,
        };
    }
    let start = date_from
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or_else(|| now - Duration::days(1));
    let end = date_to
        .and_then(|d| d.and_hms_micro_opt(23, 59, 59, 999_999))
        .map(|dt| dt.and_utc())
        .unwrap_or(now);
    TimeWindow { start, end }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub include_text: String,
    pub exclude_text: String,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub last_x_days: Option<u32>,
}

impl From<&SavedSearch> for SearchQuery {
    fn from(saved: &SavedSearch) -> Self {
        Self {
            include_text: saved.include_terms.clone(),
            exclude_text: saved.exclude_terms.clone(),
            date_from: saved.date_from,
            date_to: saved.date_to,
            last_x_days: saved.last_x_days,
        }
    }
}

#[derive(Clone)]
pub struct SearchEngine {
    store: Store,
    fetcher: IngestionFetcher,
    clock: Arc<dyn Clock>,
}

impl SearchEngine {
    pub fn new(store: Store, fetcher: IngestionFetcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fetcher,
            clock,
        }
    }

    pub fn fetcher(&self) -> &IngestionFetcher {
        &self.fetcher
    }

    /// Matching cached articles, newest first. With `refresh`, sources are
    /// ingested before the cache is read.
    pub async fn run_search(&self, query: &SearchQuery, refresh: bool) -> Result<Vec<Article>> {
        if refresh {
            self.fetcher
                .refresh_and_cache()
                .await
                .context("refreshing article cache")?;
        }

        let include = parse_terms(&query.include_text);
        let exclude = parse_terms(&query.exclude_text);
        let window = resolve_range(
            self.clock.now_utc(),
            query.date_from,
            query.date_to,
            query.last_x_days,
        );

        let cached = self
            .store
            .articles_between(window.start, window.end)
            .await
            .context("reading cached articles")?;
        let scanned = cached.len();
        let results: Vec<Article> = cached
            .into_iter()
            .map(|c| c.article)
            .filter(|article| matches(article, &include, &exclude))
            .collect();

        debug!(
            start = %window.start,
            end = %window.end,
            scanned,
            matched = results.len(),
            "search finished"
        );
        Ok(results)
    }

    pub async fn run_saved(&self, saved: &SavedSearch, refresh: bool) -> Result<Vec<Article>> {
        self.run_search(&SearchQuery::from(saved), refresh)
            .await
            .with_context(|| format!("running saved search {:?}", saved.name))
    }
}
