//! SQLite-backed persistence for settings, saved searches, report jobs and the article cache.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use medmon_core::{
    Article, CachedArticle, Frequency, ReportJob, SavedSearch, SearchIds, SendTime,
    ValidationError,
};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("setting {key} holds invalid json: {source}")]
    Json {
        key: String,
        source: serde_json::Error,
    },
    #[error("invalid {table} row {id}: {reason}")]
    InvalidRow {
        table: &'static str,
        id: i64,
        reason: String,
    },
    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: i64 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            max_connections: 5,
        }
    }
}

/// Fixed-width UTC text so lexical comparison in SQL matches chronological order.
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database file and applies pending migrations.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get(&self, key: &str, default: &str) -> Result<String, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or_else(|| default.to_string()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings(key, value) VALUES(?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `default` when the key is absent or empty.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StoreError> {
        let raw = self.get(key, "").await?;
        if raw.trim().is_empty() {
            return Ok(default);
        }
        serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw).await
    }

    pub async fn list_searches(&self) -> Result<Vec<SavedSearch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, include_terms, exclude_terms, date_from, date_to, last_x_days
              FROM searches
             ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(search_from_row).collect()
    }

    pub async fn get_search(&self, id: i64) -> Result<Option<SavedSearch>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, include_terms, exclude_terms, date_from, date_to, last_x_days
              FROM searches
             WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(search_from_row).transpose()
    }

    /// Inserts when `id` is absent, updates otherwise. Returns the row id.
    pub async fn save_search(&self, search: &SavedSearch) -> Result<i64, StoreError> {
        search.validate()?;
        let date_from = search.date_from.map(|d| d.format(DATE_FORMAT).to_string());
        let date_to = search.date_to.map(|d| d.format(DATE_FORMAT).to_string());
        let last_x_days = search.last_x_days.map(i64::from);

        match search.id {
            Some(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE searches
                       SET name = ?, include_terms = ?, exclude_terms = ?,
                           date_from = ?, date_to = ?, last_x_days = ?
                     WHERE id = ?
                    "#,
                )
                .bind(&search.name)
                .bind(&search.include_terms)
                .bind(&search.exclude_terms)
                .bind(date_from)
                .bind(date_to)
                .bind(last_x_days)
                .bind(id)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound { table: "searches", id });
                }
                Ok(id)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO searches(name, include_terms, exclude_terms, date_from, date_to, last_x_days)
                    VALUES(?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&search.name)
                .bind(&search.include_terms)
                .bind(&search.exclude_terms)
                .bind(date_from)
                .bind(date_to)
                .bind(last_x_days)
                .execute(&self.pool)
                .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    pub async fn delete_search(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM searches WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_report_jobs(&self) -> Result<Vec<ReportJob>, StoreError> {
        self.scan_report_jobs().await?.into_iter().collect()
    }

    /// Every job row mapped individually, so one malformed row does not hide the others.
    pub async fn scan_report_jobs(&self) -> Result<Vec<Result<ReportJob, StoreError>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, search_ids_csv, frequency, send_time, recipient,
                   enabled, last_run_at, last_status
              FROM report_jobs
             ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(report_job_from_row).collect())
    }

    pub async fn get_report_job(&self, id: i64) -> Result<Option<ReportJob>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, search_ids_csv, frequency, send_time, recipient,
                   enabled, last_run_at, last_status
              FROM report_jobs
             WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(report_job_from_row).transpose()
    }

    /// Inserts or updates the job definition. Updates leave run status untouched.
    pub async fn save_report_job(&self, job: &ReportJob) -> Result<i64, StoreError> {
        job.validate()?;
        match job.id {
            Some(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE report_jobs
                       SET name = ?, search_ids_csv = ?, frequency = ?, send_time = ?,
                           recipient = ?, enabled = ?
                     WHERE id = ?
                    "#,
                )
                .bind(&job.name)
                .bind(job.search_ids.to_csv())
                .bind(job.frequency.as_str())
                .bind(job.send_time.to_string())
                .bind(&job.recipient)
                .bind(job.enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound { table: "report_jobs", id });
                }
                Ok(id)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO report_jobs(name, search_ids_csv, frequency, send_time, recipient,
                                            enabled, last_run_at, last_status)
                    VALUES(?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&job.name)
                .bind(job.search_ids.to_csv())
                .bind(job.frequency.as_str())
                .bind(job.send_time.to_string())
                .bind(&job.recipient)
                .bind(job.enabled)
                .bind(job.last_run_at.map(encode_timestamp))
                .bind(&job.last_status)
                .execute(&self.pool)
                .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    pub async fn delete_report_job(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM report_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_report_status(
        &self,
        id: i64,
        ran_at: DateTime<Utc>,
        status: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE report_jobs SET last_run_at = ?, last_status = ? WHERE id = ?")
            .bind(encode_timestamp(ran_at))
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks the job as run at `ran_at` unless it already ran at or after
    /// `slot_start`. Returns `true` when this caller won the slot.
    pub async fn claim_report_slot(
        &self,
        id: i64,
        ran_at: DateTime<Utc>,
        slot_start: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE report_jobs
               SET last_run_at = ?
             WHERE id = ?
               AND (last_run_at IS NULL OR last_run_at < ?)
            "#,
        )
        .bind(encode_timestamp(ran_at))
        .bind(id)
        .bind(encode_timestamp(slot_start))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Single-statement insert-or-ignore keyed on `dedup_key`; the first writer wins.
    /// Returns `true` when a new row was written.
    pub async fn insert_article_if_absent(&self, cached: &CachedArticle) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO article_cache(dedup_key, title, source, published_at, url, summary, fetched_at)
            VALUES(?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(&cached.dedup_key)
        .bind(&cached.article.title)
        .bind(&cached.article.source)
        .bind(encode_timestamp(cached.article.published_at))
        .bind(&cached.article.url)
        .bind(&cached.article.summary)
        .bind(encode_timestamp(cached.fetched_at))
        .execute(&self.pool)
        .await?;
        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(dedup_key = %cached.dedup_key, "article already cached");
        }
        Ok(inserted)
    }

    /// Cached articles published within `[from, to]`, newest first.
    pub async fn articles_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CachedArticle>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, dedup_key, title, source, published_at, url, summary, fetched_at
              FROM article_cache
             WHERE published_at BETWEEN ? AND ?
             ORDER BY published_at DESC
            "#,
        )
        .bind(encode_timestamp(from))
        .bind(encode_timestamp(to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cached_article_from_row).collect()
    }

    pub async fn count_cached_articles(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM article_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn invalid(table: &'static str, id: i64, reason: impl ToString) -> StoreError {
    StoreError::InvalidRow {
        table,
        id,
        reason: reason.to_string(),
    }
}

fn parse_optional_date(
    table: &'static str,
    id: i64,
    value: Option<String>,
) -> Result<Option<NaiveDate>, StoreError> {
    value
        .filter(|s| !s.trim().is_empty())
        .map(|s| NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|e| invalid(table, id, e)))
        .transpose()
}

fn search_from_row(row: &SqliteRow) -> Result<SavedSearch, StoreError> {
    let id: i64 = row.try_get("id")?;
    let last_x_days: Option<i64> = row.try_get("last_x_days")?;
    let last_x_days = last_x_days
        .map(|days| u32::try_from(days).map_err(|e| invalid("searches", id, e)))
        .transpose()?;
    let exclude_terms: Option<String> = row.try_get("exclude_terms")?;

    Ok(SavedSearch {
        id: Some(id),
        name: row.try_get("name")?,
        include_terms: row.try_get("include_terms")?,
        exclude_terms: exclude_terms.unwrap_or_default(),
        date_from: parse_optional_date("searches", id, row.try_get("date_from")?)?,
        date_to: parse_optional_date("searches", id, row.try_get("date_to")?)?,
        last_x_days,
    })
}

fn report_job_from_row(row: &SqliteRow) -> Result<ReportJob, StoreError> {
    let id: i64 = row.try_get("id")?;
    let frequency: String = row.try_get("frequency")?;
    let send_time: String = row.try_get("send_time")?;
    let search_ids_csv: String = row.try_get("search_ids_csv")?;
    let enabled: i64 = row.try_get("enabled")?;
    let last_run_at: Option<String> = row.try_get("last_run_at")?;

    Ok(ReportJob {
        id: Some(id),
        name: row.try_get("name")?,
        search_ids: SearchIds::from_csv(&search_ids_csv),
        frequency: frequency
            .parse::<Frequency>()
            .map_err(|e| invalid("report_jobs", id, e))?,
        send_time: send_time
            .parse::<SendTime>()
            .map_err(|e| invalid("report_jobs", id, e))?,
        recipient: row.try_get("recipient")?,
        enabled: enabled != 0,
        last_run_at: last_run_at
            .map(|ts| decode_timestamp(&ts).map_err(|e| invalid("report_jobs", id, e)))
            .transpose()?,
        last_status: row.try_get("last_status")?,
    })
}

fn cached_article_from_row(row: &SqliteRow) -> Result<CachedArticle, StoreError> {
    let id: i64 = row.try_get("id")?;
    let published_at: String = row.try_get("published_at")?;
    let fetched_at: String = row.try_get("fetched_at")?;
    let url: Option<String> = row.try_get("url")?;
    let summary: Option<String> = row.try_get("summary")?;

    Ok(CachedArticle {
        id: Some(id),
        dedup_key: row.try_get("dedup_key")?,
        article: Article {
            title: row.try_get("title")?,
            source: row.try_get("source")?,
            published_at: decode_timestamp(&published_at)
                .map_err(|e| invalid("article_cache", id, e))?,
            url: url.unwrap_or_default(),
            summary: summary.unwrap_or_default(),
        },
        fetched_at: decode_timestamp(&fetched_at).map_err(|e| invalid("article_cache", id, e))?,
    })
}
