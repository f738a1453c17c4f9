//! Core domain model for the media monitor: articles, saved searches, report jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "medmon-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("invalid send time {0:?}, expected HH:MM")]
    SendTime(String),
    #[error("unknown frequency {0:?}, expected Daily, Weekly or Monthly")]
    Frequency(String),
    #[error("source {name:?} has unsupported url {url:?}")]
    SourceUrl { name: String, url: String },
}

/// A normalized feed item. `published_at` is always UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub summary: String,
}

impl Article {
    /// Identity used to collapse re-announced items into one cache row.
    ///
    /// URL-bearing items are keyed by their normalized URL; anything else falls
    /// back to title, publication date and source.
    pub fn dedup_key(&self) -> String {
        let url = self.url.trim();
        if !url.is_empty() {
            return format!("url:{}", url.to_lowercase());
        }
        format!(
            "fallback:{}|{}|{}",
            self.title.trim().to_lowercase(),
            self.published_at.date_naive().format("%Y-%m-%d"),
            self.source.trim().to_lowercase()
        )
    }
}

/// Persisted projection of an [`Article`]. Written once by ingestion, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArticle {
    pub id: Option<i64>,
    pub dedup_key: String,
    pub article: Article,
    pub fetched_at: DateTime<Utc>,
}

impl CachedArticle {
    pub fn from_article(article: Article, fetched_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            dedup_key: article.dedup_key(),
            article,
            fetched_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "Daily",
            Frequency::Weekly => "Weekly",
            Frequency::Monthly => "Monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            _ => Err(ValidationError::Frequency(s.to_string())),
        }
    }
}

/// Wall-clock hour and minute (24h) at which a report job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendTime {
    pub hour: u32,
    pub minute: u32,
}

impl SendTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ValidationError> {
        if hour > 23 || minute > 59 {
            return Err(ValidationError::SendTime(format!("{hour}:{minute}")));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for SendTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for SendTime {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::SendTime(s.to_string());
        let (hh, mm) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hh.trim().parse::<u32>().map_err(|_| invalid())?;
        let minute = mm.trim().parse::<u32>().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

/// Ordered, duplicate-free list of saved search ids referenced by a report job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchIds(Vec<i64>);

impl SearchIds {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        let mut out = Vec::new();
        for id in ids {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        Self(out)
    }

    /// Parses the stored comma-separated form. Non-numeric fragments are dropped.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
                .filter_map(|s| s.parse::<i64>().ok()),
        )
    }

    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn contains(&self, id: i64) -> bool {
        self.0.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A reusable query definition: include/exclude term text plus a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: Option<i64>,
    pub name: String,
    pub include_terms: String,
    pub exclude_terms: String,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub last_x_days: Option<u32>,
}

impl SavedSearch {
    /// `last_x_days` only counts when non-zero.
    pub fn effective_last_x_days(&self) -> Option<u32> {
        self.last_x_days.filter(|days| *days > 0)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty { field: "name" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: Option<i64>,
    pub name: String,
    pub search_ids: SearchIds,
    pub frequency: Frequency,
    pub send_time: SendTime,
    pub recipient: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

impl ReportJob {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty { field: "name" });
        }
        if self.recipient.trim().is_empty() {
            return Err(ValidationError::Empty { field: "recipient" });
        }
        Ok(())
    }
}

/// Outcome recorded on a report job after each attempted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Error(String),
}

impl RunStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunStatus::Ok)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => f.write_str("OK"),
            RunStatus::Error(message) => write!(f, "ERROR: {message}"),
        }
    }
}

/// A configured feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty { field: "source name" });
        }
        let url = self.url.trim().to_ascii_lowercase();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ValidationError::SourceUrl {
                name: self.name.clone(),
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn article(title: &str, url: &str) -> Article {
        Article {
            title: title.to_string(),
            source: " BBC World ".to_string(),
            published_at: Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap(),
            url: url.to_string(),
            summary: String::new(),
        }
    }

    #[test]
    fn dedup_key_prefers_normalized_url() {
        let a = article("Anything", "  https://Example.com/News/1 ");
        assert_eq!(a.dedup_key(), "url:https://example.com/news/1");
    }

    #[test]
    fn dedup_key_falls_back_to_title_date_source() {
        let a = article("  Salmon Lice Outbreak ", "");
        assert_eq!(
            a.dedup_key(),
            "fallback:salmon lice outbreak|2026-03-02|bbc world"
        );
    }

    #[test]
    fn cached_article_carries_dedup_key() {
        let a = article("x", "https://example.com/a");
        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();
        let cached = CachedArticle::from_article(a.clone(), fetched_at);
        assert_eq!(cached.dedup_key, a.dedup_key());
        assert_eq!(cached.id, None);
    }

    #[test]
    fn frequency_parses_case_insensitively() {
        assert_eq!("weekly".parse::<Frequency>().unwrap(), Frequency::Weekly);
        assert_eq!(" Monthly ".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert!("hourly".parse::<Frequency>().is_err());
        assert_eq!(Frequency::Daily.to_string(), "Daily");
    }

    #[test]
    fn send_time_parses_and_rejects_out_of_range() {
        let t: SendTime = "8:05".parse().unwrap();
        assert_eq!(t, SendTime { hour: 8, minute: 5 });
        assert_eq!(t.to_string(), "08:05");
        assert!("24:00".parse::<SendTime>().is_err());
        assert!("08:60".parse::<SendTime>().is_err());
        assert!("0800".parse::<SendTime>().is_err());
        assert!("ab:cd".parse::<SendTime>().is_err());
    }

    #[test]
    fn search_ids_keep_order_and_drop_junk() {
        let ids = SearchIds::from_csv("3, 1,x,,3,-2, 7");
        assert_eq!(ids.as_slice(), &[3, 1, 7]);
        assert_eq!(ids.to_csv(), "3,1,7");
        assert!(SearchIds::from_csv("").is_empty());
    }

    #[test]
    fn zero_last_x_days_is_ignored() {
        let mut search = SavedSearch {
            id: None,
            name: "fish".into(),
            include_terms: "salmon".into(),
            exclude_terms: String::new(),
            date_from: None,
            date_to: None,
            last_x_days: Some(0),
        };
        assert_eq!(search.effective_last_x_days(), None);
        search.last_x_days = Some(7);
        assert_eq!(search.effective_last_x_days(), Some(7));
    }

    #[test]
    fn run_status_renders_stored_text() {
        assert_eq!(RunStatus::Ok.to_string(), "OK");
        assert_eq!(
            RunStatus::Error("smtp down".into()).to_string(),
            "ERROR: smtp down"
        );
    }

    #[test]
    fn source_config_validation() {
        assert!(SourceConfig::new("BBC", "http://feeds.bbci.co.uk/news/rss.xml", true)
            .validate()
            .is_ok());
        assert!(SourceConfig::new("", "https://x.test/rss", true).validate().is_err());
        assert!(SourceConfig::new("Bad", "ftp://x.test/rss", true).validate().is_err());
    }

    #[test]
    fn source_config_enabled_defaults_to_true() {
        let parsed: SourceConfig =
            serde_json::from_str(r#"{"name":"AP","url":"https://feeds.apnews.com/apf-topnews"}"#)
                .unwrap();
        assert!(parsed.enabled);
    }
}
