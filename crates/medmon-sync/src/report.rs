use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, FixedOffset};
use medmon_core::{Article, SavedSearch};
use tokio::fs;

struct SearchInfo {
    name: String,
    include: String,
    exclude: String,
}

struct ReportRow {
    published: String,
    source: String,
    title: String,
    url: String,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate<'a> {
    job_name: &'a str,
    period_label: &'a str,
    searches: Vec<SearchInfo>,
    rows: Vec<ReportRow>,
}

/// HTML digest listing the search criteria and one row per article.
pub fn render_report(
    job_name: &str,
    period_label: &str,
    searches: &[SavedSearch],
    articles: &[Article],
) -> Result<String> {
    let searches = searches
        .iter()
        .map(|s| SearchInfo {
            name: s.name.clone(),
            include: s.include_terms.clone(),
            exclude: if s.exclude_terms.trim().is_empty() {
                "-".to_string()
            } else {
                s.exclude_terms.clone()
            },
        })
        .collect();
    let rows = articles
        .iter()
        .map(|a| ReportRow {
            published: a.published_at.format("%Y-%m-%d %H:%M").to_string(),
            source: a.source.clone(),
            title: a.title.clone(),
            url: a.url.clone(),
        })
        .collect();

    ReportTemplate {
        job_name,
        period_label,
        searches,
        rows,
    }
    .render()
    .with_context(|| format!("rendering report {job_name:?}"))
}

pub async fn export_report_html(path: &Path, html: &str) -> Result<()> {
    fs::write(path, html)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// `<prefix>_YYYYmmdd_HHMMSS.html`
pub fn default_report_filename(prefix: &str, now: DateTime<FixedOffset>) -> PathBuf {
    PathBuf::from(format!("{prefix}_{}.html", now.format("%Y%m%d_%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::utc;

    fn saved(name: &str, include: &str, exclude: &str) -> SavedSearch {
        SavedSearch {
            id: Some(1),
            name: name.to_string(),
            include_terms: include.to_string(),
            exclude_terms: exclude.to_string(),
            date_from: None,
            date_to: None,
            last_x_days: Some(1),
        }
    }

    #[test]
    fn report_lists_criteria_and_escapes_article_text() {
        let articles = vec![Article {
            title: "Lice <b>outbreak & more".to_string(),
            source: "Coast".to_string(),
            published_at: utc(2026, 6, 1, 7, 5),
            url: "https://coast.test/a?x=1&y=2".to_string(),
            summary: String::new(),
        }];
        let html = render_report(
            "Morning digest",
            "2026-05-31 to 2026-06-01",
            &[saved("Salmon", "\"fish farm\" lice", "")],
            &articles,
        )
        .unwrap();

        assert!(html.contains("<h2>Morning digest</h2>"));
        assert!(html.contains("2026-05-31 to 2026-06-01"));
        assert!(html.contains("exclude [-]"));
        assert!(html.contains("2026-06-01 07:05"));
        assert!(html.contains("Lice &lt;b&gt;outbreak &amp; more"));
        assert!(!html.contains("No matches."));
    }

    #[test]
    fn empty_report_has_placeholder_row() {
        let html = render_report("Empty", "x", &[], &[]).unwrap();
        assert!(html.contains("No matches."));
    }

    #[test]
    fn default_filename_uses_local_timestamp() {
        let now = utc(2026, 6, 1, 7, 5).fixed_offset();
        assert_eq!(
            default_report_filename("search", now),
            PathBuf::from("search_20260601_070500.html")
        );
    }

    #[tokio::test]
    async fn export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.html");
        export_report_html(&path, "<html></html>").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<html></html>");
    }
}
