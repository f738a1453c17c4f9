//! Feed transport contract plus RSS 2.0 / Atom parsing into normalized articles.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use medmon_core::{Article, SourceConfig};
use medmon_storage::{FetchError, HttpFetcher};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Decoder, Reader};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "medmon-adapters";

/// Failure to obtain usable entries from one source.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
}

/// Raw bytes of one source's feed document.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn fetch_feed(&self, run_id: Uuid, source: &SourceConfig) -> Result<Vec<u8>, AdapterError>;
}

#[async_trait]
impl FeedTransport for HttpFetcher {
    async fn fetch_feed(&self, run_id: Uuid, source: &SourceConfig) -> Result<Vec<u8>, AdapterError> {
        let response = self.fetch_bytes(run_id, &source.name, source.url.trim()).await?;
        Ok(response.body)
    }
}

/// Fixed responses keyed by URL, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFeedTransport {
    responses: HashMap<String, Result<Vec<u8>, String>>,
}

impl StaticFeedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.into(), Ok(body.into()));
        self
    }

    pub fn with_failure(mut self, url: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses.insert(url.into(), Err(message.into()));
        self
    }
}

#[async_trait]
impl FeedTransport for StaticFeedTransport {
    async fn fetch_feed(&self, _run_id: Uuid, source: &SourceConfig) -> Result<Vec<u8>, AdapterError> {
        match self.responses.get(source.url.trim()) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(AdapterError::Message(message.clone())),
            None => Err(AdapterError::Message(format!("no response for {}", source.url))),
        }
    }
}

/// One `<item>` / `<entry>` as found in the document, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub published: Option<String>,
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryField {
    Title,
    Link,
    Summary,
    Content,
    Published,
    Updated,
    Guid { permalink: bool },
}

impl EntryField {
    fn from_element(element: &BytesStart<'_>, decoder: Decoder) -> Option<Self> {
        match element.local_name().as_ref() {
            b"title" => Some(Self::Title),
            b"link" => Some(Self::Link),
            b"description" | b"summary" => Some(Self::Summary),
            b"content" | b"encoded" => Some(Self::Content),
            b"pubDate" | b"published" | b"date" | b"issued" => Some(Self::Published),
            b"updated" | b"modified" => Some(Self::Updated),
            b"guid" => Some(Self::Guid {
                permalink: attribute(element, b"isPermaLink", decoder)
                    .map(|v| !v.eq_ignore_ascii_case("false"))
                    .unwrap_or(true),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct EntryBuilder {
    entry: FeedEntry,
    content: String,
    guid_link: Option<String>,
}

impl EntryBuilder {
    fn set(&mut self, field: EntryField, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let slot = match field {
            EntryField::Title => &mut self.entry.title,
            EntryField::Link => &mut self.entry.link,
            EntryField::Summary => &mut self.entry.summary,
            EntryField::Content => &mut self.content,
            EntryField::Published => {
                self.entry.published.get_or_insert(text);
                return;
            }
            EntryField::Updated => {
                self.entry.updated.get_or_insert(text);
                return;
            }
            EntryField::Guid { permalink } => {
                if permalink && (text.starts_with("http://") || text.starts_with("https://")) {
                    self.guid_link.get_or_insert(text);
                }
                return;
            }
        };
        if slot.is_empty() {
            *slot = text;
        }
    }

    /// Atom links live in attributes; the alternate (or rel-less) one is the article.
    fn offer_atom_link(&mut self, element: &BytesStart<'_>, decoder: Decoder) {
        if !self.entry.link.is_empty() {
            return;
        }
        let rel = attribute(element, b"rel", decoder);
        if !matches!(rel.as_deref(), None | Some("alternate")) {
            return;
        }
        if let Some(href) = attribute(element, b"href", decoder) {
            self.entry.link = href.trim().to_string();
        }
    }

    fn finish(mut self) -> FeedEntry {
        if self.entry.summary.is_empty() {
            self.entry.summary = self.content;
        }
        if self.entry.link.is_empty() {
            if let Some(guid) = self.guid_link {
                self.entry.link = guid;
            }
        }
        self.entry
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8], decoder: Decoder) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .and_then(|attr| {
            attr.decode_and_unescape_value(decoder)
                .ok()
                .map(|v| v.into_owned())
        })
}

/// XML's five entities plus the HTML ones feeds commonly leak into titles.
fn resolve_feed_entity(name: &str) -> Option<&'static str> {
    resolve_predefined_entity(name).or(match name {
        "nbsp" => Some(" "),
        "ndash" => Some("\u{2013}"),
        "mdash" => Some("\u{2014}"),
        "hellip" => Some("\u{2026}"),
        "lsquo" => Some("\u{2018}"),
        "rsquo" => Some("\u{2019}"),
        "ldquo" => Some("\u{201c}"),
        "rdquo" => Some("\u{201d}"),
        "laquo" => Some("\u{ab}"),
        "raquo" => Some("\u{bb}"),
        "aelig" => Some("\u{e6}"),
        "AElig" => Some("\u{c6}"),
        "oslash" => Some("\u{f8}"),
        "Oslash" => Some("\u{d8}"),
        "aring" => Some("\u{e5}"),
        "Aring" => Some("\u{c5}"),
        "eacute" => Some("\u{e9}"),
        "copy" => Some("\u{a9}"),
        _ => None,
    })
}

/// Unescaped text; on an unknown entity the decoded text is kept as written
/// so one bad field never costs the whole feed.
fn text_content(text: &BytesText<'_>, decoder: Decoder) -> String {
    match text.unescape_with(resolve_feed_entity) {
        Ok(value) => value.into_owned(),
        Err(err) => {
            tracing::debug!(error = %err, "keeping text with unresolved entity as written");
            decode_lossy(text, decoder)
        }
    }
}

fn decode_lossy(bytes: &[u8], decoder: Decoder) -> String {
    match decoder.decode(bytes) {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_entry(element: &[u8]) -> bool {
    matches!(element, b"item" | b"entry")
}

fn is_feed_root(element: &[u8]) -> bool {
    matches!(element, b"rss" | b"feed" | b"RDF" | b"channel")
}

/// Extracts entries from an RSS 2.0, RSS 1.0 (RDF) or Atom document.
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedEntry>, AdapterError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut entries = Vec::new();
    let mut saw_root = false;
    let mut depth = 0usize;
    let mut current: Option<(usize, EntryBuilder)> = None;
    let mut field: Option<(EntryField, String)> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| AdapterError::Parse(format!("at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(element) => {
                depth += 1;
                let name = element.local_name();
                saw_root |= is_feed_root(name.as_ref());
                match &mut current {
                    None if is_entry(name.as_ref()) => {
                        current = Some((depth, EntryBuilder::default()));
                    }
                    Some((entry_depth, builder)) if depth == *entry_depth + 1 && field.is_none() => {
                        if name.as_ref() == b"link" {
                            builder.offer_atom_link(&element, reader.decoder());
                        }
                        field = EntryField::from_element(&element, reader.decoder())
                            .map(|f| (f, String::new()));
                    }
                    _ => {}
                }
            }
            Event::Empty(element) => {
                if let Some((entry_depth, builder)) = &mut current {
                    if depth == *entry_depth && element.local_name().as_ref() == b"link" {
                        builder.offer_atom_link(&element, reader.decoder());
                    }
                }
            }
            Event::Text(text) => {
                if let Some((_, buffer)) = &mut field {
                    push_text(buffer, &text_content(&text, reader.decoder()));
                }
            }
            Event::CData(data) => {
                if let Some((_, buffer)) = &mut field {
                    push_text(buffer, &decode_lossy(&data, reader.decoder()));
                }
            }
            Event::End(element) => {
                if let Some((entry_depth, builder)) = &mut current {
                    if depth == *entry_depth + 1 {
                        if let Some((f, text)) = field.take() {
                            builder.set(f, text);
                        }
                    }
                    if depth == *entry_depth && is_entry(element.local_name().as_ref()) {
                        if let Some((_, builder)) = current.take() {
                            entries.push(builder.finish());
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(AdapterError::Parse(
            "document is not an RSS or Atom feed".to_string(),
        ));
    }
    Ok(entries)
}

fn push_text(buffer: &mut String, text: &str) {
    if !buffer.is_empty() && !text.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(text);
}

/// Parses the date formats seen in feeds. Naive timestamps are taken as UTC.
pub fn parse_feed_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Published date, else updated date, else `now`.
pub fn extract_published(entry: &FeedEntry, now: DateTime<Utc>) -> DateTime<Utc> {
    entry
        .published
        .as_deref()
        .and_then(parse_feed_date)
        .or_else(|| entry.updated.as_deref().and_then(parse_feed_date))
        .unwrap_or(now)
}

/// Entries without a title are dropped.
pub fn entry_to_article(entry: &FeedEntry, source_name: &str, now: DateTime<Utc>) -> Option<Article> {
    let title = entry.title.trim();
    if title.is_empty() {
        return None;
    }
    Some(Article {
        title: title.to_string(),
        source: source_name.to_string(),
        published_at: extract_published(entry, now),
        url: entry.link.trim().to_string(),
        summary: entry.summary.trim().to_string(),
    })
}

pub fn articles_from_feed(
    body: &[u8],
    source_name: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Article>, AdapterError> {
    let entries = parse_feed(body)?;
    let articles: Vec<Article> = entries
        .iter()
        .filter_map(|entry| entry_to_article(entry, source_name, now))
        .collect();
    if articles.len() < entries.len() {
        tracing::debug!(
            source = source_name,
            skipped = entries.len() - articles.len(),
            "dropped untitled feed entries"
        );
    }
    Ok(articles)
}
