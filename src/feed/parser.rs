use chrono::{DateTime, Datelike, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};

/// A parsed feed document: the channel title and its items.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

/// One item from a feed document, before guid/date normalization.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    /// Feed-supplied identifier, if any.
    pub guid: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub content_html: Option<String>,
}

/// Parse a feed body into title + items.
///
/// Total: malformed input yields an empty entry list, never an error.
/// The reconciler treats an empty list the same as a feed with no new
/// items, so a garbage body degrades to a no-op rather than a failure.
pub fn parse_feed(bytes: &[u8]) -> ParsedFeed {
    let feed = match parser::parse(bytes) {
        Ok(feed) => feed,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable feed body, treating as empty");
            return ParsedFeed::default();
        }
    };

    let title = feed
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            // Prefer full content, fall back to the summary
            let content_html = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content));
            let guid = if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id.trim().to_string())
            };

            ParsedEntry {
                guid,
                title: entry.title.map(|t| t.content.trim().to_string()),
                link,
                published: entry.published,
                updated: entry.updated,
                content_html,
            }
        })
        .collect();

    ParsedFeed { title, entries }
}

/// Deduplication identity for an entry within its feed.
///
/// The feed-supplied id wins when present. Otherwise the guid is a
/// SHA-256 over `(link, title, raw published time)` — deterministic, so
/// repeated fetches of the same logical item hash identically and the
/// `UNIQUE(feed_id, guid)` constraint deduplicates them.
pub fn stable_guid(entry: &ParsedEntry) -> String {
    if let Some(guid) = &entry.guid {
        return guid.clone();
    }

    let published_raw = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp().to_string())
        .unwrap_or_default();
    let input = format!(
        "{}\n{}\n{}",
        entry.link.as_deref().unwrap_or(""),
        entry.title.as_deref().unwrap_or(""),
        published_raw
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// Publish timestamp with the date-safety policy applied.
///
/// Some feeds carry corrupt years (0001, 9999); a publish date outside
/// `[1971, currentYear + 5]` is untrusted and replaced with `now`, as is
/// a missing date. Prefers `published`, falls back to `updated`. Total —
/// never fails, a bad date degrades to "now".
pub fn entry_published_ts(entry: &ParsedEntry, now: DateTime<Utc>) -> i64 {
    let Some(dt) = entry.published.or(entry.updated) else {
        return now.timestamp();
    };

    let year = dt.year();
    if year < 1971 || year > now.year() + 5 {
        return now.timestamp();
    }
    dt.timestamp()
}
