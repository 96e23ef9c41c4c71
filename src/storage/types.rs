use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-layer errors with user-friendly messages.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The feeds table enforces URL uniqueness; this surfaces the
    /// constraint violation as a typed error.
    #[error("A feed with that URL already exists")]
    DuplicateUrl,

    /// Lookup by id found nothing.
    #[error("Unknown feed: {0}")]
    FeedNotFound(i64),

    /// Lookup by entry id found nothing.
    #[error("Unknown entry: {0}")]
    EntryNotFound(i64),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StorageError {
    /// Map a sqlx error, detecting unique-constraint violations on the
    /// feed URL column.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StorageError::DuplicateUrl;
            }
        }
        StorageError::Other(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed row, including the scheduling fields driven by the reconciler.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    /// Stable unique identity of the feed.
    pub url: String,
    /// Display title, learned from the feed body on first successful
    /// fetch; never overwritten once set.
    pub title: Option<String>,
    /// Conditional-request cache: opaque ETag from the last 200 response.
    pub etag: Option<String>,
    /// Conditional-request cache: opaque Last-Modified header value.
    pub last_modified: Option<String>,
    /// Epoch seconds of the last fetch attempt (any outcome).
    pub last_fetch: Option<i64>,
    /// Consecutive failure streak; 0 after any ok/not-modified result.
    pub fail_count: i64,
    /// Epoch seconds at which the feed becomes due again.
    pub next_fetch: i64,
    /// Number of this feed's entries newer than the retention cutoff.
    pub month_count: i64,
    /// Epoch seconds of the last successful (200) fetch.
    pub last_ok: i64,
}

/// Entry row. Identity is `(feed_id, guid)`; rows are immutable after
/// insertion except for `read_at` and `bookmarked`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    /// Clamped epoch seconds (see the parser's date-safety policy).
    pub published: i64,
    pub content_html: Option<String>,
    /// NULL = unread.
    pub read_at: Option<i64>,
    pub bookmarked: bool,
    pub created_at: i64,
}

/// Entry joined with its feed's display fields, for listings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryListItem {
    pub id: i64,
    pub feed_id: i64,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: i64,
    pub content_html: Option<String>,
    pub read_at: Option<i64>,
    pub bookmarked: bool,
    pub feed_title: Option<String>,
    pub month_count: i64,
}

/// Filter mode for entry listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFilter {
    /// Unread entries within the retention window (the default view).
    Unread,
    /// Read entries within the retention window.
    Read,
    /// All bookmarked entries, regardless of age.
    Bookmarked,
    /// Everything within the retention window.
    All,
}

/// Aggregate counts for the user-facing layer.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub feeds: i64,
    pub unread: i64,
    pub bookmarked: i64,
}

/// Outcome of a bulk feed import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    /// Feeds newly inserted.
    pub imported: usize,
    /// Feeds skipped because their URL already existed.
    pub skipped: usize,
}
