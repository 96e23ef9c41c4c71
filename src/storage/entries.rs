use super::schema::Database;
use super::types::{Entry, EntryFilter, EntryListItem, Stats, StorageError};
use crate::util::now_ts;

impl Database {
    // ========================================================================
    // Entry Operations (user-facing layer)
    // ========================================================================
    //
    // Entries are created only by the reconciler during a sweep; this
    // module covers the read side plus the two mutable per-entry fields,
    // `read_at` and `bookmarked`.

    /// List entries for display, joined with their feed's title and
    /// volume count. Low-volume feeds sort first so rare items are not
    /// drowned out by firehose feeds; within a feed, newest first.
    pub async fn list_entries(
        &self,
        filter: EntryFilter,
        cutoff: i64,
        limit: i64,
    ) -> Result<Vec<EntryListItem>, StorageError> {
        let limit = limit.clamp(1, 5000);

        let (where_clause, needs_cutoff) = match filter {
            EntryFilter::Read => ("e.read_at IS NOT NULL AND e.published >= ?", true),
            EntryFilter::Bookmarked => ("e.bookmarked = 1", false),
            EntryFilter::All => ("e.published >= ?", true),
            EntryFilter::Unread => ("e.read_at IS NULL AND e.published >= ?", true),
        };

        let query = format!(
            "SELECT e.id, e.feed_id, e.title, e.link, e.published, e.content_html, \
                    e.read_at, e.bookmarked, f.title AS feed_title, f.month_count \
             FROM entries e \
             JOIN feeds f ON f.id = e.feed_id \
             WHERE {where_clause} \
             ORDER BY f.month_count ASC, e.published DESC \
             LIMIT ?"
        );

        let mut q = sqlx::query_as::<_, EntryListItem>(&query);
        if needs_cutoff {
            q = q.bind(cutoff);
        }
        Ok(q.bind(limit).fetch_all(&self.pool).await?)
    }

    /// All entries of one feed, newest first. Mostly useful for tests and
    /// single-feed inspection.
    pub async fn entries_for_feed(&self, feed_id: i64) -> Result<Vec<Entry>, StorageError> {
        Ok(sqlx::query_as::<_, Entry>(
            "SELECT id, feed_id, guid, title, link, published, content_html, \
                    read_at, bookmarked, created_at \
             FROM entries WHERE feed_id = ? ORDER BY published DESC, id DESC",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Mark an entry as read (stamps `read_at` with the current time).
    pub async fn mark_read(&self, entry_id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE entries SET read_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::EntryNotFound(entry_id));
        }
        Ok(())
    }

    /// Flip an entry's bookmark flag and return the new state. Bookmarked
    /// entries survive retention pruning.
    pub async fn toggle_bookmark(&self, entry_id: i64) -> Result<bool, StorageError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE entries SET bookmarked = NOT bookmarked WHERE id = ? RETURNING bookmarked",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(b,)| b)
            .ok_or(StorageError::EntryNotFound(entry_id))
    }

    /// Aggregate counts for the user-facing layer. Unread counts only
    /// within the retention window; bookmarks count regardless of age.
    pub async fn stats(&self, cutoff: i64) -> Result<Stats, StorageError> {
        let feeds: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;
        let unread: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entries WHERE read_at IS NULL AND published >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        let bookmarked: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE bookmarked = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(Stats {
            feeds: feeds.0,
            unread: unread.0,
            bookmarked: bookmarked.0,
        })
    }
}
