use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Feed, ImportStats, StorageError};
use crate::util::now_ts;

const FEED_COLUMNS: &str = "id, url, title, etag, last_modified, last_fetch, \
                            fail_count, next_fetch, month_count, last_ok";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a new feed. New feeds start with `next_fetch = 0` so they are
    /// immediately due.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateUrl`] if a feed with this URL
    /// already exists — URL uniqueness is enforced solely by the table's
    /// UNIQUE constraint, there is no pre-check path.
    pub async fn insert_feed(
        &self,
        url: &str,
        title: Option<&str>,
    ) -> Result<i64, StorageError> {
        let row: (i64,) =
            sqlx::query_as("INSERT INTO feeds (url, title, next_fetch) VALUES (?, ?, 0) RETURNING id")
                .bind(url)
                .bind(title)
                .fetch_one(&self.pool)
                .await
                .map_err(StorageError::from_sqlx)?;
        Ok(row.0)
    }

    /// Fetch one feed by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Feed, StorageError> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?");
        sqlx::query_as::<_, Feed>(&query)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::FeedNotFound(feed_id))
    }

    /// All feeds, in id order.
    pub async fn all_feeds(&self) -> Result<Vec<Feed>, StorageError> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id");
        Ok(sqlx::query_as::<_, Feed>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Feeds whose `next_fetch` has come due.
    pub async fn due_feeds(&self, now: i64) -> Result<Vec<Feed>, StorageError> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE next_fetch <= ? ORDER BY id");
        Ok(sqlx::query_as::<_, Feed>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Feeds matching an explicit id set. Ids with no matching row are
    /// silently absent from the result.
    pub async fn feeds_by_ids(&self, ids: &[i64]) -> Result<Vec<Feed>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        Ok(builder
            .build_query_as::<Feed>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// List feeds for display, ordered by title (falling back to URL),
    /// optionally filtered by a substring match on either.
    pub async fn list_feeds(
        &self,
        search: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Feed>, StorageError> {
        let limit = limit.clamp(1, 1000);
        let feeds = match search {
            Some(q) if !q.trim().is_empty() => {
                let like = format!("%{}%", q.trim());
                let query = format!(
                    "SELECT {FEED_COLUMNS} FROM feeds \
                     WHERE url LIKE ? OR title LIKE ? \
                     ORDER BY COALESCE(title, url) LIMIT ?"
                );
                sqlx::query_as::<_, Feed>(&query)
                    .bind(&like)
                    .bind(&like)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            _ => {
                let query = format!(
                    "SELECT {FEED_COLUMNS} FROM feeds ORDER BY COALESCE(title, url) LIMIT ?"
                );
                sqlx::query_as::<_, Feed>(&query)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(feeds)
    }

    /// Edit a feed's URL and title.
    ///
    /// Changing the URL invalidates the conditional-request cache and the
    /// backoff state: etag and last-modified are cleared, the failure
    /// streak resets, and the feed becomes immediately due.
    pub async fn update_feed(
        &self,
        feed_id: i64,
        url: &str,
        title: Option<&str>,
    ) -> Result<(), StorageError> {
        let current = self.get_feed(feed_id).await?;

        let mut tx = self.pool.begin().await?;
        if url != current.url {
            sqlx::query(
                "UPDATE feeds SET url = ?, title = ?, etag = NULL, last_modified = NULL, \
                 fail_count = 0, next_fetch = 0 WHERE id = ?",
            )
            .bind(url)
            .bind(title)
            .bind(feed_id)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;
        } else {
            sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
                .bind(title)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Set a feed's title only if it has none yet. Learned titles never
    /// overwrite a user-set title.
    pub async fn set_title_if_unset(
        &self,
        feed_id: i64,
        title: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE feeds SET title = COALESCE(title, ?) WHERE id = ?")
            .bind(title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a feed and all of its entries.
    ///
    /// Referential integrity is manual: entries are removed first, in the
    /// same transaction.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::FeedNotFound(feed_id));
        }

        sqlx::query("DELETE FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Bulk-import `(url, title)` pairs inside one transaction.
    ///
    /// Existing URLs are skipped (`INSERT OR IGNORE` against the UNIQUE
    /// constraint) and counted separately. Imported feeds are immediately
    /// due.
    pub async fn import_feeds(
        &self,
        pairs: &[(String, Option<String>)],
    ) -> Result<ImportStats, StorageError> {
        let mut stats = ImportStats::default();
        if pairs.is_empty() {
            return Ok(stats);
        }

        let mut tx = self.pool.begin().await?;
        for (url, title) in pairs {
            let result =
                sqlx::query("INSERT OR IGNORE INTO feeds (url, title, next_fetch) VALUES (?, ?, 0)")
                    .bind(url)
                    .bind(title.as_deref())
                    .execute(&mut *tx)
                    .await?;
            if result.rows_affected() > 0 {
                stats.imported += 1;
            } else {
                stats.skipped += 1;
            }
        }
        tx.commit().await?;

        tracing::info!(
            imported = stats.imported,
            skipped = stats.skipped,
            "Bulk feed import complete"
        );
        Ok(stats)
    }

    /// Number of subscribed feeds.
    pub async fn feed_count(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Reset a feed's scheduling state so the next sweep retries it
    /// immediately, clearing any accumulated backoff.
    pub async fn mark_feed_due(&self, feed_id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE feeds SET next_fetch = 0, fail_count = 0 WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    /// Record scheduling fields for a feed outside a sweep (used by
    /// tests and manual corrections).
    #[allow(dead_code)]
    pub(crate) async fn set_next_fetch(
        &self,
        feed_id: i64,
        next_fetch: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE feeds SET next_fetch = ?, last_fetch = ? WHERE id = ?")
            .bind(next_fetch)
            .bind(now_ts())
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
