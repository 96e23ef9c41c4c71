use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StorageError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the SQLite store. Cheap to clone (wraps a pool).
///
/// The store itself does not serialize writers — that is the engine's
/// write serializer's job. The pool only covers read concurrency and the
/// single connection a sweep transaction pins.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Migration` if the schema could not be
    /// created, `StorageError::Other` for connection failures.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient lock contention from
        // concurrent readers automatically.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; a handful of connections covers the sweep
        // transaction plus concurrent read queries. An in-memory database is
        // private to its connection, so those get a single-connection pool.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StorageError::from_sqlx)?;
        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(db)
    }

    /// Begin a transaction on the pool. The sweep orchestrator wraps each
    /// sweep's mutations in one of these and rolls it back wholesale on
    /// an unrecoverable failure.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, StorageError> {
        Ok(self.pool.begin().await?)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All migrations use `IF NOT EXISTS` for idempotency, so re-running
    /// on an existing database is a no-op.
    async fn migrate(&self) -> Result<()> {
        // Enable foreign keys (per-connection setting, outside the transaction).
        // Note: entry deletion on feed removal is still performed explicitly —
        // there is no ON DELETE CASCADE in this schema.
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                title TEXT,
                etag TEXT,
                last_modified TEXT,
                last_fetch INTEGER,
                fail_count INTEGER NOT NULL DEFAULT 0,
                next_fetch INTEGER NOT NULL DEFAULT 0,
                month_count INTEGER NOT NULL DEFAULT 0,
                last_ok INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id),
                guid TEXT NOT NULL,
                title TEXT,
                link TEXT,
                published INTEGER NOT NULL,
                content_html TEXT,
                read_at INTEGER,
                bookmarked INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(feed_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_unread ON entries(read_at)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_bookmarked ON entries(bookmarked)")
            .execute(&mut *tx)
            .await?;
        // Covers the month_count recompute and the retention prune.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_pub ON entries(feed_id, published)",
        )
        .execute(&mut *tx)
        .await?;
        // Feeds become due by next_fetch; the due-only sweep scans this.
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_next_fetch ON feeds(next_fetch)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = Database::open(":memory:").await.unwrap();
        // Migration is idempotent
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_transaction() {
        let db = Database::open(":memory:").await.unwrap();
        let tx = db.begin().await.unwrap();
        tx.rollback().await.unwrap();
    }
}
