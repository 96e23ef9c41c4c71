use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::{entry_published_ts, parse_feed, stable_guid, FetchOutcome};
use crate::storage::{Feed, StorageError};

/// Backoff applied after `fail_count` consecutive failures, in seconds:
/// `min(6h, 60s × 2^min(fail_count, 8))`.
///
/// Capped exponential with a base of 60 seconds; the curve flattens after
/// eight doublings (15360 s) and the six-hour ceiling is an upper clamp.
pub fn backoff_secs(fail_count: i64) -> i64 {
    let doublings = fail_count.clamp(0, 8) as u32;
    (60_i64 << doublings).min(6 * 3600)
}

/// Polling interval derived from a feed's volume: low-volume feeds are
/// polled eagerly (latency matters more relative to their rarity), while
/// high-volume feeds are polled less often per-item to bound total
/// request volume.
pub fn choose_interval(month_count: i64, config: &Config) -> i64 {
    if month_count <= config.low_threshold {
        config.interval_low_seconds
    } else if month_count <= config.med_threshold {
        config.interval_med_seconds
    } else {
        config.interval_high_seconds
    }
}

/// What one reconciliation did, for the orchestrator's counters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reconciled {
    /// At least one new entry was inserted.
    pub updated: bool,
    /// At least one item failed to store (counted, never fatal).
    pub errored: bool,
}

/// Apply one fetch result to the store, inside the sweep's transaction.
///
/// - not-modified: clear the failure streak and advance `next_fetch` by
///   the feed's volume interval; content untouched.
/// - http-error / transport-exception: bump the streak and back off.
/// - fetched: learn the title (only if unset), refresh validators, insert
///   new items at-or-after the retention cutoff, recompute `month_count`,
///   and reschedule.
///
/// The cancellation token is observed between entries of a large body;
/// whatever was inserted before the signal stays (the sweep commits it).
pub(crate) async fn reconcile(
    tx: &mut SqliteConnection,
    feed: &Feed,
    outcome: FetchOutcome,
    cancel: &CancellationToken,
    config: &Config,
    now: DateTime<Utc>,
    cutoff: i64,
) -> Result<Reconciled, StorageError> {
    let now_ts = now.timestamp();

    match outcome {
        FetchOutcome::NotModified => {
            sqlx::query("UPDATE feeds SET last_fetch = ?, fail_count = 0, next_fetch = ? WHERE id = ?")
                .bind(now_ts)
                .bind(now_ts + choose_interval(feed.month_count, config))
                .bind(feed.id)
                .execute(&mut *tx)
                .await?;
            Ok(Reconciled {
                updated: false,
                errored: false,
            })
        }

        FetchOutcome::HttpError(_) | FetchOutcome::Failed(_) => {
            let fail_count = feed.fail_count + 1;
            let backoff = backoff_secs(fail_count);
            if let FetchOutcome::HttpError(status) = outcome {
                tracing::debug!(feed = %feed.url, status, fail_count, backoff_secs = backoff, "Feed returned an error status");
            } else if let FetchOutcome::Failed(ref detail) = outcome {
                tracing::debug!(feed = %feed.url, detail = %detail, fail_count, backoff_secs = backoff, "Feed fetch failed");
            }
            sqlx::query("UPDATE feeds SET last_fetch = ?, fail_count = ?, next_fetch = ? WHERE id = ?")
                .bind(now_ts)
                .bind(fail_count)
                .bind(now_ts + backoff)
                .bind(feed.id)
                .execute(&mut *tx)
                .await?;
            Ok(Reconciled {
                updated: false,
                errored: false,
            })
        }

        FetchOutcome::Fetched {
            body,
            etag,
            last_modified,
        } => {
            let parsed = parse_feed(&body);

            // Learned titles never overwrite an existing one
            sqlx::query(
                "UPDATE feeds SET title = COALESCE(title, ?), etag = ?, last_modified = ?, \
                 last_fetch = ?, last_ok = ?, fail_count = 0 WHERE id = ?",
            )
            .bind(&parsed.title)
            .bind(&etag)
            .bind(&last_modified)
            .bind(now_ts)
            .bind(now_ts)
            .bind(feed.id)
            .execute(&mut *tx)
            .await?;

            let mut added_any = false;
            let mut item_errors = 0usize;
            for entry in &parsed.entries {
                if cancel.is_cancelled() {
                    break;
                }
                let guid = stable_guid(entry);
                let published = entry_published_ts(entry, now);
                if published < cutoff {
                    continue;
                }
                let insert = sqlx::query(
                    "INSERT OR IGNORE INTO entries \
                     (feed_id, guid, title, link, published, content_html, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(feed.id)
                .bind(&guid)
                .bind(&entry.title)
                .bind(&entry.link)
                .bind(published)
                .bind(&entry.content_html)
                .bind(now_ts)
                .execute(&mut *tx)
                .await;

                match insert {
                    Ok(result) => {
                        if result.rows_affected() > 0 {
                            added_any = true;
                        }
                    }
                    Err(e) => {
                        // A single bad item is counted, never fatal to the feed
                        item_errors += 1;
                        tracing::warn!(feed = %feed.url, guid = %guid, error = %e, "Failed to store entry");
                    }
                }
            }

            let (month_count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM entries WHERE feed_id = ? AND published >= ?")
                    .bind(feed.id)
                    .bind(cutoff)
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query("UPDATE feeds SET month_count = ?, next_fetch = ? WHERE id = ?")
                .bind(month_count)
                .bind(now_ts + choose_interval(month_count, config))
                .bind(feed.id)
                .execute(&mut *tx)
                .await?;

            Ok(Reconciled {
                updated: added_any,
                errored: item_errors > 0,
            })
        }
    }
}
