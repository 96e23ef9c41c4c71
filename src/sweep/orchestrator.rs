use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::{fetch_feed, HostGate};
use crate::storage::{Database, StorageError};
use crate::sweep::reconciler::reconcile;
use crate::util::cutoff_ts;

/// Which feeds a sweep covers.
#[derive(Debug, Clone)]
pub enum FeedSelection {
    /// An explicit id set (single-feed refresh, targeted retries).
    Ids(Vec<i64>),
    /// Feeds whose `next_fetch` has come due.
    Due,
    /// Every feed, regardless of schedule.
    All,
}

/// Running totals for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Feeds considered by the selection.
    pub total: usize,
    /// Fetch results processed so far.
    pub checked: usize,
    /// Feeds that gained at least one new entry.
    pub updated: usize,
    /// Feeds whose fetch or reconciliation failed.
    pub errors: usize,
}

/// Progress callback: invoked with the running totals and the URL of the
/// feed just reconciled (best-effort hint, `None` for the initial report).
pub type ProgressFn<'a> = dyn Fn(SweepStats, Option<&str>) + Send + Sync + 'a;

/// Everything a sweep needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct SweepContext {
    pub db: Database,
    pub client: reqwest::Client,
    pub gate: Arc<HostGate>,
    pub config: Arc<Config>,
}

/// Run one sweep: fetch the selected feeds under the global and per-host
/// concurrency bounds, reconcile each result as it completes (completion
/// order, not submission order), then prune expired entries.
///
/// All store mutations happen inside one transaction. A per-feed failure
/// is counted and the sweep proceeds; an unrecoverable storage failure
/// rolls the whole transaction back and surfaces as the error.
///
/// Cancellation is cooperative: a feed whose fetch has not been
/// dispatched when the signal is observed is skipped entirely; fetches
/// already in flight complete and are reconciled, and everything
/// reconciled before the end of the sweep is committed.
pub async fn run_sweep(
    ctx: &SweepContext,
    selection: FeedSelection,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn<'_>>,
) -> Result<SweepStats, StorageError> {
    let now = Utc::now();
    let cutoff = cutoff_ts(ctx.config.retention_days);

    let feeds = match &selection {
        FeedSelection::Ids(ids) => ctx.db.feeds_by_ids(ids).await?,
        FeedSelection::Due => ctx.db.due_feeds(now.timestamp()).await?,
        FeedSelection::All => ctx.db.all_feeds().await?,
    };

    let mut stats = SweepStats {
        total: feeds.len(),
        ..Default::default()
    };
    if let Some(cb) = progress {
        cb(stats, None);
    }
    if feeds.is_empty() {
        return Ok(stats);
    }

    let timeout = Duration::from_secs(ctx.config.request_timeout_seconds);
    let mut tx = ctx.db.begin().await?;

    {
        let client = &ctx.client;
        let gate = ctx.gate.as_ref();
        let mut results = stream::iter(feeds.into_iter().map(|feed| async move {
            // Cancellation observed before dispatch skips the feed entirely
            if cancel.is_cancelled() {
                return (feed, None);
            }
            let outcome = fetch_feed(client, gate, &feed, timeout).await;
            (feed, Some(outcome))
        }))
        .buffer_unordered(ctx.config.max_concurrency.max(1));

        while let Some((feed, outcome)) = results.next().await {
            let Some(outcome) = outcome else { continue };
            stats.checked += 1;
            let fetch_errored = outcome.is_error();

            match reconcile(&mut tx, &feed, outcome, cancel, &ctx.config, now, cutoff).await {
                Ok(reconciled) => {
                    if reconciled.updated {
                        stats.updated += 1;
                    }
                    if fetch_errored || reconciled.errored {
                        stats.errors += 1;
                    }
                }
                Err(e) => {
                    // A per-feed reconciliation failure never aborts the sweep
                    stats.errors += 1;
                    tracing::warn!(feed = %feed.url, error = %e, "Reconciliation failed");
                }
            }

            if let Some(cb) = progress {
                cb(stats, Some(&feed.url));
            }
        }
    }

    // Retention prune: one batch pass per sweep, inside the transaction.
    // Bookmarked entries are kept regardless of age.
    sqlx::query("DELETE FROM entries WHERE published < ? AND bookmarked = 0")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(
        total = stats.total,
        checked = stats.checked,
        updated = stats.updated,
        errors = stats.errors,
        cancelled = cancel.is_cancelled(),
        "Sweep complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryFilter;
    use crate::util::now_ts;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(guid_prefix: &str, items: usize) -> String {
        let mut body = String::from(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>T</title>",
        );
        for i in 0..items {
            body.push_str(&format!(
                "<item><guid>{guid_prefix}-{i}</guid><title>Item {i}</title></item>"
            ));
        }
        body.push_str("</channel></rss>");
        body
    }

    async fn test_ctx() -> SweepContext {
        SweepContext {
            db: Database::open(":memory:").await.unwrap(),
            client: reqwest::Client::new(),
            gate: Arc::new(HostGate::new(4)),
            config: Arc::new(Config::default()),
        }
    }

    #[tokio::test]
    async fn test_sweep_counts_updated_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("ok", 3)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        ctx.db
            .insert_feed(&format!("{}/ok", server.uri()), None)
            .await
            .unwrap();
        ctx.db
            .insert_feed(&format!("{}/broken", server.uri()), None)
            .await
            .unwrap();

        let stats = run_sweep(&ctx, FeedSelection::All, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.checked, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_due_selection_skips_scheduled_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("x", 1)))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        ctx.db
            .insert_feed(&format!("{}/due", server.uri()), None)
            .await
            .unwrap();
        let scheduled = ctx
            .db
            .insert_feed(&format!("{}/later", server.uri()), None)
            .await
            .unwrap();
        sqlx::query("UPDATE feeds SET next_fetch = ? WHERE id = ?")
            .bind(now_ts() + 3600)
            .bind(scheduled)
            .execute(&ctx.db.pool)
            .await
            .unwrap();

        let stats = run_sweep(&ctx, FeedSelection::Due, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.checked, 1);
    }

    #[tokio::test]
    async fn test_sweep_prunes_expired_unbookmarked_entries() {
        // The feed itself errors; the sweep still runs its batch prune
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let feed = ctx
            .db
            .insert_feed(&format!("{}/feed", server.uri()), None)
            .await
            .unwrap();

        let old = now_ts() - 90 * 86400;
        for (guid, bookmarked) in [("keep", 1), ("drop", 0)] {
            sqlx::query(
                "INSERT INTO entries (feed_id, guid, published, bookmarked, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(feed)
            .bind(guid)
            .bind(old)
            .bind(bookmarked)
            .bind(old)
            .execute(&ctx.db.pool)
            .await
            .unwrap();
        }

        run_sweep(&ctx, FeedSelection::Due, &CancellationToken::new(), None)
            .await
            .unwrap();

        let remaining = ctx.db.entries_for_feed(feed).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].guid, "keep");
        assert!(remaining[0].bookmarked);
        // The survivor is reachable through the bookmarked view
        let listed = ctx
            .db
            .list_entries(EntryFilter::Bookmarked, now_ts(), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_sweep_skips_every_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("x", 1)))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        for i in 0..5 {
            ctx.db
                .insert_feed(&format!("{}/feed/{i}", server.uri()), None)
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = run_sweep(&ctx, FeedSelection::All, &cancel, None)
            .await
            .unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.checked, 0, "no fetch is dispatched after the signal");
        assert_eq!(stats.updated, 0);
    }

    #[tokio::test]
    async fn test_progress_reports_completion_order_totals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("x", 1)))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        for i in 0..3 {
            ctx.db
                .insert_feed(&format!("{}/feed/{i}", server.uri()), None)
                .await
                .unwrap();
        }

        let seen = std::sync::Mutex::new(Vec::new());
        let progress = |stats: SweepStats, url: Option<&str>| {
            seen.lock().unwrap().push((stats.checked, url.map(String::from)));
        };
        run_sweep(
            &ctx,
            FeedSelection::All,
            &CancellationToken::new(),
            Some(&progress),
        )
        .await
        .unwrap();

        let seen = seen.into_inner().unwrap();
        // Initial report plus one per reconciled feed
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (0, None));
        assert!(seen[1..].iter().all(|(_, url)| url.is_some()));
        let checked: Vec<usize> = seen[1..].iter().map(|(c, _)| *c).collect();
        assert_eq!(checked, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_explicit_id_selection_ignores_due_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("x", 2)))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let id = ctx
            .db
            .insert_feed(&format!("{}/feed", server.uri()), None)
            .await
            .unwrap();
        sqlx::query("UPDATE feeds SET next_fetch = ? WHERE id = ?")
            .bind(now_ts() + 3600)
            .bind(id)
            .execute(&ctx.db.pool)
            .await
            .unwrap();

        let stats = run_sweep(
            &ctx,
            FeedSelection::Ids(vec![id]),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(stats.checked, 1);
        assert_eq!(stats.updated, 1);
    }
}
