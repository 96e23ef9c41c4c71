//! The update engine facade.
//!
//! Owns the write serializer — the single mutual-exclusion gate every
//! mutating operation (sweep execution, single-feed refresh, feed
//! create/edit/delete, bulk import) acquires before touching the store —
//! and the job manager enforcing at most one concurrent sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::HostGate;
use crate::storage::{Database, Feed, ImportStats, StorageError};
use crate::sweep::{
    run_sweep, spawn_scheduler, FeedSelection, JobManager, JobSnapshot, StartOutcome,
    SweepContext, SweepStats,
};
use crate::util::{validate_url, UrlValidationError};

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A feed edit was attempted while a sweep job is running or
    /// cancelling. Rejected synchronously, never queued.
    #[error("Cannot modify feeds while an update is running")]
    SweepInProgress,

    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The feed update engine.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`. The
/// write serializer is a real cross-task mutex, so sweeps started from
/// the job manager, the periodic scheduler, and direct callers can never
/// interleave their store mutations.
pub struct Engine {
    ctx: SweepContext,
    jobs: Arc<JobManager>,
    write_lock: Arc<Mutex<()>>,
    scheduler_enabled: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(db: Database, config: Config) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .build()?;
        let gate = Arc::new(HostGate::new(config.per_host_limit));
        let scheduler_enabled = Arc::new(AtomicBool::new(config.scheduler_enabled));

        Ok(Self {
            ctx: SweepContext {
                db,
                client,
                gate,
                config: Arc::new(config),
            },
            jobs: Arc::new(JobManager::default()),
            write_lock: Arc::new(Mutex::new(())),
            scheduler_enabled,
        })
    }

    pub fn db(&self) -> &Database {
        &self.ctx.db
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Launch the periodic trigger on the current runtime. The returned
    /// handle can be aborted to stop automatic sweeps entirely;
    /// [`Engine::set_scheduler_enabled`] pauses them without stopping
    /// the task.
    pub fn spawn_scheduler(&self) -> tokio::task::JoinHandle<()> {
        spawn_scheduler(
            self.ctx.clone(),
            Arc::clone(&self.write_lock),
            Arc::clone(&self.scheduler_enabled),
        )
    }

    pub fn set_scheduler_enabled(&self, enabled: bool) {
        self.scheduler_enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "Scheduler toggled");
    }

    pub fn scheduler_enabled(&self) -> bool {
        self.scheduler_enabled.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Sweeps and Jobs
    // ========================================================================

    /// Start a background sweep and return its job id.
    ///
    /// Idempotent: if a sweep is already running, the in-flight job's id
    /// is returned and no second orchestrator pass starts. The sweep
    /// task acquires the write serializer before touching the store, so
    /// it queues behind any in-progress edit.
    pub fn start_sweep(&self, full_sweep: bool) -> String {
        match self.jobs.start() {
            StartOutcome::AlreadyRunning(job_id) => job_id,
            StartOutcome::Started { job_id, cancel } => {
                let ctx = self.ctx.clone();
                let jobs = Arc::clone(&self.jobs);
                let write_lock = Arc::clone(&self.write_lock);
                let id = job_id.clone();

                tokio::spawn(async move {
                    let _guard = write_lock.lock().await;
                    let selection = if full_sweep {
                        FeedSelection::All
                    } else {
                        FeedSelection::Due
                    };

                    let progress = {
                        let jobs = Arc::clone(&jobs);
                        let id = id.clone();
                        move |stats: SweepStats, url: Option<&str>| {
                            jobs.update_progress(&id, stats, url)
                        }
                    };

                    let result = run_sweep(&ctx, selection, &cancel, Some(&progress)).await;
                    jobs.finish(&id, result.map_err(|e| e.to_string()), cancel.is_cancelled());
                });

                job_id
            }
        }
    }

    /// Immutable snapshot of a job, or `None` for unknown ids.
    pub fn job_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.snapshot(job_id)
    }

    /// Request cancellation of a running sweep. Best-effort: returns
    /// true once the signal is set; the job confirms by eventually
    /// reaching the cancelled state.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.jobs.cancel(job_id)
    }

    /// Run one sweep to completion on the caller's task, outside the job
    /// machinery. Used by the CLI's one-shot mode.
    pub async fn sweep_now(&self, full_sweep: bool) -> Result<SweepStats, EngineError> {
        let _guard = self.write_lock.lock().await;
        let selection = if full_sweep {
            FeedSelection::All
        } else {
            FeedSelection::Due
        };
        Ok(run_sweep(&self.ctx, selection, &CancellationToken::new(), None).await?)
    }

    /// Fetch one feed immediately, bypassing the due filter. Honors the
    /// write serializer like any other mutation.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<SweepStats, EngineError> {
        // Surface unknown ids before taking the serializer
        self.ctx.db.get_feed(feed_id).await?;

        let _guard = self.write_lock.lock().await;
        Ok(run_sweep(
            &self.ctx,
            FeedSelection::Ids(vec![feed_id]),
            &CancellationToken::new(),
            None,
        )
        .await?)
    }

    // ========================================================================
    // Feed CRUD and Import
    // ========================================================================

    /// Subscribe to a feed and fetch it once so entries appear without
    /// waiting for the scheduler.
    pub async fn add_feed(&self, url: &str, title: Option<&str>) -> Result<Feed, EngineError> {
        self.ensure_no_active_sweep()?;
        validate_url(url)?;

        let feed_id = {
            let _guard = self.write_lock.lock().await;
            self.ctx.db.insert_feed(url, title).await?
        };

        if let Err(e) = self.refresh_feed(feed_id).await {
            tracing::warn!(feed_id, error = %e, "Initial fetch of new feed failed");
        }
        Ok(self.ctx.db.get_feed(feed_id).await?)
    }

    /// Edit a feed's URL or title, then refetch it. A URL change resets
    /// the conditional-request cache and the backoff state.
    pub async fn edit_feed(
        &self,
        feed_id: i64,
        url: &str,
        title: Option<&str>,
    ) -> Result<Feed, EngineError> {
        self.ensure_no_active_sweep()?;
        validate_url(url)?;

        {
            let _guard = self.write_lock.lock().await;
            self.ctx.db.update_feed(feed_id, url, title).await?;
        }

        if let Err(e) = self.refresh_feed(feed_id).await {
            tracing::warn!(feed_id, error = %e, "Refetch after feed edit failed");
        }
        Ok(self.ctx.db.get_feed(feed_id).await?)
    }

    /// Unsubscribe, removing the feed's entries first.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<(), EngineError> {
        self.ensure_no_active_sweep()?;
        let _guard = self.write_lock.lock().await;
        Ok(self.ctx.db.delete_feed(feed_id).await?)
    }

    /// Bulk-import `(url, title)` pairs, e.g. from an OPML file or a
    /// plain URL list. Duplicate URLs are skipped, not errors.
    pub async fn import_feeds(
        &self,
        pairs: &[(String, Option<String>)],
    ) -> Result<ImportStats, EngineError> {
        self.ensure_no_active_sweep()?;
        let _guard = self.write_lock.lock().await;
        Ok(self.ctx.db.import_feeds(pairs).await?)
    }

    fn ensure_no_active_sweep(&self) -> Result<(), EngineError> {
        if self.jobs.is_sweep_active() {
            return Err(EngineError::SweepInProgress);
        }
        Ok(())
    }
}
