use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::sweep::SweepStats;
use crate::util::now_ts;

/// Lifecycle state of a sweep job.
///
/// `Running → {Done, Error, Cancelled, Cancelling → Cancelled}`.
/// Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Cancelling,
    Done,
    Cancelled,
    Error,
}

impl JobState {
    /// Running or cancelling — the sweep task is still alive.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Running | JobState::Cancelling)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Immutable view of a job for external observers. Readers always see a
/// fully-updated tuple — snapshots are taken under the manager's lock.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobState,
    #[serde(flatten)]
    pub stats: SweepStats,
    /// Best-effort hint: URL of the most recently reconciled feed.
    pub current_url: Option<String>,
    pub started_ts: i64,
    pub last_change_ts: i64,
    pub ended_ts: Option<i64>,
    pub error: Option<String>,
}

struct JobRecord {
    state: JobState,
    stats: SweepStats,
    current_url: Option<String>,
    started_ts: i64,
    last_change_ts: i64,
    ended_ts: Option<i64>,
    error: Option<String>,
    cancel: CancellationToken,
}

/// Result of asking the manager to start a sweep.
pub enum StartOutcome {
    /// A new job was registered; the caller must launch the sweep and
    /// eventually call [`JobManager::finish`].
    Started {
        job_id: String,
        cancel: CancellationToken,
    },
    /// A sweep is already in flight — its id is returned instead
    /// (idempotent start; at most one concurrent sweep system-wide).
    AlreadyRunning(String),
}

/// Owns the job table and enforces the one-active-sweep rule.
///
/// Injected into the engine, never reached globally. All field access
/// goes through these operations; the internal lock is never held across
/// an await point.
#[derive(Default)]
pub struct JobManager {
    inner: Mutex<Jobs>,
    counter: AtomicU64,
}

#[derive(Default)]
struct Jobs {
    jobs: HashMap<String, JobRecord>,
    active: Option<String>,
}

impl JobManager {
    fn lock(&self) -> MutexGuard<'_, Jobs> {
        // Recover from poisoning: the table stays usable even if a
        // progress callback panicked while holding the lock.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new running job, unless one is already active.
    pub fn start(&self) -> StartOutcome {
        let mut jobs = self.lock();

        if let Some(active_id) = &jobs.active {
            if jobs
                .jobs
                .get(active_id)
                .is_some_and(|job| job.state.is_active())
            {
                return StartOutcome::AlreadyRunning(active_id.clone());
            }
        }

        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_ts();
        let job_id = format!("job-{now}-{sequence}");
        let cancel = CancellationToken::new();
        jobs.jobs.insert(
            job_id.clone(),
            JobRecord {
                state: JobState::Running,
                stats: SweepStats::default(),
                current_url: None,
                started_ts: now,
                last_change_ts: now,
                ended_ts: None,
                error: None,
                cancel: cancel.clone(),
            },
        );
        jobs.active = Some(job_id.clone());

        StartOutcome::Started { job_id, cancel }
    }

    /// Update a running job's progress snapshot. Ignored for unknown ids
    /// and terminal jobs.
    pub fn update_progress(&self, job_id: &str, stats: SweepStats, current_url: Option<&str>) {
        let mut jobs = self.lock();
        if let Some(job) = jobs.jobs.get_mut(job_id) {
            if job.state.is_terminal() {
                return;
            }
            job.stats = stats;
            job.current_url = current_url.map(String::from);
            job.last_change_ts = now_ts();
        }
    }

    /// Request cancellation. Returns false for unknown ids and jobs that
    /// are no longer cancellable; repeated cancels of a cancelling job
    /// are accepted.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.lock();
        let Some(job) = jobs.jobs.get_mut(job_id) else {
            return false;
        };
        match job.state {
            JobState::Running => {
                job.cancel.cancel();
                job.state = JobState::Cancelling;
                job.last_change_ts = now_ts();
                true
            }
            JobState::Cancelling => true,
            _ => false,
        }
    }

    /// Record the sweep's completion: `Done` or `Cancelled` with final
    /// counts, `Error` with a message. Terminal states are immutable, so
    /// a late call against a finished job is a no-op.
    pub fn finish(
        &self,
        job_id: &str,
        result: Result<SweepStats, String>,
        was_cancelled: bool,
    ) {
        let mut jobs = self.lock();
        let Some(job) = jobs.jobs.get_mut(job_id) else {
            return;
        };
        if job.state.is_terminal() {
            return;
        }

        match result {
            Ok(stats) => {
                job.stats = stats;
                job.state = if was_cancelled {
                    JobState::Cancelled
                } else {
                    JobState::Done
                };
            }
            Err(message) => {
                job.error = Some(message);
                job.state = JobState::Error;
            }
        }
        let now = now_ts();
        job.ended_ts = Some(now);
        job.last_change_ts = now;

        if jobs.active.as_deref() == Some(job_id) {
            jobs.active = None;
        }
    }

    /// Immutable snapshot of a job, or `None` for unknown ids.
    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.lock();
        jobs.jobs.get(job_id).map(|job| JobSnapshot {
            job_id: job_id.to_string(),
            state: job.state,
            stats: job.stats,
            current_url: job.current_url.clone(),
            started_ts: job.started_ts,
            last_change_ts: job.last_change_ts,
            ended_ts: job.ended_ts,
            error: job.error.clone(),
        })
    }

    /// Whether a sweep job is currently running or cancelling. Feed
    /// create/edit/delete refuse to proceed while this holds.
    pub fn is_sweep_active(&self) -> bool {
        let jobs = self.lock();
        jobs.active
            .as_ref()
            .and_then(|id| jobs.jobs.get(id))
            .is_some_and(|job| job.state.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(manager: &JobManager) -> (String, CancellationToken) {
        match manager.start() {
            StartOutcome::Started { job_id, cancel } => (job_id, cancel),
            StartOutcome::AlreadyRunning(_) => panic!("expected a fresh job"),
        }
    }

    #[test]
    fn test_start_is_idempotent_while_running() {
        let manager = JobManager::default();
        let (first, _cancel) = started(&manager);

        match manager.start() {
            StartOutcome::AlreadyRunning(id) => assert_eq!(id, first),
            StartOutcome::Started { .. } => panic!("second start must not create a job"),
        }
        assert!(manager.is_sweep_active());
    }

    #[test]
    fn test_finish_frees_the_active_slot() {
        let manager = JobManager::default();
        let (first, _cancel) = started(&manager);
        manager.finish(&first, Ok(SweepStats::default()), false);

        assert!(!manager.is_sweep_active());
        let (second, _cancel) = started(&manager);
        assert_ne!(first, second);
    }

    #[test]
    fn test_progress_visible_in_snapshot() {
        let manager = JobManager::default();
        let (id, _cancel) = started(&manager);

        let stats = SweepStats {
            total: 10,
            checked: 4,
            updated: 2,
            errors: 1,
        };
        manager.update_progress(&id, stats, Some("https://example.com/rss"));

        let snap = manager.snapshot(&id).unwrap();
        assert_eq!(snap.state, JobState::Running);
        assert_eq!(snap.stats, stats);
        assert_eq!(snap.current_url.as_deref(), Some("https://example.com/rss"));
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let manager = JobManager::default();
        assert!(manager.snapshot("job-0-0").is_none());
        assert!(!manager.cancel("job-0-0"));
    }

    #[test]
    fn test_cancel_transitions_and_sets_token() {
        let manager = JobManager::default();
        let (id, cancel) = started(&manager);

        assert!(manager.cancel(&id));
        assert!(cancel.is_cancelled());
        assert_eq!(manager.snapshot(&id).unwrap().state, JobState::Cancelling);
        // Still counts as active: no second sweep may start yet
        assert!(manager.is_sweep_active());
        // Cancelling again is accepted
        assert!(manager.cancel(&id));

        manager.finish(&id, Ok(SweepStats::default()), cancel.is_cancelled());
        assert_eq!(manager.snapshot(&id).unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn test_error_completion_carries_message() {
        let manager = JobManager::default();
        let (id, _cancel) = started(&manager);
        manager.finish(&id, Err("database is locked".to_string()), false);

        let snap = manager.snapshot(&id).unwrap();
        assert_eq!(snap.state, JobState::Error);
        assert_eq!(snap.error.as_deref(), Some("database is locked"));
        assert!(snap.ended_ts.is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let manager = JobManager::default();
        let (id, _cancel) = started(&manager);
        let stats = SweepStats {
            total: 5,
            checked: 5,
            updated: 3,
            errors: 0,
        };
        manager.finish(&id, Ok(stats), false);

        assert!(!manager.cancel(&id), "done jobs are not cancellable");
        manager.update_progress(&id, SweepStats::default(), None);
        manager.finish(&id, Err("late failure".to_string()), false);

        let snap = manager.snapshot(&id).unwrap();
        assert_eq!(snap.state, JobState::Done);
        assert_eq!(snap.stats, stats);
        assert!(snap.error.is_none());
    }

    #[test]
    fn test_snapshot_serializes_flat_with_snake_case_state() {
        let manager = JobManager::default();
        let (id, _cancel) = started(&manager);
        manager.update_progress(
            &id,
            SweepStats {
                total: 2,
                checked: 1,
                updated: 1,
                errors: 0,
            },
            Some("https://example.com/rss"),
        );

        let snap = manager.snapshot(&id).unwrap();
        let value = serde_json::to_value(&snap).unwrap();
        assert_eq!(value["state"], "running");
        assert_eq!(value["total"], 2);
        assert_eq!(value["checked"], 1);
        assert_eq!(value["current_url"], "https://example.com/rss");
    }

    #[test]
    fn test_history_survives_next_job() {
        let manager = JobManager::default();
        let (first, _c1) = started(&manager);
        manager.finish(&first, Ok(SweepStats::default()), false);
        let (second, _c2) = started(&manager);

        assert!(manager.snapshot(&first).is_some());
        assert!(manager.snapshot(&second).is_some());
    }
}
