use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::sweep::{run_sweep, FeedSelection, SweepContext};

/// Periodic trigger: every tick, run a due-feeds-only sweep — but only
/// when automatic scheduling is enabled and the write serializer can be
/// acquired without blocking. A held serializer (manual sweep or edit in
/// progress) skips the tick entirely; ticks are never backlogged.
///
/// Any failure inside the triggered sweep is logged and swallowed; the
/// next tick retries from current feed due-times.
pub fn spawn_scheduler(
    ctx: SweepContext,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    enabled: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(ctx.config.tick_seconds.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval tick completes immediately; consume it so
        // the first sweep happens one full period after startup.
        tick.tick().await;

        loop {
            tick.tick().await;
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }

            let Ok(_guard) = write_lock.try_lock() else {
                tracing::debug!("Write serializer held, skipping scheduler tick");
                continue;
            };

            let cancel = CancellationToken::new();
            match run_sweep(&ctx, FeedSelection::Due, &cancel, None).await {
                Ok(stats) if stats.total > 0 => {
                    tracing::debug!(
                        total = stats.total,
                        checked = stats.checked,
                        updated = stats.updated,
                        errors = stats.errors,
                        "Scheduled sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Scheduled sweep failed");
                }
            }
        }
    })
}
