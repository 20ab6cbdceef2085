//! # Update Scheduler
//!
//! Timer-driven pass that enqueues an update job for every READY repository
//! whose last successful sync is at least one update period old. The pass is
//! stateless: the only cursor is the in-memory time of the previous scan, kept
//! for logging. Redundant jobs produced by overlapping scans are absorbed by
//! the update worker's precondition check.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::job::JobRecord;
use crate::queue::JobQueue;
use crate::store::{RepositoryStateStore, RepositoryStatus};

/// Counters for a single scan pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub repositories_examined: u64,
    pub jobs_enqueued: u64,
    pub skipped_not_due: u64,
    pub enqueue_failures: u64,
    /// The READY listing itself failed; nothing was examined.
    pub listing_failed: bool,
}

/// Periodically schedules update jobs for stale repositories.
pub struct UpdateScheduler {
    store: Arc<dyn RepositoryStateStore>,
    queue: Arc<dyn JobQueue>,
    update_frequency: Duration,
    last_scan_completed_at: Mutex<Option<DateTime<Utc>>>,
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel the timer and wait for an in-flight scan to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            error!(error = ?err, "Update scheduler task ended abnormally");
        }
    }
}

/// Whether a repository last synced at `last_updated_at` is due at `now`.
/// A READY repository that never recorded a sync is always due.
pub fn is_due(
    last_updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    update_frequency: Duration,
) -> bool {
    let Some(last) = last_updated_at else {
        return true;
    };

    match chrono::Duration::from_std(update_frequency) {
        Ok(frequency) => now.signed_duration_since(last) >= frequency,
        Err(_) => false,
    }
}

impl UpdateScheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn RepositoryStateStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            store,
            queue,
            update_frequency: config.update_frequency(),
            last_scan_completed_at: Mutex::new(None),
        }
    }

    /// Spawn the scheduler loop with its own shutdown token.
    pub fn start(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        SchedulerHandle { shutdown, task }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            update_frequency_ms = self.update_frequency.as_millis() as u64,
            "Starting update scheduler"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Update scheduler shutdown requested");
                    break;
                }
                _ = sleep(self.update_frequency) => {
                    self.scan(Utc::now()).await;
                }
            }
        }

        info!("Update scheduler stopped");
    }

    /// Time the previous scan finished, if any.
    pub fn last_scan_completed_at(&self) -> Option<DateTime<Utc>> {
        self.last_scan_completed_at
            .lock()
            .map(|guard| *guard)
            .unwrap_or(None)
    }

    /// One scan pass evaluated at `now`.
    pub async fn scan(&self, now: DateTime<Utc>) -> ScanStats {
        let started = Instant::now();
        let mut stats = ScanStats::default();

        let ready = match self.store.list_by_status(RepositoryStatus::Ready).await {
            Ok(ready) => ready,
            Err(err) => {
                error!(error = %err, "Failed to list ready repositories; skipping scan");
                stats.listing_failed = true;
                return stats;
            }
        };

        for state in ready {
            stats.repositories_examined += 1;

            if !is_due(state.last_updated_at, now, self.update_frequency) {
                stats.skipped_not_due += 1;
                continue;
            }

            match self
                .queue
                .enqueue(JobRecord::update_job(state.repository.clone()))
                .await
            {
                Ok(job_id) => {
                    stats.jobs_enqueued += 1;
                    debug!(
                        job_id = %job_id,
                        uri = %state.repository,
                        last_updated_at = ?state.last_updated_at,
                        "Scheduled update"
                    );
                }
                Err(err) => {
                    stats.enqueue_failures += 1;
                    warn!(
                        error = %err,
                        uri = %state.repository,
                        "Failed to schedule update"
                    );
                }
            }
        }

        let previous = self
            .last_scan_completed_at
            .lock()
            .map(|mut guard| guard.replace(now))
            .unwrap_or(None);

        counter!("repo_scheduler_jobs_scheduled_total").increment(stats.jobs_enqueued);
        gauge!("repo_scheduler_ready_repositories").set(stats.repositories_examined as f64);
        histogram!("repo_scheduler_scan_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        info!(
            examined = stats.repositories_examined,
            enqueued = stats.jobs_enqueued,
            skipped_not_due = stats.skipped_not_due,
            enqueue_failures = stats.enqueue_failures,
            since_previous_scan_secs = previous.map(|prev| (now - prev).num_seconds()),
            "Update scan completed"
        );

        stats
    }
}
