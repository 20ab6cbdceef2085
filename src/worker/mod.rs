//! # Workers
//!
//! One generic [`Worker`] loop, specialised by a [`JobHandler`] per job kind.
//! Each iteration leases one job, checks it against the repository state,
//! claims the repository with a compare-and-set, runs the mutation and writes
//! the outcome back before settling the job with the queue.
//!
//! Queue and store failures never end the loop: they are retried with backoff
//! and, failing that, the job is left to come back when its lease expires.

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AppConfig, RetryPolicyConfig};
use crate::error::{QueueError, StoreError};
use crate::job::{JobId, JobKind, JobRecord};
use crate::mutator::MutationError;
use crate::queue::{FailAction, JobQueue, Lease};
use crate::store::{ErrorInfo, RepositoryState, RepositoryStateStore, RepositoryStatus};
use crate::telemetry::{JobContext, with_job_context};

pub mod backoff;
mod clone;
mod delete;
mod update;

pub use clone::CloneHandler;
pub use delete::DeleteHandler;
pub use update::UpdateHandler;

use backoff::{failure_backoff, operation_backoff};

/// Verdict of a handler on whether a leased job may run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Claim the repository by moving it from `from` to the in-progress status.
    Proceed { from: RepositoryStatus },
    /// No record exists; create it directly in the in-progress status.
    Initialize,
    /// The repository is already held by this very job (a redelivery).
    Resume,
    /// Nothing to do; acknowledge the job.
    Skip { reason: &'static str },
    /// Another job holds the repository; retry later without penalty.
    Contended,
}

/// What a successful mutation did to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Content now matches upstream at `revision`.
    Synced { revision: String },
    /// Content is gone; the state record should go too.
    Removed,
}

/// Kind-specific part of a worker.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    const KIND: JobKind;
    /// Status held while this kind of job runs.
    const IN_PROGRESS: RepositoryStatus;

    fn check(
        &self,
        state: Option<&RepositoryState>,
        job_id: JobId,
        record: &JobRecord,
    ) -> Precondition;

    async fn execute(&self, record: &JobRecord) -> Result<Completion, MutationError>;
}

/// How an individual job ended from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Skipped,
    Contended,
    Retrying,
    DeadLettered,
    /// The worker could not settle the job; it returns once its lease expires.
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Contended => "contended",
            JobOutcome::Retrying => "retrying",
            JobOutcome::DeadLettered => "dead_lettered",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

/// Loop parameters shared by all worker kinds.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_attempts: i32,
    pub contention_backoff: Duration,
    pub mutation_timeout: Duration,
    pub operation_retry_limit: u32,
    pub operation_retry_base: Duration,
    pub retry_policy: RetryPolicyConfig,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.worker.poll_interval(),
            max_attempts: config.worker.max_attempts,
            contention_backoff: config.worker.contention_backoff(),
            mutation_timeout: config.worker.mutation_timeout(),
            operation_retry_limit: config.worker.operation_retry_limit.max(1),
            operation_retry_base: Duration::from_millis(config.worker.operation_retry_base_ms),
            retry_policy: config.retry_policy.clone(),
        }
    }
}

/// Errors a worker may retry in place.
trait Retryable: std::fmt::Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for QueueError {
    fn is_transient(&self) -> bool {
        QueueError::is_transient(self)
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

/// Long-lived loop processing jobs of `H::KIND`.
pub struct Worker<H: JobHandler> {
    name: String,
    handler: Arc<H>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn RepositoryStateStore>,
    settings: WorkerSettings,
}

impl<H: JobHandler> Clone for Worker<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<H: JobHandler> Worker<H> {
    pub fn new(
        handler: H,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn RepositoryStateStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            name: format!("{}-worker", H::KIND),
            handler: Arc::new(handler),
            queue,
            store,
            settings,
        }
    }

    /// Copy of this worker with a distinct name, for pools.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until `shutdown` fires. A job in flight is finished first.
    #[instrument(skip_all, fields(worker = %self.name))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(kind = %H::KIND, "Starting worker");

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Some(outcome) => debug!(outcome = outcome.as_str(), "Job settled"),
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        info!("Worker stopped");
    }

    /// Lease and process at most one job. `None` when nothing was leased.
    pub async fn run_once(&self) -> Option<JobOutcome> {
        let lease = match self.retry_op("lease", || self.queue.lease(H::KIND)).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return None,
            Err(err) => {
                error!(worker = %self.name, error = %err, "Failed to lease job");
                return None;
            }
        };

        let context = JobContext {
            job_id: lease.job_id,
            kind: H::KIND,
            uri: lease.record.repository.uri().to_string(),
        };
        let outcome = with_job_context(context, self.process(&lease)).await;

        counter!(
            "repo_jobs_processed_total",
            "kind" => H::KIND.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        Some(outcome)
    }

    #[instrument(
        skip_all,
        fields(
            job_id = %lease.job_id,
            kind = %H::KIND,
            uri = %lease.record.repository,
            attempt = lease.record.attempt
        )
    )]
    async fn process(&self, lease: &Lease) -> JobOutcome {
        let record = &lease.record;
        let uri = record.repository.uri();

        let current = match self.retry_op("get_state", || self.store.get(uri)).await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "Failed to read repository state");
                return JobOutcome::Abandoned;
            }
        };

        let claimed = match self.handler.check(current.as_ref(), lease.job_id, record) {
            Precondition::Skip { reason } => {
                info!(
                    reason,
                    status = ?current.as_ref().map(|state| state.status),
                    "Nothing to do for job"
                );
                return self.acknowledge(lease, JobOutcome::Skipped).await;
            }
            Precondition::Contended => {
                return self.defer(lease, "repository held by another job").await;
            }
            Precondition::Initialize => {
                let state = RepositoryState::uninitialized(record.repository.clone())
                    .claimed(H::IN_PROGRESS, lease.job_id);
                match self
                    .retry_op("insert_state", || self.store.insert_if_absent(&state))
                    .await
                {
                    Ok(true) => state,
                    Ok(false) => return self.defer(lease, "record created concurrently").await,
                    Err(err) => {
                        error!(error = %err, "Failed to create repository state");
                        return JobOutcome::Abandoned;
                    }
                }
            }
            Precondition::Proceed { from } => {
                let Some(current) = current.as_ref() else {
                    return self.defer(lease, "record disappeared").await;
                };
                let state = current.claimed(H::IN_PROGRESS, lease.job_id);
                let expected = [from];
                match self
                    .retry_op("claim_state", || self.store.compare_and_set(&expected, &state))
                    .await
                {
                    Ok(true) => state,
                    Ok(false) => return self.defer(lease, "lost claim race").await,
                    Err(err) => {
                        error!(error = %err, "Failed to claim repository");
                        return JobOutcome::Abandoned;
                    }
                }
            }
            Precondition::Resume => match current {
                Some(state) => {
                    info!(status = %state.status, "Resuming job after redelivery");
                    state
                }
                None => return self.defer(lease, "record disappeared").await,
            },
        };

        info!(status = %claimed.status, "Executing job");
        let started = Instant::now();
        let execution = timeout(self.settings.mutation_timeout, self.handler.execute(record));
        let result = match execution.await {
            Ok(result) => result,
            Err(_) => Err(MutationError::transient(format!(
                "mutation timed out after {:?}",
                self.settings.mutation_timeout
            ))),
        };
        histogram!("repo_job_mutation_duration_seconds", "kind" => H::KIND.as_str())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(completion) => self.handle_success(lease, &claimed, completion).await,
            Err(err) => self.handle_failure(lease, &claimed, err).await,
        }
    }

    async fn handle_success(
        &self,
        lease: &Lease,
        claimed: &RepositoryState,
        completion: Completion,
    ) -> JobOutcome {
        let in_progress = [H::IN_PROGRESS];

        match completion {
            Completion::Synced { revision } => {
                let ready = claimed.synced(revision, Utc::now());
                match self
                    .retry_op("mark_ready", || self.store.compare_and_set(&in_progress, &ready))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!("Repository state changed during job; result not recorded"),
                    Err(err) => {
                        error!(error = %err, "Failed to record successful sync");
                        return JobOutcome::Abandoned;
                    }
                }
            }
            Completion::Removed => {
                match self
                    .retry_op("remove_state", || {
                        self.store.remove(claimed.uri(), &in_progress)
                    })
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!("Repository state changed during delete; record kept"),
                    Err(err) => {
                        error!(error = %err, "Failed to remove repository state");
                        return JobOutcome::Abandoned;
                    }
                }
            }
        }

        info!("Job completed");
        self.acknowledge(lease, JobOutcome::Completed).await
    }

    async fn handle_failure(
        &self,
        lease: &Lease,
        claimed: &RepositoryState,
        err: MutationError,
    ) -> JobOutcome {
        let attempt = lease.record.attempt;
        warn!(error = %err, attempt, "Job failed");

        let info = ErrorInfo::from_mutation(&err, H::KIND, attempt, Utc::now());
        let failed = claimed.failed(info, lease.job_id);
        let in_progress = [H::IN_PROGRESS];
        match self
            .retry_op("mark_error", || self.store.compare_and_set(&in_progress, &failed))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Repository state changed during job; error not recorded"),
            Err(store_err) => {
                // settling now would strand the repository in its in-progress status
                error!(
                    error = %store_err,
                    "Failed to record job error, leaving job for redelivery"
                );
                return JobOutcome::Abandoned;
            }
        }

        let reason = err.to_string();
        let (action, outcome) = if attempt < self.settings.max_attempts {
            let after = failure_backoff(&self.settings.retry_policy, attempt);
            info!(retry_in_secs = after.as_secs_f64(), "Requeueing failed job");
            (FailAction::Requeue { after }, JobOutcome::Retrying)
        } else {
            error!(
                max_attempts = self.settings.max_attempts,
                "Retry ceiling reached, dead-lettering job"
            );
            (FailAction::DeadLetter, JobOutcome::DeadLettered)
        };

        match self
            .retry_op("fail", || self.queue.fail(lease, action, &reason))
            .await
        {
            Ok(()) => outcome,
            Err(queue_err) => {
                error!(error = %queue_err, "Failed to settle failed job");
                JobOutcome::Abandoned
            }
        }
    }

    async fn acknowledge(&self, lease: &Lease, outcome: JobOutcome) -> JobOutcome {
        match self
            .retry_op("acknowledge", || self.queue.acknowledge(lease))
            .await
        {
            Ok(()) => outcome,
            Err(err) => {
                error!(error = %err, "Failed to acknowledge job");
                JobOutcome::Abandoned
            }
        }
    }

    async fn defer(&self, lease: &Lease, reason: &'static str) -> JobOutcome {
        info!(
            reason,
            retry_in_ms = self.settings.contention_backoff.as_millis() as u64,
            "Deferring job"
        );

        match self
            .retry_op("defer", || {
                self.queue.defer(lease, self.settings.contention_backoff)
            })
            .await
        {
            Ok(()) => JobOutcome::Contended,
            Err(err) => {
                error!(error = %err, "Failed to defer job");
                JobOutcome::Abandoned
            }
        }
    }

    /// Run `call`, retrying transient failures with backoff up to the
    /// operation retry limit.
    async fn retry_op<T, E, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.is_transient() && retry + 1 < self.settings.operation_retry_limit =>
                {
                    let delay = operation_backoff(self.settings.operation_retry_base, retry);
                    warn!(
                        op,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Backend unavailable, retrying operation"
                    );
                    sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
