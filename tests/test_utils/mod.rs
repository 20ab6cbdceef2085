//! Test utilities for database-backed lifecycle tests.
//!
//! Sets up an in-memory SQLite database with migrations applied and a
//! scriptable mutator so workers can run without touching git.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use repo_lifecycle::{
    config::{AppConfig, QueueConfig, RetryPolicyConfig, WorkerConfig},
    error::StoreError,
    mutator::{MutationError, MutationOutcome, RepositoryMutator},
    queue::{DbJobQueue, JobQueue},
    repository_ref::RepositoryRef,
    runtime::Components,
    service::RepositoryLifecycle,
    store::{DbRepositoryStateStore, RepositoryState, RepositoryStateStore, RepositoryStatus},
    worker::{CloneHandler, DeleteHandler, UpdateHandler, Worker, WorkerSettings},
};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is pinned to one connection: every connection to `:memory:` opens
/// its own empty database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration tuned for fast tests: short polls, no failure backoff.
pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        log_format: "pretty".to_string(),
        queue: QueueConfig {
            namespace: "test".to_string(),
            visibility_timeout_ms: 60_000,
        },
        worker: WorkerConfig {
            concurrency: 1,
            poll_interval_ms: 10,
            max_attempts: 3,
            contention_backoff_ms: 50,
            mutation_timeout_ms: 5_000,
            operation_retry_limit: 2,
            operation_retry_base_ms: 5,
        },
        retry_policy: RetryPolicyConfig {
            base_seconds: 0,
            max_seconds: 0,
            jitter_factor: 0.0,
        },
        ..AppConfig::default()
    }
}

pub fn repo(uri: &str) -> RepositoryRef {
    RepositoryRef::parse(uri).expect("valid test uri")
}

/// A mutator call as observed by [`FakeMutator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutatorCall {
    Clone { uri: String, revision: String },
    Update { uri: String, revision: String },
    Delete { uri: String },
}

/// In-memory [`RepositoryMutator`] with scripted failures.
///
/// Every call is recorded. Failures queued with [`FakeMutator::fail_next`] are
/// returned in order before calls start succeeding again.
#[derive(Default)]
pub struct FakeMutator {
    calls: Mutex<Vec<MutatorCall>>,
    failures: Mutex<VecDeque<MutationError>>,
    always_fail: Mutex<Option<MutationError>>,
    delay: Mutex<Option<Duration>>,
    revisions: Mutex<u64>,
}

impl FakeMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: MutationError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_always(&self, err: Option<MutationError>) {
        *self.always_fail.lock().unwrap() = err;
    }

    /// Make every subsequent call take at least `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<MutatorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&MutatorCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    async fn record(&self, call: MutatorCall) -> Result<(), MutationError> {
        self.calls.lock().unwrap().push(call);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err);
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_revision(&self) -> String {
        let mut counter = self.revisions.lock().unwrap();
        *counter += 1;
        format!("{:040x}", *counter)
    }
}

#[async_trait]
impl RepositoryMutator for FakeMutator {
    async fn clone_repository(
        &self,
        repository: &RepositoryRef,
        revision: &str,
    ) -> Result<MutationOutcome, MutationError> {
        self.record(MutatorCall::Clone {
            uri: repository.uri().to_string(),
            revision: revision.to_string(),
        })
        .await?;
        Ok(MutationOutcome {
            revision: self.next_revision(),
        })
    }

    async fn update_repository(
        &self,
        repository: &RepositoryRef,
        revision: &str,
    ) -> Result<MutationOutcome, MutationError> {
        self.record(MutatorCall::Update {
            uri: repository.uri().to_string(),
            revision: revision.to_string(),
        })
        .await?;
        Ok(MutationOutcome {
            revision: self.next_revision(),
        })
    }

    async fn delete_repository(&self, repository: &RepositoryRef) -> Result<(), MutationError> {
        self.record(MutatorCall::Delete {
            uri: repository.uri().to_string(),
        })
        .await
    }
}

/// Queue, store and fake mutator over one in-memory database.
pub struct Harness {
    pub config: AppConfig,
    pub db: DatabaseConnection,
    pub queue: Arc<DbJobQueue>,
    pub store: Arc<DbRepositoryStateStore>,
    pub mutator: Arc<FakeMutator>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        Ok(Self {
            queue: Arc::new(DbJobQueue::new(db.clone(), &config.queue)),
            store: Arc::new(DbRepositoryStateStore::new(db.clone())),
            mutator: Arc::new(FakeMutator::new()),
            config,
            db,
        })
    }

    pub fn components(&self) -> Components {
        Components {
            queue: self.queue.clone() as Arc<dyn JobQueue>,
            store: self.store.clone() as Arc<dyn RepositoryStateStore>,
            mutator: self.mutator.clone() as Arc<dyn RepositoryMutator>,
        }
    }

    pub fn lifecycle(&self) -> RepositoryLifecycle {
        self.components().lifecycle()
    }

    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings::from_config(&self.config)
    }

    pub fn clone_worker(&self) -> Worker<CloneHandler> {
        Worker::new(
            CloneHandler::new(self.mutator.clone()),
            self.queue.clone(),
            self.store.clone(),
            self.settings(),
        )
    }

    pub fn update_worker(&self) -> Worker<UpdateHandler> {
        Worker::new(
            UpdateHandler::new(self.mutator.clone()),
            self.queue.clone(),
            self.store.clone(),
            self.settings(),
        )
    }

    /// Clone worker reading and writing state through `store`.
    pub fn clone_worker_with_store(
        &self,
        store: Arc<dyn RepositoryStateStore>,
    ) -> Worker<CloneHandler> {
        Worker::new(
            CloneHandler::new(self.mutator.clone()),
            self.queue.clone(),
            store,
            self.settings(),
        )
    }

    pub fn delete_worker(&self) -> Worker<DeleteHandler> {
        Worker::new(
            DeleteHandler::new(self.mutator.clone()),
            self.queue.clone(),
            self.store.clone(),
            self.settings(),
        )
    }
}

/// [`RepositoryStateStore`] over the SQL store that can simulate an outage.
pub struct FlakyStore {
    inner: Arc<DbRepositoryStateStore>,
    outage_calls: AtomicUsize,
    fail_error_writes: AtomicBool,
    failed_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<DbRepositoryStateStore>) -> Self {
        Self {
            inner,
            outage_calls: AtomicUsize::new(0),
            fail_error_writes: AtomicBool::new(false),
            failed_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `calls` calls of any kind.
    pub fn fail_next_calls(&self, calls: usize) {
        self.outage_calls.store(calls, Ordering::SeqCst);
    }

    /// Fail every write that would move a repository to ERROR.
    pub fn fail_error_writes(&self, enabled: bool) {
        self.fail_error_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::SeqCst)
    }

    fn unavailable(&self, op: &str) -> StoreError {
        self.failed_calls.fetch_add(1, Ordering::SeqCst);
        StoreError::Unavailable(DbErr::Custom(format!("{} refused: store offline", op)))
    }

    fn check(&self, op: &str) -> Result<(), StoreError> {
        let in_outage = self
            .outage_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if in_outage {
            return Err(self.unavailable(op));
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryStateStore for FlakyStore {
    async fn get(&self, uri: &str) -> Result<Option<RepositoryState>, StoreError> {
        self.check("get")?;
        self.inner.get(uri).await
    }

    async fn put(&self, state: &RepositoryState) -> Result<(), StoreError> {
        self.check("put")?;
        self.inner.put(state).await
    }

    async fn compare_and_set(
        &self,
        expected: &[RepositoryStatus],
        state: &RepositoryState,
    ) -> Result<bool, StoreError> {
        self.check("compare_and_set")?;
        if state.status == RepositoryStatus::Error && self.fail_error_writes.load(Ordering::SeqCst)
        {
            return Err(self.unavailable("compare_and_set"));
        }
        self.inner.compare_and_set(expected, state).await
    }

    async fn insert_if_absent(&self, state: &RepositoryState) -> Result<bool, StoreError> {
        self.check("insert_if_absent")?;
        self.inner.insert_if_absent(state).await
    }

    async fn remove(&self, uri: &str, expected: &[RepositoryStatus]) -> Result<bool, StoreError> {
        self.check("remove")?;
        self.inner.remove(uri, expected).await
    }

    async fn list_by_status(
        &self,
        status: RepositoryStatus,
    ) -> Result<Vec<RepositoryState>, StoreError> {
        self.check("list_by_status")?;
        self.inner.list_by_status(status).await
    }
}
