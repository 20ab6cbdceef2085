//! Wiring of worker pools and the update scheduler.
//!
//! Everything is constructed explicitly from injected queue, store and
//! mutator handles; nothing registers itself on import.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::mutator::{GitMirror, RepositoryMutator};
use crate::queue::{DbJobQueue, JobQueue};
use crate::scheduler::{SchedulerHandle, UpdateScheduler};
use crate::service::RepositoryLifecycle;
use crate::store::{DbRepositoryStateStore, RepositoryStateStore};
use crate::worker::{
    CloneHandler, DeleteHandler, JobHandler, UpdateHandler, Worker, WorkerSettings,
};

/// Shared collaborators of every loop.
#[derive(Clone)]
pub struct Components {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn RepositoryStateStore>,
    pub mutator: Arc<dyn RepositoryMutator>,
}

impl Components {
    /// SQL-backed queue and store plus a git mirror under the data path.
    pub fn from_database(config: &AppConfig, db: DatabaseConnection) -> Self {
        Self {
            queue: Arc::new(DbJobQueue::new(db.clone(), &config.queue)),
            store: Arc::new(DbRepositoryStateStore::new(db)),
            mutator: Arc::new(GitMirror::new(config.data_path.clone())),
        }
    }

    pub fn lifecycle(&self) -> RepositoryLifecycle {
        RepositoryLifecycle::new(self.queue.clone(), self.store.clone())
    }
}

/// Running worker pools and scheduler.
pub struct Runtime {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    scheduler: SchedulerHandle,
}

fn spawn_pool<H: JobHandler>(
    worker: Worker<H>,
    concurrency: usize,
    shutdown: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) {
    for index in 0..concurrency {
        let instance = worker.named(format!("{}-{}", worker.name(), index));
        tasks.push(tokio::spawn(instance.run(shutdown.child_token())));
    }
}

impl Runtime {
    /// Spawn `worker.concurrency` loops per job kind and start the scheduler.
    pub fn start(config: &AppConfig, components: &Components) -> Self {
        let settings = WorkerSettings::from_config(config);
        let shutdown = CancellationToken::new();
        let mut workers = Vec::new();
        let concurrency = config.worker.concurrency;

        spawn_pool(
            Worker::new(
                CloneHandler::new(components.mutator.clone()),
                components.queue.clone(),
                components.store.clone(),
                settings.clone(),
            ),
            concurrency,
            &shutdown,
            &mut workers,
        );
        spawn_pool(
            Worker::new(
                UpdateHandler::new(components.mutator.clone()),
                components.queue.clone(),
                components.store.clone(),
                settings.clone(),
            ),
            concurrency,
            &shutdown,
            &mut workers,
        );
        spawn_pool(
            Worker::new(
                DeleteHandler::new(components.mutator.clone()),
                components.queue.clone(),
                components.store.clone(),
                settings,
            ),
            concurrency,
            &shutdown,
            &mut workers,
        );

        let scheduler = UpdateScheduler::new(
            &config.scheduler,
            components.store.clone(),
            components.queue.clone(),
        )
        .start();

        info!(
            workers = workers.len(),
            concurrency, "Repository lifecycle runtime started"
        );

        Self {
            shutdown,
            workers,
            scheduler,
        }
    }

    /// Stop the scheduler, then let every worker finish its current job.
    pub async fn shutdown(self) {
        info!("Shutting down repository lifecycle runtime");

        self.scheduler.stop().await;
        self.shutdown.cancel();

        for handle in self.workers {
            if let Err(err) = handle.await {
                error!(error = ?err, "Worker task ended abnormally");
            }
        }

        info!("Repository lifecycle runtime stopped");
    }
}
