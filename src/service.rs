//! # Repository Lifecycle Facade
//!
//! Entry point for whatever embeds the crate (an HTTP layer, the operator
//! CLI). Callers only ever enqueue work and read state; every mutation of a
//! repository happens inside a worker.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::job::{JobId, JobRecord};
use crate::queue::{DeadLetter, JobQueue};
use crate::repository_ref::RepositoryRef;
use crate::store::{RepositoryState, RepositoryStateStore, RepositoryStatus};

#[derive(Clone)]
pub struct RepositoryLifecycle {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn RepositoryStateStore>,
}

impl RepositoryLifecycle {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<dyn RepositoryStateStore>) -> Self {
        Self { queue, store }
    }

    /// Register the repository (UNINITIALIZED) if unknown and enqueue a clone.
    pub async fn enqueue_clone(&self, repository: RepositoryRef) -> Result<JobId, LifecycleError> {
        let registered = self
            .store
            .insert_if_absent(&RepositoryState::uninitialized(repository.clone()))
            .await?;
        if registered {
            info!(uri = %repository, local_id = repository.local_id(), "Repository registered");
        }

        Ok(self.queue.enqueue(JobRecord::clone_job(repository)).await?)
    }

    pub async fn enqueue_delete(&self, repository: RepositoryRef) -> Result<JobId, LifecycleError> {
        Ok(self.queue.enqueue(JobRecord::delete_job(repository)).await?)
    }

    /// Parse `uri` and enqueue a clone for it.
    pub async fn clone_uri(&self, uri: &str) -> Result<JobId, LifecycleError> {
        let repository = RepositoryRef::parse(uri)?;
        self.enqueue_clone(repository).await
    }

    /// Parse `uri` and enqueue a delete for it.
    pub async fn delete_uri(&self, uri: &str) -> Result<JobId, LifecycleError> {
        let repository = RepositoryRef::parse(uri)?;
        self.enqueue_delete(repository).await
    }

    /// Current state of the repository at `uri`, if tracked.
    pub async fn status(&self, uri: &str) -> Result<Option<RepositoryState>, LifecycleError> {
        let repository = RepositoryRef::parse(uri)?;
        Ok(self.store.get(repository.uri()).await?)
    }

    pub async fn list(
        &self,
        status: RepositoryStatus,
    ) -> Result<Vec<RepositoryState>, LifecycleError> {
        Ok(self.store.list_by_status(status).await?)
    }

    pub async fn dead_letters(&self, limit: u64) -> Result<Vec<DeadLetter>, LifecycleError> {
        Ok(self.queue.dead_letters(limit).await?)
    }

    /// Operator action: retry a dead-lettered job from scratch.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> Result<JobId, LifecycleError> {
        Ok(self.queue.requeue_dead_letter(id).await?)
    }
}
