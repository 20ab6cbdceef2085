use async_trait::async_trait;
use std::sync::Arc;

use super::{Completion, JobHandler, Precondition};
use crate::job::{JobId, JobKind, JobRecord};
use crate::mutator::{MutationError, RepositoryMutator};
use crate::store::{RepositoryState, RepositoryStatus};

/// Removes a mirror and, on success, its state record.
pub struct DeleteHandler {
    mutator: Arc<dyn RepositoryMutator>,
}

impl DeleteHandler {
    pub fn new(mutator: Arc<dyn RepositoryMutator>) -> Self {
        Self { mutator }
    }
}

fn delete_precondition(state: Option<&RepositoryState>, job_id: JobId) -> Precondition {
    let Some(state) = state else {
        return Precondition::Skip {
            reason: "repository not tracked",
        };
    };

    match state.status {
        RepositoryStatus::Uninitialized | RepositoryStatus::Ready | RepositoryStatus::Error => {
            Precondition::Proceed { from: state.status }
        }
        RepositoryStatus::Deleting if state.is_owned_by(job_id) => Precondition::Resume,
        RepositoryStatus::Deleting => Precondition::Skip {
            reason: "delete already in flight",
        },
        RepositoryStatus::Cloning | RepositoryStatus::Updating => Precondition::Contended,
    }
}

#[async_trait]
impl JobHandler for DeleteHandler {
    const KIND: JobKind = JobKind::Delete;
    const IN_PROGRESS: RepositoryStatus = RepositoryStatus::Deleting;

    fn check(
        &self,
        state: Option<&RepositoryState>,
        job_id: JobId,
        _record: &JobRecord,
    ) -> Precondition {
        delete_precondition(state, job_id)
    }

    async fn execute(&self, record: &JobRecord) -> Result<Completion, MutationError> {
        self.mutator.delete_repository(&record.repository).await?;
        Ok(Completion::Removed)
    }
}
