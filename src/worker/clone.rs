use async_trait::async_trait;
use std::sync::Arc;

use super::{Completion, JobHandler, Precondition};
use crate::job::{JobId, JobKind, JobRecord, LATEST_REVISION};
use crate::mutator::{MutationError, RepositoryMutator};
use crate::store::{RepositoryState, RepositoryStatus};

/// Populates a local mirror from upstream.
pub struct CloneHandler {
    mutator: Arc<dyn RepositoryMutator>,
}

impl CloneHandler {
    pub fn new(mutator: Arc<dyn RepositoryMutator>) -> Self {
        Self { mutator }
    }
}

fn clone_precondition(state: Option<&RepositoryState>, job_id: JobId) -> Precondition {
    let Some(state) = state else {
        return Precondition::Initialize;
    };

    match state.status {
        RepositoryStatus::Uninitialized | RepositoryStatus::Error => Precondition::Proceed {
            from: state.status,
        },
        RepositoryStatus::Cloning if state.is_owned_by(job_id) => Precondition::Resume,
        RepositoryStatus::Cloning => Precondition::Skip {
            reason: "clone already in flight",
        },
        RepositoryStatus::Ready | RepositoryStatus::Updating => Precondition::Skip {
            reason: "repository already cloned",
        },
        RepositoryStatus::Deleting => Precondition::Skip {
            reason: "repository is being deleted",
        },
    }
}

#[async_trait]
impl JobHandler for CloneHandler {
    const KIND: JobKind = JobKind::Clone;
    const IN_PROGRESS: RepositoryStatus = RepositoryStatus::Cloning;

    fn check(
        &self,
        state: Option<&RepositoryState>,
        job_id: JobId,
        _record: &JobRecord,
    ) -> Precondition {
        clone_precondition(state, job_id)
    }

    async fn execute(&self, record: &JobRecord) -> Result<Completion, MutationError> {
        let revision = record.payload.revision().unwrap_or(LATEST_REVISION);
        let outcome = self
            .mutator
            .clone_repository(&record.repository, revision)
            .await?;

        Ok(Completion::Synced {
            revision: outcome.revision,
        })
    }
}
