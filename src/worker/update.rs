use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Completion, JobHandler, Precondition};
use crate::job::{JobId, JobKind, JobRecord, LATEST_REVISION};
use crate::mutator::{MutationError, RepositoryMutator};
use crate::store::{RepositoryState, RepositoryStatus};

/// Refreshes an existing mirror from upstream.
pub struct UpdateHandler {
    mutator: Arc<dyn RepositoryMutator>,
}

impl UpdateHandler {
    pub fn new(mutator: Arc<dyn RepositoryMutator>) -> Self {
        Self { mutator }
    }
}

fn update_precondition(
    state: Option<&RepositoryState>,
    job_id: JobId,
    enqueued_at: DateTime<Utc>,
) -> Precondition {
    let Some(state) = state else {
        return Precondition::Skip {
            reason: "repository not tracked",
        };
    };

    let owned = state.is_owned_by(job_id);
    match state.status {
        RepositoryStatus::Ready
            if state
                .last_updated_at
                .is_some_and(|synced| synced >= enqueued_at) =>
        {
            Precondition::Skip {
                reason: "refreshed since the job was enqueued",
            }
        }
        RepositoryStatus::Ready => Precondition::Proceed {
            from: RepositoryStatus::Ready,
        },
        RepositoryStatus::Updating if owned => Precondition::Resume,
        // an earlier attempt of this same job failed
        RepositoryStatus::Error if owned => Precondition::Proceed {
            from: RepositoryStatus::Error,
        },
        RepositoryStatus::Cloning | RepositoryStatus::Updating | RepositoryStatus::Deleting => {
            Precondition::Contended
        }
        RepositoryStatus::Uninitialized => Precondition::Skip {
            reason: "repository not cloned yet",
        },
        RepositoryStatus::Error => Precondition::Skip {
            reason: "repository in error",
        },
    }
}

#[async_trait]
impl JobHandler for UpdateHandler {
    const KIND: JobKind = JobKind::Update;
    const IN_PROGRESS: RepositoryStatus = RepositoryStatus::Updating;

    fn check(
        &self,
        state: Option<&RepositoryState>,
        job_id: JobId,
        record: &JobRecord,
    ) -> Precondition {
        update_precondition(state, job_id, record.enqueued_at)
    }

    async fn execute(&self, record: &JobRecord) -> Result<Completion, MutationError> {
        let revision = record.payload.revision().unwrap_or(LATEST_REVISION);
        let outcome = self
            .mutator
            .update_repository(&record.repository, revision)
            .await?;

        Ok(Completion::Synced {
            revision: outcome.revision,
        })
    }
}
