//! # Repository State Store
//!
//! One [`RepositoryState`] per upstream uri. The status field doubles as the
//! per-repository write lock: every transition goes through
//! [`RepositoryStateStore::compare_and_set`], so two workers can never both move
//! the same repository into an in-progress status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::job::{JobId, JobKind};
use crate::mutator::{MutationError, MutationErrorKind};
use crate::repository_ref::RepositoryRef;

pub mod db;

pub use db::DbRepositoryStateStore;

/// Lifecycle status of a mirrored repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    Uninitialized,
    Cloning,
    Ready,
    Updating,
    Deleting,
    Error,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryStatus::Uninitialized => "uninitialized",
            RepositoryStatus::Cloning => "cloning",
            RepositoryStatus::Ready => "ready",
            RepositoryStatus::Updating => "updating",
            RepositoryStatus::Deleting => "deleting",
            RepositoryStatus::Error => "error",
        }
    }
}

impl fmt::Display for RepositoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "uninitialized" => Ok(RepositoryStatus::Uninitialized),
            "cloning" => Ok(RepositoryStatus::Cloning),
            "ready" => Ok(RepositoryStatus::Ready),
            "updating" => Ok(RepositoryStatus::Updating),
            "deleting" => Ok(RepositoryStatus::Deleting),
            "error" => Ok(RepositoryStatus::Error),
            other => Err(format!("unknown repository status '{}'", other)),
        }
    }
}

/// Failure details recorded alongside an ERROR status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub class: MutationErrorKind,
    pub job_kind: JobKind,
    pub attempt: i32,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn from_mutation(
        err: &MutationError,
        job_kind: JobKind,
        attempt: i32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message: err.message.clone(),
            class: err.kind,
            job_kind,
            attempt,
            occurred_at,
        }
    }
}

/// Persisted state of one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryState {
    pub repository: RepositoryRef,
    pub status: RepositoryStatus,
    pub revision: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub error_info: Option<ErrorInfo>,
    /// Job owning the current in-progress or error status.
    pub active_job_id: Option<JobId>,
}

impl RepositoryState {
    pub fn uninitialized(repository: RepositoryRef) -> Self {
        Self {
            repository,
            status: RepositoryStatus::Uninitialized,
            revision: None,
            last_updated_at: None,
            error_info: None,
            active_job_id: None,
        }
    }

    pub fn uri(&self) -> &str {
        self.repository.uri()
    }

    /// Whether `job_id` is the recorded owner of this state.
    pub fn is_owned_by(&self, job_id: JobId) -> bool {
        self.active_job_id == Some(job_id)
    }

    /// Copy of this state claimed by `job_id` in an in-progress status.
    pub fn claimed(&self, status: RepositoryStatus, job_id: JobId) -> Self {
        Self {
            status,
            active_job_id: Some(job_id),
            ..self.clone()
        }
    }

    /// Copy of this state after a successful sync.
    pub fn synced(&self, revision: String, at: DateTime<Utc>) -> Self {
        Self {
            status: RepositoryStatus::Ready,
            revision: Some(revision),
            last_updated_at: Some(at),
            error_info: None,
            active_job_id: None,
            ..self.clone()
        }
    }

    /// Copy of this state after a failed mutation; ownership stays with the job.
    pub fn failed(&self, error_info: ErrorInfo, job_id: JobId) -> Self {
        Self {
            status: RepositoryStatus::Error,
            error_info: Some(error_info),
            active_job_id: Some(job_id),
            ..self.clone()
        }
    }
}

/// Typed access to repository state records.
///
/// Implementations must make `compare_and_set`, `insert_if_absent` and `remove`
/// atomic per uri; a backend that cannot must not implement this trait.
#[async_trait]
pub trait RepositoryStateStore: Send + Sync {
    async fn get(&self, uri: &str) -> Result<Option<RepositoryState>, StoreError>;

    /// Unconditional upsert.
    async fn put(&self, state: &RepositoryState) -> Result<(), StoreError>;

    /// Write `state` only if the stored status is one of `expected`.
    /// Returns false when the record is missing or its status differs.
    async fn compare_and_set(
        &self,
        expected: &[RepositoryStatus],
        state: &RepositoryState,
    ) -> Result<bool, StoreError>;

    /// Create the record unless one already exists for the uri.
    async fn insert_if_absent(&self, state: &RepositoryState) -> Result<bool, StoreError>;

    /// Delete the record if its status is one of `expected`.
    async fn remove(&self, uri: &str, expected: &[RepositoryStatus]) -> Result<bool, StoreError>;

    async fn list_by_status(
        &self,
        status: RepositoryStatus,
    ) -> Result<Vec<RepositoryState>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state() -> RepositoryState {
        RepositoryState::uninitialized(RepositoryRef::parse("https://github.com/a/b").unwrap())
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RepositoryStatus::Uninitialized,
            RepositoryStatus::Cloning,
            RepositoryStatus::Ready,
            RepositoryStatus::Updating,
            RepositoryStatus::Deleting,
            RepositoryStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<RepositoryStatus>().unwrap(), status);
        }
        assert!("archived".parse::<RepositoryStatus>().is_err());
    }

    #[test]
    fn synced_clears_error_and_owner() {
        let job = Uuid::new_v4();
        let err = MutationError::transient("network down");
        let failed = state().failed(
            ErrorInfo::from_mutation(&err, JobKind::Clone, 1, Utc::now()),
            job,
        );
        assert!(failed.is_owned_by(job));
        assert_eq!(failed.status, RepositoryStatus::Error);

        let now = Utc::now();
        let ready = failed.synced("abc123".to_string(), now);
        assert_eq!(ready.status, RepositoryStatus::Ready);
        assert_eq!(ready.revision.as_deref(), Some("abc123"));
        assert_eq!(ready.last_updated_at, Some(now));
        assert!(ready.error_info.is_none());
        assert!(ready.active_job_id.is_none());
    }
}
