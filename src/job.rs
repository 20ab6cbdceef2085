//! # Job Records
//!
//! The unit of work flowing through the queue. The payload is a tagged enum so
//! the job kind can never disagree with the parameters it carries, and every
//! dispatch site matches it exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::repository_ref::RepositoryRef;

/// Revision marker meaning "whatever the upstream default branch points at".
pub const LATEST_REVISION: &str = "latest";

pub type JobId = Uuid;

/// Discriminant of a job; each worker pool is bound to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Clone,
    Update,
    Delete,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Clone, JobKind::Update, JobKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Clone => "clone",
            JobKind::Update => "update",
            JobKind::Delete => "delete",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "clone" => Ok(JobKind::Clone),
            "update" => Ok(JobKind::Update),
            "delete" => Ok(JobKind::Delete),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

fn latest_revision() -> String {
    LATEST_REVISION.to_string()
}

/// Kind-specific job parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Clone {
        #[serde(default = "latest_revision")]
        revision: String,
    },
    Update {
        #[serde(default = "latest_revision")]
        revision: String,
    },
    Delete,
}

impl JobPayload {
    pub fn clone_latest() -> Self {
        JobPayload::Clone {
            revision: latest_revision(),
        }
    }

    pub fn update_latest() -> Self {
        JobPayload::Update {
            revision: latest_revision(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Clone { .. } => JobKind::Clone,
            JobPayload::Update { .. } => JobKind::Update,
            JobPayload::Delete => JobKind::Delete,
        }
    }

    /// Requested revision, if the kind carries one.
    pub fn revision(&self) -> Option<&str> {
        match self {
            JobPayload::Clone { revision } | JobPayload::Update { revision } => Some(revision),
            JobPayload::Delete => None,
        }
    }
}

/// A job as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub repository: RepositoryRef,
    pub enqueued_at: DateTime<Utc>,
    /// Failed executions so far; starts at 0.
    pub attempt: i32,
    pub payload: JobPayload,
}

impl JobRecord {
    pub fn new(repository: RepositoryRef, payload: JobPayload) -> Self {
        Self {
            repository,
            enqueued_at: Utc::now(),
            attempt: 0,
            payload,
        }
    }

    pub fn clone_job(repository: RepositoryRef) -> Self {
        Self::new(repository, JobPayload::clone_latest())
    }

    pub fn update_job(repository: RepositoryRef) -> Self {
        Self::new(repository, JobPayload::update_latest())
    }

    pub fn delete_job(repository: RepositoryRef) -> Self {
        Self::new(repository, JobPayload::Delete)
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}
