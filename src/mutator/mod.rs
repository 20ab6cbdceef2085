//! # Repository Mutation
//!
//! Trait boundary between the workers and whatever actually moves repository
//! content on disk. Workers only decide *whether* to mutate; implementations of
//! [`RepositoryMutator`] decide *how*.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::repository_ref::RepositoryRef;

pub mod git;

pub use git::GitMirror;

/// Classification of a mutation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationErrorKind {
    /// Worth retrying (network, lock files, timeouts)
    Transient,
    /// Will fail again with the same input (unknown repository, bad revision)
    Permanent,
}

impl fmt::Display for MutationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationErrorKind::Transient => f.write_str("transient"),
            MutationErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by a [`RepositoryMutator`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} mutation failure: {message}")]
pub struct MutationError {
    pub kind: MutationErrorKind,
    pub message: String,
}

impl MutationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: MutationErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: MutationErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// Result of a successful clone or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Upstream revision the local copy now points at
    pub revision: String,
}

/// Performs clone, update and delete of repository content.
///
/// Implementations must tolerate being re-run for the same repository after a
/// crash: a clone over leftovers, an update of an up-to-date copy and a delete
/// of a missing copy all succeed.
#[async_trait]
pub trait RepositoryMutator: Send + Sync {
    async fn clone_repository(
        &self,
        repository: &RepositoryRef,
        revision: &str,
    ) -> Result<MutationOutcome, MutationError>;

    async fn update_repository(
        &self,
        repository: &RepositoryRef,
        revision: &str,
    ) -> Result<MutationOutcome, MutationError>;

    async fn delete_repository(&self, repository: &RepositoryRef) -> Result<(), MutationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_error_serializes_with_kind() {
        let err = MutationError::permanent("repository not found");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "permanent");
        assert_eq!(value["message"], "repository not found");
        assert_eq!(
            err.to_string(),
            "permanent mutation failure: repository not found"
        );
    }
}
