//! # Durable Job Queue
//!
//! At-least-once delivery of [`JobRecord`]s. A leased job stays invisible to
//! other workers until its lease expires; a worker that crashes mid-job simply
//! lets the lease lapse and the job is delivered again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{JobId, JobKind, JobRecord};

pub mod db;

pub use db::DbJobQueue;

/// Exclusive, time-bounded claim on a queued job.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub job_id: JobId,
    /// Identifies this particular delivery; a redelivery gets a new token.
    pub token: Uuid,
    pub record: JobRecord,
    pub expires_at: DateTime<Utc>,
}

/// What to do with a job whose execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAction {
    /// Make the job visible again after `after`, counting one more attempt.
    Requeue { after: Duration },
    /// Move the job to the dead-letter log.
    DeadLetter,
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: Uuid,
    /// Identifier the job had while queued
    pub job_id: JobId,
    pub record: JobRecord,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, record: JobRecord) -> Result<JobId, QueueError>;

    /// Claim the next visible job of `kind`, if any.
    async fn lease(&self, kind: JobKind) -> Result<Option<Lease>, QueueError>;

    /// Remove a completed job. Fails with [`QueueError::LeaseLost`] when the
    /// lease is no longer held.
    async fn acknowledge(&self, lease: &Lease) -> Result<(), QueueError>;

    async fn fail(&self, lease: &Lease, action: FailAction, reason: &str)
    -> Result<(), QueueError>;

    /// Release the job without counting an attempt; visible again after `after`.
    async fn defer(&self, lease: &Lease, after: Duration) -> Result<(), QueueError>;

    /// Jobs of `kind` that are queued or leased.
    async fn depth(&self, kind: JobKind) -> Result<u64, QueueError>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: u64) -> Result<Vec<DeadLetter>, QueueError>;

    /// Put a dead-lettered job back on the queue under its original id, with a
    /// fresh attempt counter.
    async fn requeue_dead_letter(&self, id: Uuid) -> Result<JobId, QueueError>;
}
