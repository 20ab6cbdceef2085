//! SeaORM-backed [`JobQueue`].
//!
//! Leasing uses the same two-step claim as a polling executor: select the
//! oldest eligible row, then flip it to `leased` with an `UPDATE` that is
//! conditional on the row still looking the way it did when selected. Whoever
//! loses that race moves on to the next candidate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::prelude::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeadLetter, FailAction, JobQueue, Lease};
use crate::config::QueueConfig;
use crate::error::{QueueError, queue_db_err};
use crate::job::{JobId, JobKind, JobPayload, JobRecord};
use crate::models::{
    dead_letter_job::{self, ActiveModel as DeadLetterActiveModel, Entity as DeadLetterEntity},
    repository_job::{self, ActiveModel as JobActiveModel, Column, Entity as JobEntity},
};
use crate::repository_ref::RepositoryRef;

const STATUS_QUEUED: &str = "queued";
const STATUS_LEASED: &str = "leased";

/// Candidates tried per lease call before reporting the queue as empty.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Job queue over the `repository_jobs` and `dead_letter_jobs` tables.
#[derive(Clone)]
pub struct DbJobQueue {
    db: DatabaseConnection,
    namespace: String,
    visibility_timeout: Duration,
}

impl DbJobQueue {
    pub fn new(db: DatabaseConnection, config: &QueueConfig) -> Self {
        Self {
            db,
            namespace: config.namespace.clone(),
            visibility_timeout: config.visibility_timeout(),
        }
    }

    /// Move a job row to the dead-letter log. With a `token`, only while that
    /// lease is still held. Returns false if the row was not found.
    async fn dead_letter_row(
        &self,
        job_id: JobId,
        token: Option<Uuid>,
        attempt_delta: i32,
        reason: &str,
    ) -> Result<bool, QueueError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| queue_db_err("dead_letter_begin", e))?;

        let mut query =
            JobEntity::find_by_id(job_id).filter(Column::Namespace.eq(self.namespace.as_str()));
        if let Some(token) = token {
            query = query.filter(Column::LeaseToken.eq(token));
        }

        let Some(row) = query
            .one(&txn)
            .await
            .map_err(|e| queue_db_err("dead_letter_find", e))?
        else {
            return Ok(false);
        };

        let now = Utc::now().fixed_offset();
        let dead_letter = DeadLetterActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(row.id),
            namespace: Set(row.namespace.clone()),
            kind: Set(row.kind.clone()),
            repository_uri: Set(row.repository_uri.clone()),
            local_id: Set(row.local_id.clone()),
            payload: Set(row.payload.clone()),
            attempt: Set(row.attempt + attempt_delta),
            reason: Set(reason.to_string()),
            enqueued_at: Set(row.enqueued_at),
            dead_lettered_at: Set(now),
        };

        DeadLetterEntity::insert(dead_letter)
            .exec_without_returning(&txn)
            .await
            .map_err(|e| queue_db_err("dead_letter_insert", e))?;

        JobEntity::delete_by_id(row.id)
            .exec(&txn)
            .await
            .map_err(|e| queue_db_err("dead_letter_delete", e))?;

        txn.commit()
            .await
            .map_err(|e| queue_db_err("dead_letter_commit", e))?;

        counter!("repo_jobs_dead_lettered_total", "kind" => row.kind).increment(1);
        Ok(true)
    }

    /// Return a leased job to the queue, visible again after `after`.
    async fn release(
        &self,
        lease: &Lease,
        after: Duration,
        failure: Option<&str>,
        context: &'static str,
    ) -> Result<(), QueueError> {
        let now = Utc::now();

        let mut update = JobEntity::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_QUEUED))
            .col_expr(
                Column::VisibleAt,
                Expr::value(offset_by(now, after).fixed_offset()),
            )
            .col_expr(Column::LeaseToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<chrono::FixedOffset>>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()));

        if let Some(reason) = failure {
            update = update
                .col_expr(
                    Column::Attempt,
                    Expr::value(Expr::col(Column::Attempt).add(1)),
                )
                .col_expr(
                    Column::LastError,
                    Expr::value(Some(serde_json::json!({
                        "reason": reason,
                        "attempt": lease.record.attempt,
                        "failed_at": now.to_rfc3339(),
                    }))),
                );
        }

        let result = update
            .filter(Column::Id.eq(lease.job_id))
            .filter(Column::LeaseToken.eq(lease.token))
            .exec(&self.db)
            .await
            .map_err(|e| queue_db_err(context, e))?;

        if result.rows_affected == 0 {
            warn!(job_id = %lease.job_id, context, "Lease lost before release");
            return Err(QueueError::LeaseLost {
                job_id: lease.job_id,
            });
        }

        Ok(())
    }
}

/// `now + after`, saturating at the latest representable instant.
fn offset_by(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decode_payload(
    job_id: Uuid,
    kind: &str,
    payload: serde_json::Value,
) -> Result<JobPayload, QueueError> {
    let payload: JobPayload =
        serde_json::from_value(payload).map_err(|e| QueueError::Corrupt {
            job_id,
            message: format!("invalid payload: {}", e),
        })?;

    if payload.kind().as_str() != kind {
        return Err(QueueError::Corrupt {
            job_id,
            message: format!(
                "payload kind '{}' does not match job kind '{}'",
                payload.kind(),
                kind
            ),
        });
    }

    Ok(payload)
}

fn decode_job(row: &repository_job::Model) -> Result<JobRecord, QueueError> {
    let payload = decode_payload(row.id, &row.kind, row.payload.clone())?;

    Ok(JobRecord {
        repository: RepositoryRef::from_parts(row.repository_uri.clone(), row.local_id.clone()),
        enqueued_at: row.enqueued_at.with_timezone(&Utc),
        attempt: row.attempt,
        payload,
    })
}

fn decode_dead_letter(row: dead_letter_job::Model) -> Result<DeadLetter, QueueError> {
    let payload = decode_payload(row.job_id, &row.kind, row.payload)?;

    Ok(DeadLetter {
        id: row.id,
        job_id: row.job_id,
        record: JobRecord {
            repository: RepositoryRef::from_parts(row.repository_uri, row.local_id),
            enqueued_at: row.enqueued_at.with_timezone(&Utc),
            attempt: row.attempt,
            payload,
        },
        reason: row.reason,
        dead_lettered_at: row.dead_lettered_at.with_timezone(&Utc),
    })
}

#[async_trait]
impl JobQueue for DbJobQueue {
    async fn enqueue(&self, record: JobRecord) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        let kind = record.kind();

        let payload = serde_json::to_value(&record.payload).map_err(|e| QueueError::Corrupt {
            job_id: id,
            message: format!("failed to encode payload: {}", e),
        })?;

        let row = JobActiveModel {
            id: Set(id),
            namespace: Set(self.namespace.clone()),
            kind: Set(kind.as_str().to_string()),
            repository_uri: Set(record.repository.uri().to_string()),
            local_id: Set(record.repository.local_id().to_string()),
            payload: Set(payload),
            status: Set(STATUS_QUEUED.to_string()),
            attempt: Set(record.attempt),
            deliveries: Set(0),
            enqueued_at: Set(record.enqueued_at.fixed_offset()),
            visible_at: Set(now),
            lease_token: Set(None),
            lease_expires_at: Set(None),
            last_error: Set(None),
            updated_at: Set(now),
        };

        JobEntity::insert(row)
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| queue_db_err("enqueue", e))?;

        counter!("repo_jobs_enqueued_total", "kind" => kind.as_str()).increment(1);
        info!(
            job_id = %id,
            kind = %kind,
            uri = %record.repository,
            "Job enqueued"
        );

        Ok(id)
    }

    async fn lease(&self, kind: JobKind) -> Result<Option<Lease>, QueueError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let now = Utc::now();
            let now_fixed = now.fixed_offset();

            let candidate = JobEntity::find()
                .filter(Column::Namespace.eq(self.namespace.as_str()))
                .filter(Column::Kind.eq(kind.as_str()))
                .filter(
                    Condition::any()
                        .add(
                            Condition::all()
                                .add(Column::Status.eq(STATUS_QUEUED))
                                .add(Column::VisibleAt.lte(now_fixed)),
                        )
                        .add(
                            Condition::all()
                                .add(Column::Status.eq(STATUS_LEASED))
                                .add(Column::LeaseExpiresAt.lte(now_fixed)),
                        ),
                )
                .order_by_asc(Column::VisibleAt)
                .order_by_asc(Column::EnqueuedAt)
                .limit(1)
                .one(&self.db)
                .await
                .map_err(|e| queue_db_err("lease_select", e))?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let record = match decode_job(&candidate) {
                Ok(record) => record,
                Err(err) => {
                    warn!(job_id = %candidate.id, error = %err, "Dead-lettering undecodable job");
                    self.dead_letter_row(candidate.id, None, 0, &err.to_string())
                        .await?;
                    continue;
                }
            };

            if candidate.status == STATUS_LEASED {
                info!(
                    job_id = %candidate.id,
                    deliveries = candidate.deliveries,
                    "Reclaiming job with expired lease"
                );
            }

            let token = Uuid::new_v4();
            let expires_at = offset_by(now, self.visibility_timeout);

            let mut claim = JobEntity::update_many()
                .col_expr(Column::Status, Expr::value(STATUS_LEASED))
                .col_expr(Column::LeaseToken, Expr::value(Some(token)))
                .col_expr(
                    Column::LeaseExpiresAt,
                    Expr::value(Some(expires_at.fixed_offset())),
                )
                .col_expr(
                    Column::Deliveries,
                    Expr::value(Expr::col(Column::Deliveries).add(1)),
                )
                .col_expr(Column::UpdatedAt, Expr::value(now_fixed))
                .filter(Column::Id.eq(candidate.id))
                .filter(Column::Status.eq(candidate.status.clone()));

            // the row must still carry the lease we saw, or none at all
            claim = match candidate.lease_token {
                Some(previous) => claim.filter(Column::LeaseToken.eq(previous)),
                None => claim.filter(Column::LeaseToken.is_null()),
            };

            let result = claim
                .exec(&self.db)
                .await
                .map_err(|e| queue_db_err("lease_claim", e))?;

            if result.rows_affected == 1 {
                counter!("repo_jobs_leased_total", "kind" => kind.as_str()).increment(1);
                return Ok(Some(Lease {
                    job_id: candidate.id,
                    token,
                    record,
                    expires_at,
                }));
            }

            debug!(job_id = %candidate.id, "Lost lease race, trying next candidate");
        }

        Ok(None)
    }

    async fn acknowledge(&self, lease: &Lease) -> Result<(), QueueError> {
        let result = JobEntity::delete_many()
            .filter(Column::Id.eq(lease.job_id))
            .filter(Column::LeaseToken.eq(lease.token))
            .exec(&self.db)
            .await
            .map_err(|e| queue_db_err("acknowledge", e))?;

        if result.rows_affected == 0 {
            warn!(job_id = %lease.job_id, "Lease lost before acknowledge");
            return Err(QueueError::LeaseLost {
                job_id: lease.job_id,
            });
        }

        counter!("repo_jobs_acknowledged_total", "kind" => lease.record.kind().as_str())
            .increment(1);
        Ok(())
    }

    async fn fail(
        &self,
        lease: &Lease,
        action: FailAction,
        reason: &str,
    ) -> Result<(), QueueError> {
        match action {
            FailAction::Requeue { after } => {
                self.release(lease, after, Some(reason), "fail_requeue")
                    .await?;
                counter!("repo_jobs_requeued_total", "kind" => lease.record.kind().as_str())
                    .increment(1);
                Ok(())
            }
            FailAction::DeadLetter => {
                if self
                    .dead_letter_row(lease.job_id, Some(lease.token), 1, reason)
                    .await?
                {
                    Ok(())
                } else {
                    warn!(job_id = %lease.job_id, "Lease lost before dead-lettering");
                    Err(QueueError::LeaseLost {
                        job_id: lease.job_id,
                    })
                }
            }
        }
    }

    async fn defer(&self, lease: &Lease, after: Duration) -> Result<(), QueueError> {
        self.release(lease, after, None, "defer").await?;
        counter!("repo_jobs_deferred_total", "kind" => lease.record.kind().as_str()).increment(1);
        Ok(())
    }

    async fn depth(&self, kind: JobKind) -> Result<u64, QueueError> {
        JobEntity::find()
            .filter(Column::Namespace.eq(self.namespace.as_str()))
            .filter(Column::Kind.eq(kind.as_str()))
            .count(&self.db)
            .await
            .map_err(|e| queue_db_err("depth", e))
    }

    async fn dead_letters(&self, limit: u64) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = DeadLetterEntity::find()
            .filter(dead_letter_job::Column::Namespace.eq(self.namespace.as_str()))
            .order_by_desc(dead_letter_job::Column::DeadLetteredAt)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|e| queue_db_err("dead_letters", e))?;

        // entries that were dead-lettered for being undecodable stay in the
        // table for manual inspection but cannot be listed as records
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                match decode_dead_letter(row) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        warn!(dead_letter_id = %id, error = %err, "Skipping undecodable dead letter");
                        None
                    }
                }
            })
            .collect())
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> Result<JobId, QueueError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| queue_db_err("requeue_dead_letter_begin", e))?;

        let row = DeadLetterEntity::find_by_id(id)
            .filter(dead_letter_job::Column::Namespace.eq(self.namespace.as_str()))
            .one(&txn)
            .await
            .map_err(|e| queue_db_err("requeue_dead_letter_find", e))?
            .ok_or(QueueError::DeadLetterNotFound { id })?;

        // validate before putting it back in circulation
        decode_payload(row.job_id, &row.kind, row.payload.clone())?;

        // the job keeps its id so it still owns any state its failure left behind
        let job_id = row.job_id;
        let now = Utc::now().fixed_offset();
        let job = JobActiveModel {
            id: Set(job_id),
            namespace: Set(row.namespace.clone()),
            kind: Set(row.kind.clone()),
            repository_uri: Set(row.repository_uri.clone()),
            local_id: Set(row.local_id.clone()),
            payload: Set(row.payload.clone()),
            status: Set(STATUS_QUEUED.to_string()),
            attempt: Set(0),
            deliveries: Set(0),
            enqueued_at: Set(now),
            visible_at: Set(now),
            lease_token: Set(None),
            lease_expires_at: Set(None),
            last_error: Set(None),
            updated_at: Set(now),
        };

        JobEntity::insert(job)
            .exec_without_returning(&txn)
            .await
            .map_err(|e| queue_db_err("requeue_dead_letter_insert", e))?;

        DeadLetterEntity::delete_by_id(row.id)
            .exec(&txn)
            .await
            .map_err(|e| queue_db_err("requeue_dead_letter_delete", e))?;

        txn.commit()
            .await
            .map_err(|e| queue_db_err("requeue_dead_letter_commit", e))?;

        info!(
            dead_letter_id = %id,
            job_id = %job_id,
            kind = %row.kind,
            uri = %row.repository_uri,
            "Dead-lettered job requeued"
        );

        Ok(job_id)
    }
}
