//! DeadLetterJob entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A job that exhausted its retry budget
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dead_letter_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Identifier the job had while it was queued
    pub job_id: Uuid,

    pub namespace: String,

    pub kind: String,

    pub repository_uri: String,

    pub local_id: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Failed executions, including the one that dead-lettered the job
    pub attempt: i32,

    /// Failure message of the final attempt
    pub reason: String,

    pub enqueued_at: DateTimeWithTimeZone,

    pub dead_lettered_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
