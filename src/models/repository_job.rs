//! RepositoryJob entity model
//!
//! This module contains the SeaORM entity model for the repository_jobs table,
//! which stores queued and leased clone, update and delete jobs.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Queue row for a single repository job
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repository_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Queue namespace this job belongs to
    pub namespace: String,

    /// Job kind (clone, update, delete)
    pub kind: String,

    /// Canonical uri of the target repository
    pub repository_uri: String,

    /// Local identifier of the target repository
    pub local_id: String,

    /// Tagged job payload
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Queue status (queued or leased)
    pub status: String,

    /// Number of failed executions so far
    pub attempt: i32,

    /// Number of times the job has been handed to a worker
    pub deliveries: i32,

    pub enqueued_at: DateTimeWithTimeZone,

    /// Earliest time a queued job may be leased
    pub visible_at: DateTimeWithTimeZone,

    /// Token identifying the current lease holder
    pub lease_token: Option<Uuid>,

    /// Time at which the current lease lapses
    pub lease_expires_at: Option<DateTimeWithTimeZone>,

    /// Reason recorded by the most recent failure
    #[sea_orm(column_type = "JsonBinary")]
    pub last_error: Option<JsonValue>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
