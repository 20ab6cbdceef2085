//! RepositoryState entity model
//!
//! SeaORM entity for the repository_states table, one row per upstream
//! repository uri.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Persisted lifecycle state of a mirrored repository
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repository_states")]
pub struct Model {
    /// Canonical upstream uri (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub uri: String,

    /// Stable identifier used for on-disk namespacing
    pub local_id: String,

    /// Lifecycle status (uninitialized, cloning, ready, updating, deleting, error)
    pub status: String,

    /// Upstream revision of the last successful sync
    pub revision: Option<String>,

    /// Timestamp of the last successful sync
    pub last_updated_at: Option<DateTimeWithTimeZone>,

    /// Structured failure details, populated while status is error
    #[sea_orm(column_type = "JsonBinary")]
    pub error_info: Option<JsonValue>,

    /// Job that owns the current in-progress or error status
    pub active_job_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
