//! SeaORM-backed [`RepositoryStateStore`].
//!
//! Compare-and-set is a single conditional `UPDATE ... WHERE uri = ? AND status
//! IN (...)`, so it stays atomic on both SQLite and Postgres without holding a
//! transaction open.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use tracing::debug;

use super::{ErrorInfo, RepositoryState, RepositoryStateStore, RepositoryStatus};
use crate::error::{StoreError, store_db_err};
use crate::models::repository_state::{ActiveModel, Column, Entity, Model};
use crate::repository_ref::RepositoryRef;

/// Repository state store over the `repository_states` table.
#[derive(Clone)]
pub struct DbRepositoryStateStore {
    db: DatabaseConnection,
}

impl DbRepositoryStateStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn status_values(expected: &[RepositoryStatus]) -> Vec<String> {
    expected.iter().map(|s| s.as_str().to_string()).collect()
}

fn encode_error_info(state: &RepositoryState) -> Result<Option<serde_json::Value>, StoreError> {
    state
        .error_info
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            uri: state.uri().to_string(),
            message: format!("failed to encode error info: {}", e),
        })
}

/// Active model carrying every mutable column of `state`.
fn mutable_columns(state: &RepositoryState, now: DateTime<Utc>) -> Result<ActiveModel, StoreError> {
    Ok(ActiveModel {
        status: Set(state.status.as_str().to_string()),
        revision: Set(state.revision.clone()),
        last_updated_at: Set(state.last_updated_at.map(|t| t.fixed_offset())),
        error_info: Set(encode_error_info(state)?),
        active_job_id: Set(state.active_job_id),
        updated_at: Set(now.fixed_offset()),
        ..Default::default()
    })
}

fn full_row(state: &RepositoryState, now: DateTime<Utc>) -> Result<ActiveModel, StoreError> {
    let mut model = mutable_columns(state, now)?;
    model.uri = Set(state.uri().to_string());
    model.local_id = Set(state.repository.local_id().to_string());
    model.created_at = Set(now.fixed_offset());
    Ok(model)
}

impl TryFrom<Model> for RepositoryState {
    type Error = StoreError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let status = model
            .status
            .parse::<RepositoryStatus>()
            .map_err(|message| StoreError::Corrupt {
                uri: model.uri.clone(),
                message,
            })?;

        let error_info = model
            .error_info
            .map(serde_json::from_value::<ErrorInfo>)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                uri: model.uri.clone(),
                message: format!("invalid error info: {}", e),
            })?;

        Ok(RepositoryState {
            repository: RepositoryRef::from_parts(model.uri, model.local_id),
            status,
            revision: model.revision,
            last_updated_at: model.last_updated_at.map(|t| t.with_timezone(&Utc)),
            error_info,
            active_job_id: model.active_job_id,
        })
    }
}

#[async_trait]
impl RepositoryStateStore for DbRepositoryStateStore {
    async fn get(&self, uri: &str) -> Result<Option<RepositoryState>, StoreError> {
        Entity::find_by_id(uri.to_string())
            .one(&self.db)
            .await
            .map_err(|e| store_db_err("get", e))?
            .map(RepositoryState::try_from)
            .transpose()
    }

    async fn put(&self, state: &RepositoryState) -> Result<(), StoreError> {
        let row = full_row(state, Utc::now())?;

        Entity::insert(row)
            .on_conflict(
                OnConflict::column(Column::Uri)
                    .update_columns([
                        Column::Status,
                        Column::Revision,
                        Column::LastUpdatedAt,
                        Column::ErrorInfo,
                        Column::ActiveJobId,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| store_db_err("put", e))?;

        Ok(())
    }

    async fn compare_and_set(
        &self,
        expected: &[RepositoryStatus],
        state: &RepositoryState,
    ) -> Result<bool, StoreError> {
        if expected.is_empty() {
            return Ok(false);
        }

        let result = Entity::update_many()
            .set(mutable_columns(state, Utc::now())?)
            .filter(Column::Uri.eq(state.uri()))
            .filter(Column::Status.is_in(status_values(expected)))
            .exec(&self.db)
            .await
            .map_err(|e| store_db_err("compare_and_set", e))?;

        let applied = result.rows_affected == 1;
        debug!(
            uri = %state.uri(),
            to = %state.status,
            applied,
            "Repository state compare-and-set"
        );
        Ok(applied)
    }

    async fn insert_if_absent(&self, state: &RepositoryState) -> Result<bool, StoreError> {
        let row = full_row(state, Utc::now())?;

        let inserted = Entity::insert(row)
            .on_conflict(OnConflict::column(Column::Uri).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| store_db_err("insert_if_absent", e))?;

        Ok(inserted == 1)
    }

    async fn remove(&self, uri: &str, expected: &[RepositoryStatus]) -> Result<bool, StoreError> {
        if expected.is_empty() {
            return Ok(false);
        }

        let result = Entity::delete_many()
            .filter(Column::Uri.eq(uri))
            .filter(Column::Status.is_in(status_values(expected)))
            .exec(&self.db)
            .await
            .map_err(|e| store_db_err("remove", e))?;

        Ok(result.rows_affected == 1)
    }

    async fn list_by_status(
        &self,
        status: RepositoryStatus,
    ) -> Result<Vec<RepositoryState>, StoreError> {
        Entity::find()
            .filter(Column::Status.eq(status.as_str()))
            .order_by_asc(Column::Uri)
            .all(&self.db)
            .await
            .map_err(|e| store_db_err("list_by_status", e))?
            .into_iter()
            .map(RepositoryState::try_from)
            .collect()
    }
}
