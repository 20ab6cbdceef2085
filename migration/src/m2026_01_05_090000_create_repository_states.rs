//! Migration to create the repository_states table.
//!
//! One row per upstream repository uri, holding the lifecycle status, the last
//! synced revision and the job currently owning the row.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepositoryStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepositoryStates::Uri)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RepositoryStates::LocalId).text().not_null())
                    .col(
                        ColumnDef::new(RepositoryStates::Status)
                            .text()
                            .not_null()
                            .default("uninitialized"),
                    )
                    .col(ColumnDef::new(RepositoryStates::Revision).text().null())
                    .col(
                        ColumnDef::new(RepositoryStates::LastUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryStates::ErrorInfo)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(RepositoryStates::ActiveJobId).uuid().null())
                    .col(
                        ColumnDef::new(RepositoryStates::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepositoryStates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // The scheduler enumerates by status on every tick
        manager
            .create_index(
                Index::create()
                    .name("idx_repository_states_status_last_updated")
                    .table(RepositoryStates::Table)
                    .col(RepositoryStates::Status)
                    .col(RepositoryStates::LastUpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repository_states_status_last_updated")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RepositoryStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepositoryStates {
    Table,
    Uri,
    LocalId,
    Status,
    Revision,
    LastUpdatedAt,
    ErrorInfo,
    ActiveJobId,
    CreatedAt,
    UpdatedAt,
}
