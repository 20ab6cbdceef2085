//! Migration to create the repository_jobs table.
//!
//! This table backs the durable job queue: each row is a clone, update or
//! delete job that is either queued (visible once `visible_at` passes) or
//! leased by a worker until `lease_expires_at`.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepositoryJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepositoryJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RepositoryJobs::Namespace).text().not_null())
                    .col(ColumnDef::new(RepositoryJobs::Kind).text().not_null())
                    .col(
                        ColumnDef::new(RepositoryJobs::RepositoryUri)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RepositoryJobs::LocalId).text().not_null())
                    .col(
                        ColumnDef::new(RepositoryJobs::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryJobs::Status)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(RepositoryJobs::Attempt)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RepositoryJobs::Deliveries)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RepositoryJobs::EnqueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepositoryJobs::VisibleAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(RepositoryJobs::LeaseToken).uuid().null())
                    .col(
                        ColumnDef::new(RepositoryJobs::LeaseExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(RepositoryJobs::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(RepositoryJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Lease scans filter by namespace/kind and order by visibility
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_repository_jobs_lease ON repository_jobs (namespace, kind, status, visible_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repository_jobs_repository_uri")
                    .table(RepositoryJobs::Table)
                    .col(RepositoryJobs::RepositoryUri)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repository_jobs_lease").to_owned())
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_repository_jobs_repository_uri")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RepositoryJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepositoryJobs {
    Table,
    Id,
    Namespace,
    Kind,
    RepositoryUri,
    LocalId,
    Payload,
    Status,
    Attempt,
    Deliveries,
    EnqueuedAt,
    VisibleAt,
    LeaseToken,
    LeaseExpiresAt,
    LastError,
    UpdatedAt,
}
