//! Migration to create the dead_letter_jobs table.
//!
//! Jobs that exhausted their retry budget are moved here and stay until an
//! operator re-enqueues them.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeadLetterJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeadLetterJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeadLetterJobs::JobId).uuid().not_null())
                    .col(ColumnDef::new(DeadLetterJobs::Namespace).text().not_null())
                    .col(ColumnDef::new(DeadLetterJobs::Kind).text().not_null())
                    .col(
                        ColumnDef::new(DeadLetterJobs::RepositoryUri)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeadLetterJobs::LocalId).text().not_null())
                    .col(
                        ColumnDef::new(DeadLetterJobs::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeadLetterJobs::Attempt).integer().not_null())
                    .col(ColumnDef::new(DeadLetterJobs::Reason).text().not_null())
                    .col(
                        ColumnDef::new(DeadLetterJobs::EnqueuedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeadLetterJobs::DeadLetteredAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dead_letter_jobs_namespace_dead_lettered")
                    .table(DeadLetterJobs::Table)
                    .col(DeadLetterJobs::Namespace)
                    .col(DeadLetterJobs::DeadLetteredAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_dead_letter_jobs_namespace_dead_lettered")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DeadLetterJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeadLetterJobs {
    Table,
    Id,
    JobId,
    Namespace,
    Kind,
    RepositoryUri,
    LocalId,
    Payload,
    Attempt,
    Reason,
    EnqueuedAt,
    DeadLetteredAt,
}
