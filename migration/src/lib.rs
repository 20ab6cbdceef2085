//! Database migrations for the repository lifecycle service.
//!
//! Creates the repository state table, the durable job queue table and the
//! dead-letter log using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_repository_states;
mod m2026_01_05_090100_create_repository_jobs;
mod m2026_01_05_090200_create_dead_letter_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_repository_states::Migration),
            Box::new(m2026_01_05_090100_create_repository_jobs::Migration),
            Box::new(m2026_01_05_090200_create_dead_letter_jobs::Migration),
        ]
    }
}
