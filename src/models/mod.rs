//! # Data Models
//!
//! SeaORM entities backing the repository state store and the durable job queue.

pub mod dead_letter_job;
pub mod repository_job;
pub mod repository_state;

pub use dead_letter_job::Entity as DeadLetterJob;
pub use repository_job::Entity as RepositoryJob;
pub use repository_state::Entity as RepositoryState;
