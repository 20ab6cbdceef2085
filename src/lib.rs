//! # Repository Lifecycle
//!
//! Keeps local mirrors of upstream source repositories in sync: a durable job
//! queue, clone/update/delete workers that serialize all writes to a given
//! repository through its state record, and a scheduler that enqueues
//! periodic refreshes.

pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod models;
pub mod mutator;
pub mod queue;
pub mod repository_ref;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod worker;
pub use migration;
