//! Offline-first meal store and sync engine.
//!
//! All reads and writes go to a local SQLite database. Every write is paired
//! with an op-queue entry in the same transaction; the [`sync::SyncEngine`]
//! drains that queue to a remote document store, pulls remote changes back,
//! and reconciles with last-writer-wins on `updated_at`.

pub mod bootstrap;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod photos;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod settings;
pub mod sync;

pub use config::SyncConfig;
pub use db::Database;
pub use error::RemoteError;
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use sync::{Collaborators, SyncEngine, SyncOutcome};
