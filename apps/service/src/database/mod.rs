/// Store collaborator
///
/// Monitor definitions, the per-monitor lock flag and the append-only result
/// history live here. The scheduler only talks to the [`MonitorStore`] trait;
/// [`LibsqlStore`] is the production implementation.

pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::{LibsqlStore, MonitorStore};

use anyhow::Result;
use thiserror::Error;

use crate::models::UnknownKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database query failed: {0}")]
    Query(#[from] libsql::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool::managed::PoolError<libsql::Error>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Why a monitor could not be claimed
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("monitor not found")]
    NotFound,

    #[error("monitor is already locked")]
    AlreadyLocked,

    #[error("monitor is not due")]
    NotDue,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
