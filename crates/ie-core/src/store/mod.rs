//! Enrichment state persistence.
//!
//! The store is the single source of truth for pipeline progress. Writes are
//! upserts keyed by ticket id, so re-running a step for the same input is
//! safe.

mod memory;
#[cfg(feature = "database")]
mod sqlite;

pub use memory::InMemoryStateStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStateStore;

use crate::state::{EnrichmentStage, EnrichmentState};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by state stores.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => StoreError::Connection(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) => StoreError::Query(db_err.message().to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err.to_string())
    }
}

/// Durable storage for [`EnrichmentState`] records.
#[async_trait]
pub trait EnrichmentStateStore: Send + Sync {
    async fn get(&self, ticket_id: &str) -> Result<Option<EnrichmentState>, StoreError>;

    /// Inserts or replaces the record for `state.ticket_id`.
    async fn upsert(&self, state: &EnrichmentState) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, ticket_id: &str) -> Result<bool, StoreError>;

    /// Records in any of `stages`, oldest update first.
    async fn list_by_stages(
        &self,
        stages: &[EnrichmentStage],
    ) -> Result<Vec<EnrichmentState>, StoreError>;
}
