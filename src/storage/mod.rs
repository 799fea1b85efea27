//! Persistence adapter over PostgreSQL.
//!
//! One submodule per concern: the CRDT change store, the vault registry, the
//! partition manager, storage credentials, and the quota catalog. All queries
//! are owner-scoped; a row belonging to another user behaves as absent.

pub mod changes;
pub mod credentials;
pub mod models;
pub mod partitions;
pub mod quotas;
pub mod vaults;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

/// Embedded schema, executed idempotently at startup.
const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Duplicate record")]
    Duplicate,
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Shared handle over the bounded connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect with a bounded pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}
