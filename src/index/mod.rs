//! Local read-optimized index
//!
//! SQLite projections of federated state. The write coordinator mutates these
//! tables inside transactions it owns end-to-end; the event ingestor keeps
//! them converged with what knots and spindles report.

pub mod artifacts;
pub mod collaborators;
pub mod cursors;
pub mod emails;
pub mod filter;
pub mod labels;
pub mod languages;
pub mod pipelines;
pub mod repos;

use crate::error::{AppError, AppResult};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};

pub use filter::{Arg, Filters};

#[derive(Clone)]
pub struct Index {
    pool: SqlitePool,
}

impl Index {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new().connect(url).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// An isolated in-memory index. A single connection keeps the database
    /// alive and visible to every borrower.
    pub async fn in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| AppError::Internal(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> AppResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}
