//! SQLite-backed durable state: the scan checkpoint and the dispatch ledger.
//!
//! Both live in one database so a crash never leaves them out of step in a
//! way the next pass cannot reconcile.

use sqlx::SqlitePool;
use thiserror::Error;

mod checkpoint;
mod ledger;

pub use checkpoint::{AdvanceOutcome, Checkpoint, CheckpointStore};
pub use ledger::{ClaimOutcome, DispatchLedger, DispatchRecord, DispatchStatus};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// A numeric value does not fit the column or the Rust type on the way
    /// back out.
    #[error("value out of range for storage: {0}")]
    OutOfRange(#[from] std::num::TryFromIntError),
    /// A status string in the database is not one we wrote.
    #[error("unknown dispatch status: {0}")]
    UnknownStatus(String),
}

/// Opens the pool, applies pragmas and runs embedded migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL lets a status query run while a pass is writing.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    // Wait for a competing writer instead of failing immediately.
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    connect(":memory:").await.expect("in-memory database")
}
