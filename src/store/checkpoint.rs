//! Durable scan checkpoint with compare-and-set advancement.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::store::StoreError;

/// Last block that has been fully scanned and accounted for on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub chain_id: u64,
    pub last_scanned_block: u64,
    pub updated_at: DateTime<Utc>,
}

/// Result of a conditional [`CheckpointStore::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    /// The stored value no longer matches what the caller read. Another
    /// scanner moved it; re-read and recompute the range.
    Conflict,
}

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn read(&self, chain_id: u64) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT last_scanned_block, updated_at FROM checkpoints WHERE chain_id = ?",
        )
        .bind(i64::try_from(chain_id)?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let block: i64 = row.try_get("last_scanned_block")?;
            let updated_at: chrono::NaiveDateTime = row.try_get("updated_at")?;
            Ok(Checkpoint {
                chain_id,
                last_scanned_block: u64::try_from(block)?,
                updated_at: updated_at.and_utc(),
            })
        })
        .transpose()
    }

    /// Seeds the checkpoint on first run. Loses the race gracefully: if
    /// another scanner seeded first, its value is kept and returned.
    pub async fn seed(&self, chain_id: u64, block: u64) -> Result<Checkpoint, StoreError> {
        sqlx::query(
            "INSERT INTO checkpoints (chain_id, last_scanned_block) VALUES (?, ?) \
             ON CONFLICT(chain_id) DO NOTHING",
        )
        .bind(i64::try_from(chain_id)?)
        .bind(i64::try_from(block)?)
        .execute(&self.pool)
        .await?;

        debug!(chain_id, block, "Checkpoint seed attempted");

        self.read(chain_id)
            .await?
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    /// Moves the checkpoint to `new_block` only if it still equals
    /// `expected_prev`. Zero rows updated means another scanner won.
    pub async fn advance(
        &self,
        chain_id: u64,
        new_block: u64,
        expected_prev: u64,
    ) -> Result<AdvanceOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE checkpoints \
             SET last_scanned_block = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE chain_id = ? AND last_scanned_block = ?",
        )
        .bind(i64::try_from(new_block)?)
        .bind(i64::try_from(chain_id)?)
        .bind(i64::try_from(expected_prev)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(AdvanceOutcome::Conflict)
        } else {
            Ok(AdvanceOutcome::Advanced)
        }
    }
}
