//! Dispatch ledger: one durable row per observed event.
//!
//! The row is the deduplication key, the claim, and the audit trail in one.
//! An event is claimed before its first invocation attempt, so a crash
//! mid-dispatch leaves a non-terminal row that a later pass reclaims once the
//! claim expires. Terminal rows (`succeeded`, `dead_lettered`) are never
//! touched again.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::debug;

use crate::chain::{EventId, RebalanceEvent};
use crate::store::StoreError;

/// Lifecycle of a dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Claimed, no attempt started yet.
    Pending,
    /// An invocation attempt is running.
    InFlight,
    /// Last attempt failed. The owning dispatcher keeps the claim through
    /// its backoff; the row is reclaimable only once the claim expires.
    Failed,
    Succeeded,
    DeadLettered,
}

impl DispatchStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead_lettered",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            "succeeded" => Ok(Self::Succeeded),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(StoreError::UnknownStatus(other.to_owned())),
        }
    }

    /// Terminal records are never dispatched again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatch ledger row as stored.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub event_id: String,
    pub portfolio: String,
    pub block_number: u64,
    pub session_id: Option<String>,
    pub status: DispatchStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub response: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

/// Result of [`DispatchLedger::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns this event and must dispatch it.
    Claimed,
    /// Someone else owns it, or it already reached a terminal state.
    AlreadyClaimed,
}

#[derive(Clone, Debug)]
pub struct DispatchLedger {
    pool: SqlitePool,
    claim_timeout: Duration,
}

impl DispatchLedger {
    #[must_use]
    pub fn new(pool: SqlitePool, claim_timeout: Duration) -> Self {
        Self { pool, claim_timeout }
    }

    /// Claims an event for dispatch, durably, before any invocation starts.
    ///
    /// A fresh event inserts a `pending` row. An existing non-terminal row
    /// is reclaimed only when its claim is older than the claim timeout;
    /// while the claim is live the owner may be mid-attempt or sleeping
    /// between retries, and a second scanner must stay out.
    pub async fn try_claim(&self, event: &RebalanceEvent) -> Result<ClaimOutcome, StoreError> {
        let event_id = event.event_id().to_string();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO dispatch_records \
             (event_id, portfolio, tx_hash, log_index, block_number, deviation_bps, \
              event_timestamp, status, claimed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', CURRENT_TIMESTAMP)",
        )
        .bind(&event_id)
        .bind(format!("{:#x}", event.portfolio))
        .bind(format!("{:#x}", event.tx_hash))
        .bind(i64::try_from(event.log_index)?)
        .bind(i64::try_from(event.block_number)?)
        .bind(event.deviation_bps.to_string())
        .bind(i64::try_from(event.event_timestamp)?)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        // Row exists. Timestamps are compared in SQL so they share SQLite's
        // CURRENT_TIMESTAMP text format.
        let expiry_modifier = format!("-{} seconds", self.claim_timeout.as_secs());
        let reclaimed = sqlx::query(
            "UPDATE dispatch_records \
             SET status = 'pending', claimed_at = CURRENT_TIMESTAMP, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE event_id = ? \
               AND status IN ('pending', 'in_flight', 'failed') \
               AND claimed_at <= datetime('now', ?)",
        )
        .bind(&event_id)
        .bind(&expiry_modifier)
        .execute(&self.pool)
        .await?;

        if reclaimed.rows_affected() == 1 {
            debug!(event_id, "Reclaimed stale dispatch record");
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    /// Marks the start of one invocation attempt.
    pub async fn record_attempt(
        &self,
        event_id: EventId,
        session_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE dispatch_records \
             SET status = 'in_flight', session_id = ?, \
                 attempt_count = attempt_count + 1, \
                 claimed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
             WHERE event_id = ?",
        )
        .bind(session_id)
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_succeeded(
        &self,
        event_id: EventId,
        response: &str,
    ) -> Result<(), StoreError> {
        self.finish(event_id, DispatchStatus::Succeeded, None, Some(response))
            .await
    }

    /// Attempt failed but the owner is still driving the event. Refreshes
    /// `claimed_at` so the claim stays live through the backoff sleep.
    pub async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE dispatch_records \
             SET status = 'failed', last_error = ?, \
                 claimed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
             WHERE event_id = ?",
        )
        .bind(error)
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_dead_lettered(
        &self,
        event_id: EventId,
        error: &str,
    ) -> Result<(), StoreError> {
        self.finish(event_id, DispatchStatus::DeadLettered, Some(error), None)
            .await
    }

    async fn finish(
        &self,
        event_id: EventId,
        status: DispatchStatus,
        error: Option<&str>,
        response: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE dispatch_records \
             SET status = ?, last_error = ?, response = ?, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE event_id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(response)
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(&self, event_id: EventId) -> Result<Option<DispatchRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT event_id, portfolio, block_number, session_id, status, \
                    attempt_count, last_error, response, claimed_at \
             FROM dispatch_records WHERE event_id = ?",
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    pub async fn dead_letter_count(&self) -> Result<u64, StoreError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM dispatch_records WHERE status = 'dead_lettered'")
                .fetch_one(&self.pool)
                .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n)?)
    }
}

fn record_from_row(row: SqliteRow) -> Result<DispatchRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let block_number: i64 = row.try_get("block_number")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let claimed_at: chrono::NaiveDateTime = row.try_get("claimed_at")?;

    Ok(DispatchRecord {
        event_id: row.try_get("event_id")?,
        portfolio: row.try_get("portfolio")?,
        block_number: u64::try_from(block_number)?,
        session_id: row.try_get("session_id")?,
        status: DispatchStatus::parse(&status)?,
        attempt_count: u32::try_from(attempt_count)?,
        last_error: row.try_get("last_error")?,
        response: row.try_get("response")?,
        claimed_at: claimed_at.and_utc(),
    })
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, U256};

    use super::*;
    use crate::store::test_pool;

    fn event(tx_byte: u8, log_index: u64) -> RebalanceEvent {
        RebalanceEvent {
            portfolio: Address::repeat_byte(0xab),
            deviation_bps: U256::from(750u64),
            event_timestamp: 1_700_000_000,
            block_number: 103,
            log_index,
            tx_hash: B256::repeat_byte(tx_byte),
        }
    }

    async fn ledger(claim_timeout: Duration) -> DispatchLedger {
        DispatchLedger::new(test_pool().await, claim_timeout)
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let event = event(0x01, 0);

        assert_eq!(ledger.try_claim(&event).await.unwrap(), ClaimOutcome::Claimed);

        let record = ledger.find(event.event_id()).await.unwrap().unwrap();
        assert_eq!(record.status, DispatchStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.block_number, 103);
    }

    #[tokio::test]
    async fn unexpired_claim_is_not_reclaimable() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let event = event(0x01, 0);

        ledger.try_claim(&event).await.unwrap();

        assert_eq!(
            ledger.try_claim(&event).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimable() {
        // Zero timeout: every claim is expired as soon as it is written.
        let ledger = ledger(Duration::from_secs(0)).await;
        let event = event(0x01, 0);

        ledger.try_claim(&event).await.unwrap();

        assert_eq!(ledger.try_claim(&event).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn failed_record_keeps_its_claim_until_expiry() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let event = event(0x01, 0);
        let id = event.event_id();

        // The owning dispatcher is sleeping between attempts: the attempt
        // failed, but its claim is fresh. A second scanner re-presenting
        // the same range must not start a concurrent invocation.
        ledger.try_claim(&event).await.unwrap();
        ledger.record_attempt(id, "session-a").await.unwrap();
        ledger.mark_failed(id, "agent timed out").await.unwrap();

        assert_eq!(
            ledger.try_claim(&event).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        let record = ledger.find(id).await.unwrap().unwrap();
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.session_id.as_deref(), Some("session-a"));
    }

    #[tokio::test]
    async fn expired_failed_record_is_reclaimable() {
        let ledger = ledger(Duration::from_secs(0)).await;
        let event = event(0x01, 0);

        ledger.try_claim(&event).await.unwrap();
        ledger
            .mark_failed(event.event_id(), "agent timed out")
            .await
            .unwrap();

        assert_eq!(ledger.try_claim(&event).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn terminal_records_are_never_reclaimed() {
        let ledger = ledger(Duration::from_secs(0)).await;

        let succeeded = event(0x01, 0);
        ledger.try_claim(&succeeded).await.unwrap();
        ledger
            .mark_succeeded(succeeded.event_id(), "done")
            .await
            .unwrap();

        let dead = event(0x02, 0);
        ledger.try_claim(&dead).await.unwrap();
        ledger
            .mark_dead_lettered(dead.event_id(), "gave up")
            .await
            .unwrap();

        assert_eq!(
            ledger.try_claim(&succeeded).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(
            ledger.try_claim(&dead).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn attempts_accumulate_and_session_sticks() {
        let ledger = ledger(Duration::from_secs(300)).await;
        let event = event(0x01, 0);
        let id = event.event_id();

        ledger.try_claim(&event).await.unwrap();
        ledger.record_attempt(id, "session-a").await.unwrap();
        ledger.record_attempt(id, "session-a").await.unwrap();
        ledger.mark_succeeded(id, "ack").await.unwrap();

        let record = ledger.find(id).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.session_id.as_deref(), Some("session-a"));
        assert_eq!(record.status, DispatchStatus::Succeeded);
        assert_eq!(record.response.as_deref(), Some("ack"));
    }

    #[tokio::test]
    async fn dead_letter_count_counts_only_dead_letters() {
        let ledger = ledger(Duration::from_secs(300)).await;

        let a = event(0x01, 0);
        ledger.try_claim(&a).await.unwrap();
        ledger.mark_dead_lettered(a.event_id(), "boom").await.unwrap();

        let b = event(0x02, 0);
        ledger.try_claim(&b).await.unwrap();
        ledger.mark_succeeded(b.event_id(), "ok").await.unwrap();

        assert_eq!(ledger.dead_letter_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_tx_different_log_index_are_distinct_events() {
        let ledger = ledger(Duration::from_secs(300)).await;

        assert_eq!(
            ledger.try_claim(&event(0x01, 0)).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            ledger.try_claim(&event(0x01, 1)).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }
}
