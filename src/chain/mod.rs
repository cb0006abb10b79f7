//! Read-only chain access with retry and timeout baked in.
//!
//! Every RPC call retries transient failures with exponential backoff and is
//! wrapped in an overall timeout, so callers see either a result or a
//! [`ChainError`] within a bounded time.

use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::Address,
    providers::Provider,
    rpc::types::{Filter, Log},
    sol_types::SolEvent,
    transports::{RpcError, TransportErrorKind},
};
use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info};

mod decoder;

pub use decoder::{DecodeError, EventId, RebalanceEvent, RebalanceRequested};

/// Overall deadline for a single RPC call including all retries.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: usize = 3;
/// First backoff delay between attempts.
pub const DEFAULT_RETRY_MIN_DELAY: Duration = Duration::from_millis(500);

/// Errors surfaced by [`ChainClient`] calls.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// RPC call kept failing after all retries.
    #[error("RPC error: {0}")]
    Unavailable(#[from] Arc<RpcError<TransportErrorKind>>),
    /// The call, retries included, outlived the configured timeout.
    #[error("chain call timed out")]
    Timeout,
    /// Caller asked for a descending range.
    #[error("invalid block range: from {from} > to {to}")]
    InvalidRange { from: u64, to: u64 },
}

impl From<RpcError<TransportErrorKind>> for ChainError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        Self::Unavailable(Arc::new(error))
    }
}

/// Provider wrapper scoped to the keeper contract's `RebalanceRequested` logs.
#[derive(Clone, Debug)]
pub struct ChainClient<P> {
    provider: P,
    keeper: Address,
    call_timeout: Duration,
    max_retries: usize,
    retry_min_delay: Duration,
}

impl<P: Provider + Clone> ChainClient<P> {
    pub fn new(
        provider: P,
        keeper: Address,
        call_timeout: Duration,
        max_retries: usize,
        retry_min_delay: Duration,
    ) -> Self {
        Self {
            provider,
            keeper,
            call_timeout,
            max_retries,
            retry_min_delay,
        }
    }

    /// Latest block number the node knows about.
    pub async fn current_block(&self) -> Result<u64, ChainError> {
        let result = self
            .with_retry(|| {
                let provider = self.provider.clone();
                async move { provider.get_block_number().await }
            })
            .await;

        if let Err(e) = &result {
            error!(error = %e, "Failed to fetch current block number");
        }

        result
    }

    /// `RebalanceRequested` logs from the keeper contract in `[from, to]`,
    /// both bounds inclusive.
    pub async fn fetch_rebalance_logs(&self, from: u64, to: u64) -> Result<Vec<Log>, ChainError> {
        if from > to {
            return Err(ChainError::InvalidRange { from, to });
        }

        let filter = Filter::new()
            .address(self.keeper)
            .event_signature(RebalanceRequested::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        let result = self
            .with_retry(|| {
                let provider = self.provider.clone();
                let filter = filter.clone();
                async move { provider.get_logs(&filter).await }
            })
            .await;

        if let Err(e) = &result {
            error!(error = %e, from, to, "Failed to fetch logs");
        }

        result
    }

    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, ChainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        let retry_strategy = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.retry_min_delay);

        timeout(
            self.call_timeout,
            operation
                .retry(retry_strategy)
                .notify(|err: &RpcError<TransportErrorKind>, dur: Duration| {
                    info!(error = %err, "RPC error, retrying after {:?}", dur);
                })
                .sleep(tokio::time::sleep),
        )
        .await
        .map_err(|_| ChainError::Timeout)?
        .map_err(ChainError::from)
    }
}

#[cfg(test)]
mod tests {
    use alloy::providers::{ProviderBuilder, mock::Asserter};

    use super::*;

    fn client(asserter: &Asserter) -> ChainClient<impl Provider + Clone> {
        let provider = ProviderBuilder::new().connect_mocked_client(asserter.clone());
        ChainClient::new(
            provider,
            Address::repeat_byte(0x5e),
            Duration::from_secs(2),
            2,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn current_block_returns_node_height() {
        let asserter = Asserter::new();
        asserter.push_success(&"0x69");

        let block = client(&asserter).current_block().await.unwrap();

        assert_eq!(block, 105);
    }

    #[tokio::test]
    async fn current_block_retries_transient_failures() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("connection reset");
        asserter.push_failure_msg("connection reset");
        asserter.push_success(&"0x64");

        let block = client(&asserter).current_block().await.unwrap();

        assert_eq!(block, 100);
    }

    #[tokio::test]
    async fn current_block_gives_up_after_max_retries() {
        let asserter = Asserter::new();
        for _ in 0..3 {
            asserter.push_failure_msg("connection reset");
        }

        let err = client(&asserter).current_block().await.unwrap_err();

        assert!(matches!(err, ChainError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fetch_rejects_inverted_range() {
        let asserter = Asserter::new();

        let err = client(&asserter)
            .fetch_rebalance_logs(10, 5)
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::InvalidRange { from: 10, to: 5 }));
    }

    #[tokio::test]
    async fn fetch_returns_empty_range() {
        let asserter = Asserter::new();
        asserter.push_success(&serde_json::json!([]));

        let logs = client(&asserter).fetch_rebalance_logs(5, 10).await.unwrap();

        assert!(logs.is_empty());
    }
}
