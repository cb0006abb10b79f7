//! Decoding of raw `eth_getLogs` entries into [`RebalanceEvent`]s.

use std::fmt;

use alloy::{
    primitives::{Address, B256, U256, keccak256, ruint::FromUintError},
    rpc::types::Log,
    sol,
};
use thiserror::Error;

sol! {
    /// Emitted by the keeper contract when a portfolio's allocation drifts
    /// past its rebalance threshold.
    #[derive(Debug)]
    event RebalanceRequested(address indexed portfolio, uint256 currentDeviationBps, uint256 timestamp);
}

/// Errors raised while turning a raw log into a [`RebalanceEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The node returned a log without a field we require for identity.
    /// Pending logs look like this; we only scan mined ranges, so treat it
    /// as malformed.
    #[error("log is missing the `{0}` field")]
    MissingLogField(&'static str),
    /// Topic/data layout does not match the event ABI.
    #[error("log does not decode as RebalanceRequested: {0}")]
    Sol(#[from] alloy::sol_types::Error),
    /// The contract emits the timestamp as uint256; anything that does not
    /// fit in u64 is garbage.
    #[error("event timestamp does not fit in u64: {0}")]
    Timestamp(#[from] FromUintError<u64>),
}

/// Identity of an on-chain event, stable across re-scans and restarts.
///
/// Derived from `(transaction_hash, log_index)`, the only pair that is unique
/// per log on a given chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(B256);

impl EventId {
    #[must_use]
    pub fn new(tx_hash: B256, log_index: u64) -> Self {
        let mut preimage = [0u8; 40];
        preimage[..32].copy_from_slice(tx_hash.as_slice());
        preimage[32..].copy_from_slice(&log_index.to_be_bytes());
        Self(keccak256(preimage))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A decoded `RebalanceRequested` log with the chain coordinates needed for
/// deduplication and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceEvent {
    pub portfolio: Address,
    /// Allocation deviation in basis points, as emitted.
    pub deviation_bps: U256,
    /// Block timestamp the contract observed when emitting.
    pub event_timestamp: u64,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
}

impl RebalanceEvent {
    pub fn decode(log: &Log) -> Result<Self, DecodeError> {
        let tx_hash = log
            .transaction_hash
            .ok_or(DecodeError::MissingLogField("transaction_hash"))?;
        let log_index = log
            .log_index
            .ok_or(DecodeError::MissingLogField("log_index"))?;
        let block_number = log
            .block_number
            .ok_or(DecodeError::MissingLogField("block_number"))?;

        let decoded = log.log_decode::<RebalanceRequested>()?;
        let data = decoded.data();

        Ok(Self {
            portfolio: data.portfolio,
            deviation_bps: data.currentDeviationBps,
            event_timestamp: u64::try_from(data.timestamp)?,
            block_number,
            log_index,
            tx_hash,
        })
    }

    #[must_use]
    pub fn event_id(&self) -> EventId {
        EventId::new(self.tx_hash, self.log_index)
    }
}
