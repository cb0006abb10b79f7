//! Bridges on-chain rebalance signals to an off-chain rebalancing agent.
//!
//! A keeper contract emits `RebalanceRequested(portfolio, deviationBps,
//! timestamp)` when a portfolio drifts past its threshold. This crate scans
//! for those events, deduplicates them against a durable ledger, and invokes
//! an agent runtime once per event with a natural-language trigger.
//!
//! Delivery is at-least-once with durable deduplication: an event is claimed
//! in SQLite before its first invocation attempt, and the scan checkpoint
//! only advances once every event in the scanned range has a ledger row. A
//! crash at any point re-scans the same range; the ledger absorbs the
//! duplicates.

pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod scan;
pub mod store;
pub mod telemetry;

pub use error::BridgeError;
