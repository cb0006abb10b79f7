use thiserror::Error;

use crate::{chain::ChainError, store::StoreError};

/// Anything that aborts a scan pass. The checkpoint never advances past a
/// pass that ended in one of these.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
