//! The scan pass: checkpoint to chain head, claim, dispatch, advance.
//!
//! A pass only advances the checkpoint after every event in its range is
//! accounted for in the ledger, so a crash at any point re-scans the same
//! range and the ledger absorbs the duplicates.

use std::{collections::BTreeMap, ops::RangeInclusive, sync::Arc, time::Duration};

use alloy::{primitives::Address, providers::Provider};
use tokio::{sync::Semaphore, task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    chain::{ChainClient, RebalanceEvent},
    dispatch::{AgentInvoker, DispatchOutcome, Dispatcher},
    error::BridgeError,
    store::{AdvanceOutcome, Checkpoint, CheckpointStore, ClaimOutcome, DispatchLedger},
};

mod range_iterator;

use range_iterator::ChunkRanges;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub chain_id: u64,
    /// How far behind the head to seed the checkpoint on first run.
    pub lookback_blocks: u64,
    /// Provider cap on blocks per `eth_getLogs` call.
    pub max_range_per_scan: u64,
    /// Concurrent portfolio dispatch groups.
    pub dispatch_concurrency: usize,
    /// Hard limit on the dispatch phase of one pass.
    pub pass_deadline: Duration,
    pub poll_interval: Duration,
}

/// What one pass saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub range: Option<RangeInclusive<u64>>,
    pub logs_fetched: usize,
    pub decode_failures: usize,
    pub duplicates_skipped: usize,
    pub dispatched: usize,
    pub dead_lettered: usize,
    /// The dispatch phase was cut off; the checkpoint did not advance.
    pub deadline_hit: bool,
    pub advanced_to: Option<u64>,
}

pub struct ScanLoop<P, A> {
    chain: ChainClient<P>,
    checkpoints: CheckpointStore,
    ledger: DispatchLedger,
    dispatcher: Dispatcher<A>,
    config: ScanConfig,
}

impl<P: Provider + Clone, A: AgentInvoker> ScanLoop<P, A> {
    pub fn new(
        chain: ChainClient<P>,
        checkpoints: CheckpointStore,
        ledger: DispatchLedger,
        dispatcher: Dispatcher<A>,
        config: ScanConfig,
    ) -> Self {
        Self {
            chain,
            checkpoints,
            ledger,
            dispatcher,
            config,
        }
    }

    /// Runs passes on the poll interval until `cancel` fires.
    ///
    /// A failed pass is logged and retried on the next tick; the checkpoint
    /// protocol makes re-running the same range safe.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BridgeError> {
        loop {
            if cancel.is_cancelled() {
                info!("Scanner stopping");
                return Ok(());
            }

            match self.run_once().await {
                Ok(summary) => info!(?summary, "Scan pass complete"),
                Err(e) => error!(error = %e, "Scan pass failed, will retry next tick"),
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Scanner stopping");
                    return Ok(());
                }
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One full pass. Loops internally only when the checkpoint advance
    /// loses a compare-and-set race and the range has to be recomputed.
    pub async fn run_once(&self) -> Result<PassSummary, BridgeError> {
        loop {
            let checkpoint = self.read_or_seed_checkpoint().await?;
            let current = self.chain.current_block().await?;

            if checkpoint.last_scanned_block >= current {
                debug!(
                    last_scanned = checkpoint.last_scanned_block,
                    current, "No new blocks"
                );
                return Ok(PassSummary::default());
            }

            let from = checkpoint.last_scanned_block + 1;
            let to = current;
            info!(from, to, "Scanning block range");

            let mut summary = PassSummary {
                range: Some(from..=to),
                ..PassSummary::default()
            };

            let claimed = self.collect_claimed(from, to, &mut summary).await?;
            let total_claimed = claimed.values().map(Vec::len).sum::<usize>();

            match timeout(self.config.pass_deadline, self.dispatch_all(claimed)).await {
                Ok(result) => {
                    let (dispatched, dead_lettered) = result?;
                    summary.dispatched = dispatched;
                    summary.dead_lettered = dead_lettered;
                }
                Err(_) => {
                    // Whatever is still non-terminal stays claimed in the
                    // ledger and is reclaimed after the claim timeout. The
                    // checkpoint must not move past unaccounted events.
                    warn!(
                        total_claimed,
                        "Pass deadline exceeded, aborting in-flight dispatches"
                    );
                    summary.deadline_hit = true;
                    return Ok(summary);
                }
            }

            match self
                .checkpoints
                .advance(self.config.chain_id, to, checkpoint.last_scanned_block)
                .await?
            {
                AdvanceOutcome::Advanced => {
                    summary.advanced_to = Some(to);
                    return Ok(summary);
                }
                AdvanceOutcome::Conflict => {
                    warn!(
                        expected_prev = checkpoint.last_scanned_block,
                        "Checkpoint moved by another scanner, recomputing range"
                    );
                }
            }
        }
    }

    async fn read_or_seed_checkpoint(&self) -> Result<Checkpoint, BridgeError> {
        if let Some(checkpoint) = self.checkpoints.read(self.config.chain_id).await? {
            return Ok(checkpoint);
        }

        let current = self.chain.current_block().await?;
        let seed = current.saturating_sub(self.config.lookback_blocks);
        info!(
            seed,
            lookback = self.config.lookback_blocks,
            "No checkpoint found, seeding behind chain head"
        );
        Ok(self.checkpoints.seed(self.config.chain_id, seed).await?)
    }

    /// Fetches and decodes `[from, to]` in chunks, claiming each new event.
    /// Claimed events come back grouped per portfolio in chain order.
    async fn collect_claimed(
        &self,
        from: u64,
        to: u64,
        summary: &mut PassSummary,
    ) -> Result<BTreeMap<Address, Vec<RebalanceEvent>>, BridgeError> {
        let mut claimed: BTreeMap<Address, Vec<RebalanceEvent>> = BTreeMap::new();

        for chunk in ChunkRanges::new(from, to, self.config.max_range_per_scan) {
            let logs = self
                .chain
                .fetch_rebalance_logs(*chunk.start(), *chunk.end())
                .await?;
            summary.logs_fetched += logs.len();

            for log in &logs {
                let event = match RebalanceEvent::decode(log) {
                    Ok(event) => event,
                    Err(e) => {
                        // One malformed entry must not block the range.
                        warn!(
                            error = %e,
                            tx_hash = ?log.transaction_hash,
                            log_index = ?log.log_index,
                            "Skipping undecodable log"
                        );
                        summary.decode_failures += 1;
                        continue;
                    }
                };

                match self.ledger.try_claim(&event).await? {
                    ClaimOutcome::Claimed => {
                        claimed.entry(event.portfolio).or_default().push(event);
                    }
                    ClaimOutcome::AlreadyClaimed => {
                        debug!(event_id = %event.event_id(), "Event already handled, skipping");
                        summary.duplicates_skipped += 1;
                    }
                }
            }
        }

        // Same-portfolio events dispatch in chain order; portfolios are
        // independent of each other.
        for events in claimed.values_mut() {
            events.sort_by_key(|event| (event.block_number, event.log_index));
        }

        Ok(claimed)
    }

    /// Dispatches all portfolio groups, at most `dispatch_concurrency` at a
    /// time. Events within one group run sequentially.
    async fn dispatch_all(
        &self,
        claimed: BTreeMap<Address, Vec<RebalanceEvent>>,
    ) -> Result<(usize, usize), BridgeError> {
        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (portfolio, events) in claimed {
            debug!(%portfolio, count = events.len(), "Queueing portfolio dispatch group");
            let semaphore = Arc::clone(&semaphore);
            let dispatcher = self.dispatcher.clone();

            tasks.spawn(async move {
                // The semaphore is never closed while tasks are running.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Ok((0usize, 0usize));
                };

                let mut dispatched = 0usize;
                let mut dead_lettered = 0usize;
                for event in events {
                    match dispatcher.dispatch(&event).await? {
                        DispatchOutcome::Succeeded { .. } => dispatched += 1,
                        DispatchOutcome::DeadLettered { .. } => dead_lettered += 1,
                    }
                }
                Ok::<_, crate::store::StoreError>((dispatched, dead_lettered))
            });
        }

        let mut totals = (0usize, 0usize);
        while let Some(joined) = tasks.join_next().await {
            let (dispatched, dead_lettered) = joined??;
            totals.0 += dispatched;
            totals.1 += dead_lettered;
        }
        Ok(totals)
    }
}
