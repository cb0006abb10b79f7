use std::path::PathBuf;

use alloy::providers::{Provider, ProviderBuilder};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use rebalancer_bridge::{
    chain::{ChainClient, DEFAULT_RETRY_MIN_DELAY},
    config::{Config, LogLevel},
    dispatch::{Dispatcher, HttpAgentInvoker},
    scan::ScanLoop,
    store::{self, CheckpointStore, DispatchLedger},
    telemetry::setup_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "rebalancer-bridge")]
#[command(about = "Bridges on-chain rebalance signals to an off-chain agent")]
#[command(version)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scanner continuously on the configured poll interval
    Start,
    /// Run a single scan pass and exit
    ScanOnce,
    /// Print the checkpoint and dead-letter count
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    setup_tracing(config.log_level.unwrap_or(LogLevel::Info));

    let pool = store::connect(&config.database_url).await?;
    let checkpoints = CheckpointStore::new(pool.clone());
    let ledger = DispatchLedger::new(pool, config.claim_timeout());

    match cli.command {
        Commands::Status => {
            match checkpoints.read(config.chain.chain_id).await? {
                Some(checkpoint) => println!(
                    "checkpoint: block {} (updated {})",
                    checkpoint.last_scanned_block, checkpoint.updated_at
                ),
                None => println!("checkpoint: not yet seeded"),
            }
            println!("dead-lettered events: {}", ledger.dead_letter_count().await?);
        }
        Commands::ScanOnce => {
            let scanner = build_scanner(&config, checkpoints, ledger).await?;
            let summary = scanner.run_once().await?;
            info!(?summary, "Scan pass complete");
        }
        Commands::Start => {
            let scanner = build_scanner(&config, checkpoints, ledger).await?;

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    signal_cancel.cancel();
                }
            });

            scanner.run(cancel).await?;
        }
    }

    Ok(())
}

async fn build_scanner(
    config: &Config,
    checkpoints: CheckpointStore,
    ledger: DispatchLedger,
) -> anyhow::Result<ScanLoop<impl Provider + Clone, HttpAgentInvoker>> {
    let provider = ProviderBuilder::new()
        .connect(config.chain.rpc_url.as_str())
        .await?;
    let chain = ChainClient::new(
        provider,
        config.chain.keeper,
        config.call_timeout(),
        config.chain.rpc_max_retries,
        DEFAULT_RETRY_MIN_DELAY,
    );

    // Fail fast when the chain is unreachable instead of spinning on a
    // broken endpoint.
    let current = chain.current_block().await?;
    info!(current_block = current, chain_id = config.chain.chain_id, "Connected to chain");

    let agent = HttpAgentInvoker::new(
        config.agent.endpoint.clone(),
        config.agent.agent_id.clone(),
        config.agent.agent_alias_id.clone(),
        config.invoke_timeout(),
    );
    let dispatcher = Dispatcher::new(agent, ledger.clone(), config.retry_policy());

    Ok(ScanLoop::new(
        chain,
        checkpoints,
        ledger,
        dispatcher,
        config.scan_config(),
    ))
}
