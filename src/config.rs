//! TOML configuration.

use std::{path::Path, time::Duration};

use alloy::primitives::Address;
use serde::Deserialize;
use thiserror::Error;
use tracing::Level;
use url::Url;

use crate::{chain, dispatch::RetryPolicy, scan::ScanConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("chain.max_range_per_scan must be at least 1")]
    ZeroMaxRange,
    #[error("dispatch.concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("dispatch.max_retry_attempts must be at least 1")]
    ZeroMaxAttempts,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite database holding the checkpoint and the dispatch ledger.
    pub database_url: String,
    pub log_level: Option<LogLevel>,
    pub chain: ChainConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: Url,
    pub chain_id: u64,
    /// Keeper contract emitting `RebalanceRequested`.
    pub keeper: Address,
    /// How far behind the head to seed the checkpoint on first run.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    /// Provider cap on blocks per `eth_getLogs` call.
    #[serde(default = "default_max_range_per_scan")]
    pub max_range_per_scan: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the agent runtime API.
    pub endpoint: Url,
    pub agent_id: String,
    pub agent_alias_id: String,
    /// Covers one invocation including the streamed response body.
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_retry_attempts: u32,
    pub concurrency: usize,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// A non-terminal claim older than this is considered abandoned.
    pub claim_timeout_secs: u64,
    pub pass_deadline_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            concurrency: 4,
            retry_min_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            claim_timeout_secs: 300,
            pass_deadline_secs: 270,
            poll_interval_secs: 30,
        }
    }
}

fn default_lookback_blocks() -> u64 {
    100
}

fn default_max_range_per_scan() -> u64 {
    2_000
}

fn default_call_timeout_secs() -> u64 {
    chain::DEFAULT_CALL_TIMEOUT.as_secs()
}

fn default_rpc_max_retries() -> usize {
    chain::DEFAULT_MAX_RETRIES
}

fn default_invoke_timeout_secs() -> u64 {
    180
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.max_range_per_scan == 0 {
            return Err(ConfigError::ZeroMaxRange);
        }
        if self.dispatch.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.dispatch.max_retry_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(())
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.call_timeout_secs)
    }

    #[must_use]
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.invoke_timeout_secs)
    }

    #[must_use]
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.claim_timeout_secs)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.dispatch.max_retry_attempts,
            Duration::from_millis(self.dispatch.retry_min_delay_ms),
            Duration::from_millis(self.dispatch.retry_max_delay_ms),
        )
    }

    #[must_use]
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            chain_id: self.chain.chain_id,
            lookback_blocks: self.chain.lookback_blocks,
            max_range_per_scan: self.chain.max_range_per_scan,
            dispatch_concurrency: self.dispatch.concurrency,
            pass_deadline: Duration::from_secs(self.dispatch.pass_deadline_secs),
            poll_interval: Duration::from_secs(self.dispatch.poll_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        database_url = "sqlite://bridge.db"

        [chain]
        rpc_url = "wss://eth.example/ws"
        chain_id = 1
        keeper = "0x5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e"

        [agent]
        endpoint = "https://agent-runtime.example"
        agent_id = "AGENT1"
        agent_alias_id = "ALIAS1"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.chain.lookback_blocks, 100);
        assert_eq!(config.chain.max_range_per_scan, 2_000);
        assert_eq!(config.dispatch.max_retry_attempts, 5);
        assert_eq!(config.dispatch.concurrency, 4);
        assert_eq!(config.dispatch.claim_timeout_secs, 300);
        assert!(config.log_level.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn full_config_overrides_defaults() {
        let raw = r#"
            database_url = "sqlite://bridge.db"
            log_level = "debug"

            [chain]
            rpc_url = "wss://eth.example/ws"
            chain_id = 8453
            keeper = "0x5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e"
            lookback_blocks = 50
            max_range_per_scan = 500

            [agent]
            endpoint = "https://agent-runtime.example"
            agent_id = "AGENT1"
            agent_alias_id = "ALIAS1"
            invoke_timeout_secs = 60

            [dispatch]
            max_retry_attempts = 3
            concurrency = 2
            retry_min_delay_ms = 100
            retry_max_delay_ms = 1000
            claim_timeout_secs = 120
            pass_deadline_secs = 100
            poll_interval_secs = 10
        "#;

        let config: Config = toml::from_str(raw).unwrap();

        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.chain.chain_id, 8453);
        assert_eq!(config.chain.max_range_per_scan, 500);
        assert_eq!(config.invoke_timeout(), Duration::from_secs(60));
        assert_eq!(config.claim_timeout(), Duration::from_secs(120));
        assert_eq!(config.scan_config().dispatch_concurrency, 2);
    }

    #[test]
    fn zero_max_range_is_rejected() {
        let raw = MINIMAL.replace(
            "chain_id = 1",
            "chain_id = 1\n        max_range_per_scan = 0",
        );
        let config: Config = toml::from_str(&raw).unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroMaxRange)
        ));
    }

    #[test]
    fn missing_keeper_is_a_parse_error() {
        let raw = MINIMAL.replace(
            "keeper = \"0x5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e\"",
            "",
        );

        assert!(toml::from_str::<Config>(&raw).is_err());
    }
}
