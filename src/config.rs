//! Configuration management for the swap node
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    pub swap: SwapConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub instance_id: String,
    /// Env var holding the hex-encoded negotiation key (dev mode)
    pub negotiation_key_env: Option<String>,
    pub health_check_interval_secs: u64,
}

/// Engine-level knobs. Timeout units, confirmation thresholds and retry
/// budgets are configuration, not constants.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    /// Dispatch/timer tick interval
    pub tick_interval_ms: u64,
    /// Minimum required gap between the initiator and participant timeouts
    pub min_timeout_gap_secs: u64,
    /// A proposal not accepted within this window expires
    pub negotiation_timeout_secs: u64,
    /// Past timeout + grace without a refund broadcast, the swap is failed
    /// as funds-at-risk instead of retried forever
    pub refund_grace_secs: u64,
    /// How long terminal sessions are kept before the retention sweep
    pub retention_secs: u64,
    /// Maximum accepted peer clock skew on signed messages
    pub max_clock_skew_secs: u64,
    /// Bounded attempt count for chain RPC calls and broadcasts
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    /// Contract family implemented by this ledger
    pub family: ChainFamily,
    /// Adapter backend; "sim" runs the in-memory chain
    pub adapter: String,
    pub rpc_urls: Vec<String>,
    /// Confirmations required before a funding is considered final
    pub confirmation_blocks: u64,
    pub poll_interval_ms: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    /// UTXO ledgers locked with Bitcoin-style scripts
    Script,
    /// Account ledgers locked with an HTLC contract call
    Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    pub slack_webhook_url: Option<String>,
    pub pagerduty_key: Option<String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("ASND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.adapter != "sim" && chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.confirmation_blocks == 0 {
                    anyhow::bail!("Chain {} must require at least one confirmation", name);
                }
            }
        }

        if self.swap.min_timeout_gap_secs == 0 {
            anyhow::bail!("swap.min_timeout_gap_secs must be non-zero");
        }
        if self.swap.max_retries == 0 {
            anyhow::bail!("swap.max_retries must be non-zero");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
