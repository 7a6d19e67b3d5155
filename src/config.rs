//! Configuration management for the crossflow router
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub router: RouterConfig,
    pub metrics: MetricsConfig,
    pub relay: RelayConfig,
    pub messaging: MessagingConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub swap_pools: Vec<SwapPoolConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Polling period of the reconciliation loop, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Delay between per-transaction dispatches within one cycle, in
    /// milliseconds, to avoid bursting the chain gateways.
    #[serde(default = "default_dispatch_delay")]
    pub dispatch_delay_ms: u64,
    /// Router-network contract accepting third-party relayed calls. When
    /// set, prepare/fulfill/cancel go through the relayed path.
    pub router_contract_address: Option<Address>,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_dispatch_delay() -> u64 {
    750
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Base URL of the third-party relay service.
    pub endpoint: String,
    /// Chains the relay service accepts submissions for.
    #[serde(default)]
    pub supported_chains: Vec<u64>,
    /// Flat relayer fee offered for relayed calls, in fee-asset base units.
    #[serde(default)]
    pub relayer_fee: String,
    /// Asset the relayer fee is denominated in (zero address for native).
    #[serde(default)]
    pub relayer_fee_asset: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    /// HTTP gateway accepting signed meta-transaction requests for the
    /// peer relay network.
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub providers: Vec<String>,
    pub transaction_manager_address: Address,
    pub subgraph: Vec<String>,
    pub confirmations: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Display metadata for an asset across chains, used for metrics labels.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapPoolConfig {
    pub name: String,
    pub assets: Vec<SwapPoolAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapPoolAsset {
    pub chain_id: u64,
    pub asset_id: Address,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CROSSFLOW_CONFIG")
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
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.providers.is_empty() {
                    anyhow::bail!("Chain {} has no RPC providers configured", name);
                }
                if chain.subgraph.is_empty() {
                    anyhow::bail!("Chain {} has no subgraph endpoints configured", name);
                }
                if chain.transaction_manager_address == Address::zero() {
                    anyhow::bail!("Chain {} has no transaction manager address", name);
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.chain_id == chain_id && c.enabled)
    }

    /// Human name for an asset on a chain, falling back to the hex address.
    pub fn asset_name(&self, chain_id: u64, asset_id: Address) -> String {
        for pool in &self.swap_pools {
            if pool
                .assets
                .iter()
                .any(|a| a.chain_id == chain_id && a.asset_id == asset_id)
            {
                return pool.name.clone();
            }
        }
        format!("{:?}", asset_id)
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
