//! Configuration management for the Crossbook node
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::ledger::ChainId;

/// Environment variable holding the password for encrypted passphrases
pub const KEY_PASSWORD_ENV: &str = "CROSSBOOK_KEY_PASSWORD";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    pub snapshot: SnapshotConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Which of the two configured chains is the base chain
    pub base_chain: String,
    /// Observer-only mode: no outgoing transactions are authored
    #[serde(default)]
    pub passive_mode: bool,
    /// Pending multisig transfers older than this are dropped (ms)
    pub multisig_expiry: u64,
    /// How often the registry expiry scan runs (ms)
    pub multisig_expiry_check_interval: u64,
    /// Delay before this node's signature is broadcast to peers (ms)
    #[serde(default = "default_signature_broadcast_delay")]
    pub signature_broadcast_delay: u64,
    /// Delay between reaching exact quorum and posting the transaction (ms)
    #[serde(default = "default_transaction_submit_delay")]
    pub transaction_submit_delay: u64,
    /// Idle sleep between interleaver ticks that yield no blocks (ms)
    pub read_blocks_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Base-chain heights between order book snapshots
    pub order_book_snapshot_finality: u64,
    pub order_book_snapshot_file_path: PathBuf,
    pub order_book_snapshot_backup_dir_path: PathBuf,
    #[serde(default = "default_snapshot_backup_max_count")]
    pub order_book_snapshot_backup_max_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    pub max_filter_fields: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Multisig wallet address shared by the federation on this chain
    pub wallet_address: String,
    /// Ledger database endpoint consumed by the adapter
    pub database: String,
    /// Module alias used in the chain's block-change bus events
    pub module_alias: String,
    /// Heights an admitted order stays open before expiring
    pub order_height_expiry: u64,
    /// Confirmation lag subtracted from the tip to get the safe height
    pub required_confirmations: u64,
    /// Maximum blocks fetched per interleaver tick
    pub read_max_blocks: usize,
    /// Limit and market intents below this amount are refunded as undersized
    pub min_order_amount: u64,
    /// Flat fee subtracted from every payout on this chain
    pub exchange_fee_base: u64,
    /// Proportional fee applied to trade payouts on this chain
    pub exchange_fee_rate: Decimal,
    pub dividend_rate: Decimal,
    pub dividend_start_height: u64,
    pub dividend_height_interval: u64,
    pub dividend_height_offset: u64,
    /// Rebroadcast window bounds, in safe heights past creation (exclusive)
    pub rebroadcast_after_height: u64,
    pub rebroadcast_until_height: u64,
    /// Inbound transfers at or past this height are refused
    pub dex_disabled_from_height: Option<u64>,
    /// Replacement address announced with refusals once disabled
    pub dex_moved_to_address: Option<String>,
    pub passphrase: Option<String>,
    pub encrypted_passphrase: Option<String>,
    pub shared_passphrase: Option<String>,
    pub encrypted_shared_passphrase: Option<String>,
}

fn default_signature_broadcast_delay() -> u64 {
    15_000
}

fn default_transaction_submit_delay() -> u64 {
    5_000
}

fn default_snapshot_backup_max_count() -> usize {
    200
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CROSSBOOK_CONFIG")
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

    /// Validate configuration; violations here abort startup
    pub fn validate(&self) -> Result<()> {
        if self.chains.len() != 2 {
            anyhow::bail!(
                "Exactly two chains must be configured, found {}",
                self.chains.len()
            );
        }

        if !self.chains.contains_key(&self.node.base_chain) {
            anyhow::bail!("base_chain {} is not a configured chain", self.node.base_chain);
        }

        let mut needs_password = false;
        for (name, chain) in &self.chains {
            if chain.wallet_address.is_empty() {
                anyhow::bail!("Chain {} has no wallet address configured", name);
            }
            if chain.passphrase.is_some() && chain.encrypted_passphrase.is_some() {
                anyhow::bail!(
                    "Chain {} has both a clear and an encrypted passphrase",
                    name
                );
            }
            if chain.passphrase.is_none() && chain.encrypted_passphrase.is_none() {
                anyhow::bail!("Chain {} has no member passphrase configured", name);
            }
            if chain.shared_passphrase.is_some() && chain.encrypted_shared_passphrase.is_some() {
                anyhow::bail!(
                    "Chain {} has both a clear and an encrypted shared passphrase",
                    name
                );
            }
            if chain.shared_passphrase.is_none() && chain.encrypted_shared_passphrase.is_none() {
                anyhow::bail!("Chain {} has no shared passphrase configured", name);
            }
            needs_password |= chain.encrypted_passphrase.is_some()
                || chain.encrypted_shared_passphrase.is_some();

            if chain.exchange_fee_rate < Decimal::ZERO || chain.exchange_fee_rate >= Decimal::ONE {
                anyhow::bail!("Chain {} exchange_fee_rate must be within [0, 1)", name);
            }
            if chain.rebroadcast_until_height <= chain.rebroadcast_after_height {
                anyhow::bail!("Chain {} has an empty rebroadcast window", name);
            }
        }

        if needs_password && env::var(KEY_PASSWORD_ENV).is_err() {
            anyhow::bail!(
                "Encrypted passphrases configured but {} is not set",
                KEY_PASSWORD_ENV
            );
        }

        if self.api.default_page_limit > self.api.max_page_limit {
            anyhow::bail!("api default_page_limit exceeds max_page_limit");
        }

        Ok(())
    }

    /// Base chain id
    pub fn base_chain_id(&self) -> ChainId {
        ChainId::new(self.node.base_chain.clone())
    }

    /// Quote chain id (the configured chain that is not base)
    pub fn quote_chain_id(&self) -> ChainId {
        self.chains
            .keys()
            .find(|name| **name != self.node.base_chain)
            .map(|name| ChainId::new(name.clone()))
            .expect("validated configuration holds exactly two chains")
    }

    /// The chain paired against `chain`
    pub fn counter_chain_id(&self, chain: &ChainId) -> ChainId {
        if chain.as_str() == self.node.base_chain {
            self.quote_chain_id()
        } else {
            self.base_chain_id()
        }
    }

    pub fn chain(&self, chain: &ChainId) -> &ChainConfig {
        &self.chains[chain.as_str()]
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

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_toml(name: &str, extra: &str) -> String {
        format!(
            r#"
            [chains.{name}]
            wallet_address = "{name}-multisig"
            database = "/var/lib/{name}"
            module_alias = "{name}_dex"
            order_height_expiry = 100
            required_confirmations = 5
            read_max_blocks = 50
            min_order_amount = 10
            exchange_fee_base = 1
            exchange_fee_rate = "0.01"
            dividend_rate = "0.5"
            dividend_start_height = 100
            dividend_height_interval = 1000
            dividend_height_offset = 10
            rebroadcast_after_height = 10
            rebroadcast_until_height = 100
            {extra}
            "#
        )
    }

    fn base_toml() -> String {
        let mut s = String::from(
            r#"
            [node]
            base_chain = "alpha"
            multisig_expiry = 86400000
            multisig_expiry_check_interval = 60000
            read_blocks_interval = 3000

            [snapshot]
            order_book_snapshot_finality = 100
            order_book_snapshot_file_path = "/tmp/current.json"
            order_book_snapshot_backup_dir_path = "/tmp/backups"

            [api]
            host = "127.0.0.1"
            port = 8010
            default_page_limit = 20
            max_page_limit = 100
            max_filter_fields = 5

            [metrics]
            enabled = false
            port = 9010
            "#,
        );
        s.push_str(&chain_toml("alpha", "passphrase = \"a\"\nshared_passphrase = \"sa\""));
        s.push_str(&chain_toml("beta", "passphrase = \"b\"\nshared_passphrase = \"sb\""));
        s
    }

    #[test]
    fn test_valid_config_parses() {
        let settings: Settings = toml::from_str(&base_toml()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.node.signature_broadcast_delay, 15_000);
        assert_eq!(settings.node.transaction_submit_delay, 5_000);
        assert_eq!(settings.snapshot.order_book_snapshot_backup_max_count, 200);
        assert_eq!(settings.base_chain_id().as_str(), "alpha");
        assert_eq!(settings.quote_chain_id().as_str(), "beta");
        assert_eq!(
            settings.counter_chain_id(&ChainId::new("beta")).as_str(),
            "alpha"
        );
    }

    #[test]
    fn test_both_passphrase_variants_rejected() {
        let toml_str = base_toml().replace(
            "passphrase = \"a\"\nshared_passphrase = \"sa\"",
            "passphrase = \"a\"\nencrypted_passphrase = \"ff\"\nshared_passphrase = \"sa\"",
        );
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("both a clear and an encrypted passphrase"));
    }

    #[test]
    fn test_single_chain_rejected() {
        let mut toml_str = base_toml();
        let cut = toml_str.find("[chains.beta]").unwrap();
        toml_str.truncate(cut);
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CROSSBOOK_TEST_VAR", "test_value");
        let input = "database = \"postgres://${CROSSBOOK_TEST_VAR}/dex\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "database = \"postgres://test_value/dex\"");
    }
}
