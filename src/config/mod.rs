//! Node configuration, loaded from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BLOCK_PERIOD_SECS: u64 = 600;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
pub const MAIN_NETWORK_ID: u32 = 0xFA92_E5A2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Configuration {
    pub node: NodeConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Hex-encoded 32-byte Ed25519 seed.
    pub private_key: String,
    /// Hex-encoded 32-byte server chain id. Derived from the public key
    /// when absent.
    #[serde(default)]
    pub chain_id: Option<String>,
    /// Log filter used when `RUST_LOG` is not set, e.g. `"fedblock=debug"`.
    #[serde(default)]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_block_period")]
    pub block_period_secs: u64,
    /// The entry-credit ledger historically tolerated negative transient
    /// balances; `false` rejects overdraft commits instead.
    #[serde(default = "default_true")]
    pub allow_negative_ec_balance: bool,
    #[serde(default)]
    pub federated_servers: Vec<ServerEntry>,
    #[serde(default)]
    pub audit_servers: Vec<ServerEntry>,
    /// Hex-encoded key allowed to add and remove servers. Absent means any
    /// well-signed adjustment is accepted (bootstrap mode).
    #[serde(default)]
    pub authority_public_key: Option<String>,
    #[serde(default)]
    pub network_id: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerEntry {
    pub chain_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_block_period() -> u64 {
    DEFAULT_BLOCK_PERIOD_SECS
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_true() -> bool {
    true
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_period_secs: DEFAULT_BLOCK_PERIOD_SECS,
            allow_negative_ec_balance: true,
            federated_servers: Vec::new(),
            audit_servers: Vec::new(),
            authority_public_key: None,
            network_id: 0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Configuration {
    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: Configuration = toml::from_str(
            r#"
            [node]
            private_key = "0101010101010101010101010101010101010101010101010101010101010101"
            "#,
        )
        .unwrap();
        assert_eq!(config.consensus.block_period_secs, DEFAULT_BLOCK_PERIOD_SECS);
        assert!(config.consensus.allow_negative_ec_balance);
        assert_eq!(config.network.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.node.log_filter, None);
    }

    #[test]
    fn test_parse_log_filter() {
        let config: Configuration = toml::from_str(
            r#"
            [node]
            private_key = "02"
            log_filter = "fedblock=debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.log_filter.as_deref(), Some("fedblock=debug"));
    }

    #[test]
    fn test_parse_roster() {
        let config: Configuration = toml::from_str(
            r#"
            [node]
            private_key = "02"

            [consensus]
            block_period_secs = 60
            allow_negative_ec_balance = false

            [[consensus.federated_servers]]
            chain_id = "aa"
            public_key = "bb"
            "#,
        )
        .unwrap();
        assert_eq!(config.consensus.block_period_secs, 60);
        assert!(!config.consensus.allow_negative_ec_balance);
        assert_eq!(config.consensus.federated_servers.len(), 1);
    }
}
