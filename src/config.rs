//! Configuration loading.
//!
//! Shape follows `examples/original_source/xchain.go`'s `config.Config` /
//! `config.SourceChainConfig`, serialized the way `forest`'s `cli::config`
//! module loads its own `Config`: a plain `serde`-derived struct read from
//! TOML on disk, with an environment-variable override for secrets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};

/// Environment variable holding the keystore passphrase. Never placed in
/// the config file itself.
pub const PASSPHRASE_ENV_VAR: &str = "XCHAIN_PASSPHRASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceChainConfig {
    /// EVM JSON-RPC / WS endpoint for the source chain.
    pub api: String,
    /// Address of the OnRamp contract on the source chain.
    pub on_ramp_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Filecoin JSON-RPC endpoint (lotus daemon), with or without `/rpc/v0`.
    pub lotus_api: String,
    /// Client smart-contract address used to derive the f4 delegated address.
    pub prover_addr: String,
    /// Destination chain id, ABI-encoded as the deal `Label`.
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub payout_addr: String,
    pub provider_addr: String,
    pub transfer_ip: String,
    pub transfer_port: u16,
    /// Target padded aggregate size in bytes. Must be a power of two.
    pub target_agg_size: u64,
    pub buffer_path: PathBuf,
    pub buffer_port: u16,
    pub key_path: PathBuf,
    pub destination: DestinationConfig,
    pub sources: HashMap<String, SourceChainConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payout_addr: String::new(),
            provider_addr: String::new(),
            transfer_ip: "0.0.0.0".to_string(),
            transfer_port: 1728,
            target_agg_size: 1 << 20,
            buffer_path: PathBuf::from("./buffer"),
            buffer_port: 5077,
            key_path: PathBuf::from("./key.json"),
            destination: DestinationConfig {
                lotus_api: String::new(),
                prover_addr: String::new(),
                chain_id: 0,
            },
            sources: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn source(&self, chain_name: &str) -> Result<&SourceChainConfig> {
        self.sources.get(chain_name).ok_or_else(|| {
            AggregatorError::Config(format!("no source chain configured named '{chain_name}'"))
        })
    }

    /// Reads the keystore passphrase from the environment, per spec.md §6.
    pub fn passphrase() -> Result<String> {
        std::env::var(PASSPHRASE_ENV_VAR)
            .map_err(|_| AggregatorError::Config(format!("{PASSPHRASE_ENV_VAR} is not set")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.target_agg_size, 1 << 20);
        assert_eq!(cfg.transfer_port, 1728);
    }

    #[test]
    fn load_roundtrips_toml() {
        let toml_src = r#"
            payout_addr = "0x0000000000000000000000000000000000000001"
            provider_addr = "f01000"
            transfer_ip = "127.0.0.1"
            transfer_port = 1728
            target_agg_size = 1048576
            buffer_path = "/tmp/buf"
            buffer_port = 5077
            key_path = "/tmp/key.json"

            [destination]
            lotus_api = "http://127.0.0.1:1234"
            prover_addr = "0x0000000000000000000000000000000000000002"
            chain_id = 314159

            [sources.ethereum]
            api = "wss://example.invalid"
            on_ramp_address = "0x0000000000000000000000000000000000000003"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml_src).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.destination.chain_id, 314159);
        let src = cfg.source("ethereum").unwrap();
        assert_eq!(src.api, "wss://example.invalid");
        assert!(cfg.source("polygon").is_err());
    }
}
