//! Configuration management for tallychain

use crate::blockchain::{LedgerState, DEFAULT_DIFFICULTY, MAX_DIFFICULTY};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub consensus: ConsensusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub api_port: u16,
    /// Address peers should use to reach this node. Defaults to
    /// `127.0.0.1:<api_port>`.
    pub advertise_address: Option<String>,
    pub bootstrap_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            api_port: 5000,
            advertise_address: None,
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/tallychain.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub difficulty: u32,
    /// Balances the fold starts from, e.g. `{ Alice = 1000, Bob = 500 }`.
    pub genesis_balances: BTreeMap<String, i64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            genesis_balances: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// `"0s"` disables periodic resolution.
    #[serde(deserialize_with = "deserialize_duration")]
    pub resolve_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            resolve_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.api_port == 0 {
            return Err(ConfigError::Invalid("network.api_port must not be 0".to_string()));
        }
        if self.ledger.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Invalid(format!(
                "ledger.difficulty must be at most {}, got {}",
                MAX_DIFFICULTY, self.ledger.difficulty
            )));
        }
        if let Some((account, amount)) = self.ledger.genesis_balances.iter().find(|(_, v)| **v < 0) {
            return Err(ConfigError::Invalid(format!(
                "ledger.genesis_balances.{} is negative ({})",
                account, amount
            )));
        }
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::Invalid("database.path must be set".to_string()));
        }
        if self.consensus.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "consensus.request_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.network.bind_address, self.network.api_port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("network.bind_address: {}", e)))
    }

    pub fn advertised_address(&self) -> String {
        self.network
            .advertise_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.network.api_port))
    }

    pub fn seed_state(&self) -> LedgerState {
        LedgerState::from_seed(self.ledger.genesis_balances.clone())
    }

    /// `None` when periodic resolution is disabled.
    pub fn resolve_interval(&self) -> Option<Duration> {
        Some(self.consensus.resolve_interval).filter(|d| !d.is_zero())
    }
}

/// Load `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(text) => Config::from_toml(&text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Provide sane defaults when the config file is absent
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
