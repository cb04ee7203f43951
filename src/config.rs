//! Node configuration with TOML file support.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{logging::LogFormat, Address};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete configuration needed to operate a node and its channel client.
///
/// Loaded from TOML via [NodeConfig::from_toml_file] or built in code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name used in state channels.
    pub alias: String,

    /// On-chain address and Perun identity. Defaults to the wallet address.
    #[serde(default)]
    pub address: Option<Address>,

    /// Adjudicator contract. The client deploys one when missing.
    #[serde(default)]
    pub adjudicator: Option<Address>,

    /// Asset holder contract. The client deploys one when missing.
    #[serde(default)]
    pub asset_holder: Option<Address>,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Ethereum node endpoint, e.g. `ws://127.0.0.1:8545`.
    pub eth_node_url: String,

    /// IP to listen on for peers.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Port to listen on for peers.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Challenge duration in seconds for channels we propose.
    #[serde(default = "default_challenge_duration")]
    pub challenge_duration: u64,

    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Peers the host application knows how to reach.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Filter directive, e.g. `"info"` or `"debug,perun_node=trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where the channel client finds its keys. Handed to the connector as is.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub keystore_path: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
    /// Hex-encoded key to import into the keystore.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |set: bool| if set { "<redacted>" } else { "<unset>" };
        f.debug_struct("WalletConfig")
            .field("keystore_path", &self.keystore_path)
            .field("password", &redact(self.password.is_some()))
            .field("private_key", &redact(self.private_key.is_some()))
            .finish()
    }
}

/// Bounds for client calls, in seconds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Client construction; may have to deploy contracts.
    pub setup: u64,
    /// Proposing a channel; has to send transactions.
    pub propose: u64,
    /// Answering an inbound proposal.
    pub proposal: u64,
    /// Answering or sending an update.
    pub update: u64,
    /// How long shutdown waits for tasks before aborting them.
    pub shutdown_grace: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            setup: 30,
            propose: 30,
            proposal: 5,
            update: 5,
            shutdown_grace: 5,
        }
    }
}

impl Timeouts {
    pub fn setup(&self) -> Duration {
        Duration::from_secs(self.setup)
    }
    pub fn propose(&self) -> Duration {
        Duration::from_secs(self.propose)
    }
    pub fn proposal(&self) -> Duration {
        Duration::from_secs(self.proposal)
    }
    pub fn update(&self) -> Duration {
        Duration::from_secs(self.update)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub address: Address,
    pub ip: String,
    pub port: u16,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./database")
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5750
}

fn default_challenge_duration() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Minimal configuration; everything else takes its default.
    pub fn new(alias: impl Into<String>, eth_node_url: impl Into<String>) -> Self {
        NodeConfig {
            alias: alias.into(),
            address: None,
            adjudicator: None,
            asset_holder: None,
            database_path: default_database_path(),
            eth_node_url: eth_node_url.into(),
            ip: default_ip(),
            port: default_port(),
            challenge_duration: default_challenge_duration(),
            wallet: WalletConfig::default(),
            timeouts: Timeouts::default(),
            peers: Vec::new(),
            log_format: LogFormat::default(),
            log_level: default_log_level(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.alias.trim().is_empty() {
            return invalid("alias must not be empty");
        }
        if self.eth_node_url.trim().is_empty() {
            return invalid("eth_node_url must not be empty");
        }
        if self.port == 0 {
            return invalid("port must not be 0");
        }
        if self.challenge_duration == 0 {
            return invalid("challenge_duration must not be 0");
        }
        let t = &self.timeouts;
        if [t.setup, t.propose, t.proposal, t.update].contains(&0) {
            return invalid("timeouts must not be 0");
        }
        Ok(())
    }

    /// Whether the client has to deploy contracts during setup.
    pub fn needs_deployment(&self) -> bool {
        self.adjudicator.is_none() || self.asset_holder.is_none()
    }
}
