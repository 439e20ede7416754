//! Daemon configuration file.
//!
//! The file is TOML with one table per concern. Every key has a default, so
//! a partial file (or an empty one) is valid.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::Network;
use covenant_btcclient::BtcClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backend::SignerType;
use crate::server::ServerConfig;

const CONFIG_HEADER: &str = "\
# Covenant signer configuration.
#
# [btc-config] points at a synced bitcoind with txindex=1, used for chain
# lookups. [btc-signer-config] points at the wallet-only bitcoind holding the
# covenant key; it should not be reachable from the public network.

";

/// Errors from loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("btc-config network {node} differs from btc-signer-config network {signer}")]
    NetworkMismatch { node: String, signer: String },

    #[error("invalid {section} host: {host}")]
    InvalidHost { section: &'static str, host: String },

    #[error("metrics server port must be between 1024 and 65535 (inclusive), got {0}")]
    InvalidMetricsPort(u32),

    #[error("max-content-length must be greater than 0")]
    ZeroContentLength,

    #[error("request-timeout must be greater than 0")]
    ZeroRequestTimeout,
}

/// Connection to the chain-lookup node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BtcConfig {
    pub host: String,
    pub user: String,
    pub pass: String,
    /// mainnet | testnet3 | regtest | signet
    pub network: String,
}

impl Default for BtcConfig {
    fn default() -> Self {
        Self {
            host: "localhost:18556".to_string(),
            user: "user".to_string(),
            pass: "pass".to_string(),
            network: "regtest".to_string(),
        }
    }
}

/// Connection to the wallet node holding the covenant key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BtcSignerConfig {
    pub host: String,
    pub user: String,
    pub pass: String,
    pub network: String,
    pub signer_type: SignerType,
}

impl Default for BtcSignerConfig {
    fn default() -> Self {
        let node = BtcConfig::default();
        Self {
            host: node.host,
            user: node.user,
            pass: node.pass,
            network: node.network,
            signer_type: SignerType::Psbt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds
    pub request_timeout: u64,
    /// Bytes
    pub max_content_length: u32,
    /// Empty disables request authentication
    pub hmac_key: String,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9791,
            request_timeout: 15,
            max_content_length: 8192,
            hmac_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2112,
        }
    }
}

/// Configuration as written in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub btc_config: BtcConfig,
    pub btc_signer_config: BtcSignerConfig,
    pub server_config: ApiServerConfig,
    pub metrics: MetricsConfig,
}

/// Validated configuration, ready to wire up the daemon.
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub btc_node: BtcClientConfig,
    pub btc_signer: BtcClientConfig,
    pub signer_type: SignerType,
    /// Network of both nodes
    pub network: Network,
    pub server: ServerConfig,
    pub metrics_addr: SocketAddr,
}

pub fn parse_network(name: &str) -> Result<Network, ConfigError> {
    match name {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet3" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        "signet" => Ok(Network::Signet),
        other => Err(ConfigError::UnknownNetwork(other.to_string())),
    }
}

fn parse_ip(section: &'static str, host: &str) -> Result<IpAddr, ConfigError> {
    host.parse().map_err(|_| ConfigError::InvalidHost {
        section,
        host: host.to_string(),
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(format!("{}{}", CONFIG_HEADER, toml::to_string_pretty(self)?))
    }

    pub fn parse(&self) -> Result<ParsedConfig, ConfigError> {
        let node_network = parse_network(&self.btc_config.network)?;
        let signer_network = parse_network(&self.btc_signer_config.network)?;
        if node_network != signer_network {
            return Err(ConfigError::NetworkMismatch {
                node: self.btc_config.network.clone(),
                signer: self.btc_signer_config.network.clone(),
            });
        }

        let server = &self.server_config;
        if server.max_content_length == 0 {
            return Err(ConfigError::ZeroContentLength);
        }
        if server.request_timeout == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        let server_ip = parse_ip("server-config", &server.host)?;

        let metrics = &self.metrics;
        let metrics_port = u16::try_from(metrics.port)
            .ok()
            .filter(|port| *port >= 1024)
            .ok_or(ConfigError::InvalidMetricsPort(metrics.port))?;
        let metrics_ip = parse_ip("metrics", &metrics.host)?;

        Ok(ParsedConfig {
            btc_node: BtcClientConfig {
                host: self.btc_config.host.clone(),
                user: self.btc_config.user.clone(),
                pass: self.btc_config.pass.clone(),
            },
            btc_signer: BtcClientConfig {
                host: self.btc_signer_config.host.clone(),
                user: self.btc_signer_config.user.clone(),
                pass: self.btc_signer_config.pass.clone(),
            },
            signer_type: self.btc_signer_config.signer_type,
            network: node_network,
            server: ServerConfig {
                addr: SocketAddr::new(server_ip, server.port),
                request_timeout: Duration::from_secs(server.request_timeout),
                max_content_length: server.max_content_length as usize,
                hmac_key: Some(server.hmac_key.clone()).filter(|key| !key.is_empty()),
            },
            metrics_addr: SocketAddr::new(metrics_ip, metrics_port),
        })
    }
}

/// Writes the default configuration to `path` unless a file is already
/// there. Returns whether a file was written.
pub fn write_default_if_absent(path: &Path) -> Result<bool, ConfigError> {
    let io_err = |source: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    std::fs::write(path, Config::default().to_toml()?).map_err(io_err)?;

    // The file will hold RPC credentials and the HMAC key
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(io_err)?;
    }

    info!("Wrote default config to {:?}", path);
    Ok(true)
}
