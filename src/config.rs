//! Gossip node configuration
//!
//! Loaded from a JSON file and overridden by command-line flags. An
//! invalid configuration is the only error the node treats as fatal.

use crate::network::blacklist::MAX_BAN_SECS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// =============================================================================
// Defaults
// =============================================================================

/// Default listening port
pub const DEFAULT_PORT: u16 = 13802;

/// Default network channel
pub const DEFAULT_CHANNEL: u32 = 1;

/// Default target number of outbound peers
pub const DEFAULT_TARGET_OUTBOUND: usize = 8;

/// Default maximum number of inbound peers
pub const DEFAULT_MAX_INBOUND: usize = 50;

/// Default number of inbound connections allowed from one IP
pub const DEFAULT_MAX_INBOUND_PER_IP: usize = 4;

/// Default maximum gossip TTL
pub const DEFAULT_MAX_TTL: u32 = 8;

/// Blocks at least this big (bytes) are light broadcast
pub const DEFAULT_MIN_LIGHT_BLOCK_SIZE: usize = 100 * 1024;

/// Default ban duration (24 hours)
pub const DEFAULT_BAN_DURATION_SECS: u64 = 24 * 60 * 60;

/// Default quarantine for an address claiming a live identity
pub const DEFAULT_QUARANTINE_SECS: u64 = 5 * 60;

/// Default size of the seen-transaction filter
pub const DEFAULT_TX_FILTER_SIZE: usize = 100_000;

/// Default size of the seen-block filter
pub const DEFAULT_BLOCK_FILTER_SIZE: usize = 1_000;

/// Default lifetime of a partially reconstructed light block
pub const DEFAULT_BLOCK_CACHE_TIMEOUT_SECS: u64 = 10;

/// Default number of parallel block fetches
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 8;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Certificate material for mutual TLS
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented to peers
    pub cert_path: Option<PathBuf>,
    /// PEM private key for the certificate
    pub key_path: Option<PathBuf>,
    /// PEM CA bundle peers' certificates must chain to
    pub ca_path: Option<PathBuf>,
    /// Name checked against the peer's server certificate
    pub server_name: String,
}

/// Gossip node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Port to listen on
    pub listen_port: u16,
    /// Interface to bind
    pub listen_host: String,
    /// Network channel; peers on another channel are refused
    pub channel: u32,
    /// Outbound fan-out the node tries to keep
    pub target_outbound: usize,
    /// Inbound connection limit
    pub max_inbound: usize,
    /// Inbound connection limit per remote IP
    pub max_inbound_per_ip: usize,
    /// Largest TTL accepted on gossip messages
    pub max_ttl: u32,
    /// Whether light (hash-only) relay is used towards capable peers
    pub light_broadcast: bool,
    /// Minimum block size for light relay
    pub min_light_block_size: usize,
    /// Persistent peers
    pub seeds: Vec<String>,
    /// Require mutual TLS on every connection
    pub enable_tls: bool,
    /// Certificate paths
    pub tls: TlsConfig,
    /// Default ban duration
    pub ban_duration_secs: u64,
    /// Quarantine for an address claiming a live identity
    pub quarantine_secs: u64,
    /// Offer gzip-compressed frames
    pub enable_compression: bool,
    /// Accept inbound connections
    pub server_start: bool,
    /// Directory for the local store
    pub data_dir: PathBuf,
    /// Capacity of the seen-transaction filter
    pub tx_filter_size: usize,
    /// Capacity of the seen-block filter
    pub block_filter_size: usize,
    /// Lifetime of a light block waiting for its missing transactions
    pub block_cache_timeout_secs: u64,
    /// Parallel block fetches during download
    pub download_concurrency: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            listen_host: "0.0.0.0".to_string(),
            channel: DEFAULT_CHANNEL,
            target_outbound: DEFAULT_TARGET_OUTBOUND,
            max_inbound: DEFAULT_MAX_INBOUND,
            max_inbound_per_ip: DEFAULT_MAX_INBOUND_PER_IP,
            max_ttl: DEFAULT_MAX_TTL,
            light_broadcast: true,
            min_light_block_size: DEFAULT_MIN_LIGHT_BLOCK_SIZE,
            seeds: Vec::new(),
            enable_tls: false,
            tls: TlsConfig::default(),
            ban_duration_secs: DEFAULT_BAN_DURATION_SECS,
            quarantine_secs: DEFAULT_QUARANTINE_SECS,
            enable_compression: true,
            server_start: true,
            data_dir: PathBuf::from(".gossip_data"),
            tx_filter_size: DEFAULT_TX_FILTER_SIZE,
            block_filter_size: DEFAULT_BLOCK_FILTER_SIZE,
            block_cache_timeout_secs: DEFAULT_BLOCK_CACHE_TIMEOUT_SECS,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
        }
    }
}

impl GossipConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_outbound == 0 {
            return Err(ConfigError::Invalid(
                "target_outbound must be at least 1".into(),
            ));
        }
        if self.max_ttl == 0 {
            return Err(ConfigError::Invalid("max_ttl must be at least 1".into()));
        }
        if self.channel > u16::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "channel {} does not fit in 16 bits",
                self.channel
            )));
        }
        if self.listen_host.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "listen_host {} is not an IP address",
                self.listen_host
            )));
        }
        if self.tx_filter_size == 0 || self.block_filter_size == 0 {
            return Err(ConfigError::Invalid("filter sizes must be non-zero".into()));
        }
        if self.download_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "download_concurrency must be at least 1".into(),
            ));
        }
        if self.block_cache_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "block_cache_timeout_secs must be at least 1".into(),
            ));
        }
        if self.ban_duration_secs > MAX_BAN_SECS || self.quarantine_secs > MAX_BAN_SECS {
            return Err(ConfigError::Invalid(format!(
                "ban_duration_secs and quarantine_secs must not exceed {}",
                MAX_BAN_SECS
            )));
        }
        if self.enable_tls {
            let tls = &self.tls;
            if tls.cert_path.is_none() || tls.key_path.is_none() || tls.ca_path.is_none() {
                return Err(ConfigError::Invalid(
                    "enable_tls requires tls.cert_path, tls.key_path and tls.ca_path".into(),
                ));
            }
            if tls.server_name.is_empty() {
                return Err(ConfigError::Invalid(
                    "enable_tls requires tls.server_name".into(),
                ));
            }
        }
        Ok(())
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        assert!(GossipConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gossip.json");
        fs::write(&path, r#"{ "listen_port": 9000, "seeds": ["10.0.0.1:13802"] }"#).unwrap();

        let config = GossipConfig::load(&path).unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.max_ttl, DEFAULT_MAX_TTL);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gossip.json");
        let config = GossipConfig {
            max_ttl: 3,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(GossipConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_fanout = GossipConfig {
            target_outbound: 0,
            ..Default::default()
        };
        assert!(zero_fanout.validate().is_err());

        let zero_ttl = GossipConfig {
            max_ttl: 0,
            ..Default::default()
        };
        assert!(zero_ttl.validate().is_err());

        let bad_host = GossipConfig {
            listen_host: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(bad_host.validate().is_err());
    }

    #[test]
    fn test_ban_durations_bounded() {
        let endless_ban = GossipConfig {
            ban_duration_secs: u64::MAX,
            ..Default::default()
        };
        assert!(endless_ban.validate().is_err());

        let endless_quarantine = GossipConfig {
            quarantine_secs: u64::MAX,
            ..Default::default()
        };
        assert!(endless_quarantine.validate().is_err());

        let longest = GossipConfig {
            ban_duration_secs: MAX_BAN_SECS,
            ..Default::default()
        };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_tls_requires_paths() {
        let mut config = GossipConfig {
            enable_tls: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.tls = TlsConfig {
            cert_path: Some("node.pem".into()),
            key_path: Some("node.key".into()),
            ca_path: Some("ca.pem".into()),
            server_name: "node.gossip".into(),
        };
        assert!(config.validate().is_ok());
    }
}
