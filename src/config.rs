//! Node Configuration
//!
//! A node is configured from one TOML file. Identity and network fields are required,
//! tuning knobs fall back to serde defaults. `validate` rejects anything boot could not
//! work with, and the accessors turn the raw numbers into the typed configs each
//! service takes.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::election::types::ElectionConfig;
use crate::membership::service::LinkConfig;
use crate::membership::types::{NodeDescriptor, NodeId};
use crate::registry::types::ExpiryConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: i32,
    pub node_ip: String,
    pub internal_port: u16,
    pub client_port: u16,
    #[serde(default)]
    pub client_http_port: Option<u16>,
    #[serde(default)]
    pub is_controller_candidate: bool,
    /// Total number of nodes the candidates wait for before electing.
    #[serde(default)]
    pub cluster_node_count: usize,
    /// `"ip:internalPort"` of every controller candidate, identical on every node.
    #[serde(default)]
    pub controller_candidate_servers: Vec<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_heartbeat_check_interval_secs")]
    pub heartbeat_check_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_period_secs")]
    pub heartbeat_timeout_period_secs: u64,
    #[serde(default = "default_election_round_timeout_ms")]
    pub election_round_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_heartbeat_check_interval_secs() -> u64 {
    3
}

const fn default_heartbeat_timeout_period_secs() -> u64 {
    5
}

const fn default_election_round_timeout_ms() -> u64 {
    10_000
}

const fn default_handshake_timeout_ms() -> u64 {
    5_000
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_retry_interval_secs() -> u64 {
    60
}

impl NodeConfig {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id < 0 {
            return Err(invalid(format!("node_id must not be negative, got {}", self.node_id)));
        }

        if self.node_ip.parse::<Ipv4Addr>().is_err() {
            return Err(invalid(format!("node_ip {:?} is not an IPv4 address", self.node_ip)));
        }

        if self.internal_port == 0 || self.client_port == 0 {
            return Err(invalid("internal_port and client_port must be set".to_string()));
        }
        if self.internal_port == self.client_port {
            return Err(invalid(format!(
                "internal_port and client_port must differ, both are {}",
                self.internal_port
            )));
        }
        if let Some(http_port) = self.client_http_port
            && (http_port == self.internal_port || http_port == self.client_port)
        {
            return Err(invalid(format!("client_http_port {} is already in use", http_port)));
        }

        if self.controller_candidate_servers.is_empty() {
            return Err(invalid("controller_candidate_servers must not be empty".to_string()));
        }
        for addr in &self.controller_candidate_servers {
            if addr.parse::<SocketAddrV4>().is_err() {
                return Err(invalid(format!(
                    "controller candidate {:?} is not an ip:port address",
                    addr
                )));
            }
        }

        if self.is_controller_candidate {
            let own = self.internal_addr();
            if !self.controller_candidate_servers.contains(&own) {
                return Err(invalid(format!(
                    "candidate address {} is missing from controller_candidate_servers",
                    own
                )));
            }
            if self.cluster_node_count < self.controller_candidate_servers.len() {
                return Err(invalid(format!(
                    "cluster_node_count {} is smaller than the {} controller candidates",
                    self.cluster_node_count,
                    self.controller_candidate_servers.len()
                )));
            }
        }

        if self.heartbeat_check_interval_secs == 0 || self.heartbeat_timeout_period_secs == 0 {
            return Err(invalid("heartbeat intervals must be positive".to_string()));
        }
        if self.election_round_timeout_ms == 0 {
            return Err(invalid("election_round_timeout_ms must be positive".to_string()));
        }

        Ok(())
    }

    /// `"ip:internalPort"`, the form used in the candidate roster.
    pub fn internal_addr(&self) -> String {
        format!("{}:{}", self.node_ip, self.internal_port)
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            node_id: NodeId(self.node_id),
            is_controller_candidate: self.is_controller_candidate,
            ip: self.node_ip.clone(),
            client_port: self.client_port,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            round_timeout: Duration::from_millis(self.election_round_timeout_ms),
            ..ElectionConfig::default()
        }
    }

    pub fn expiry_config(&self) -> ExpiryConfig {
        ExpiryConfig {
            check_interval: Duration::from_secs(self.heartbeat_check_interval_secs),
            timeout: Duration::from_secs(self.heartbeat_timeout_period_secs),
        }
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANDIDATE: &str = r#"
        node_id = 2
        node_ip = "127.0.0.1"
        internal_port = 5002
        client_port = 6002
        is_controller_candidate = true
        cluster_node_count = 3
        controller_candidate_servers = ["127.0.0.1:5001", "127.0.0.1:5002"]
        data_dir = "/tmp/registry-2"
    "#;

    #[test]
    fn test_parse_candidate_with_defaults() {
        let config = NodeConfig::from_toml_str(CANDIDATE).unwrap();

        assert_eq!(config.node_id, 2);
        assert_eq!(config.client_http_port, None);
        assert_eq!(config.heartbeat_check_interval_secs, 3);
        assert_eq!(config.heartbeat_timeout_period_secs, 5);
        assert_eq!(config.election_config().round_timeout, Duration::from_secs(10));
        assert_eq!(config.election_config().max_stalled_rounds, 5);
        assert_eq!(config.link_config().retry_interval, Duration::from_secs(60));
        assert_eq!(config.expiry_config().timeout, Duration::from_secs(5));
        assert_eq!(config.internal_addr(), "127.0.0.1:5002");
        assert_eq!(config.descriptor().server_address(), "2:127.0.0.1:6002");
    }

    #[test]
    fn test_candidate_must_be_in_roster() {
        let raw = CANDIDATE.replace("internal_port = 5002", "internal_port = 5003");
        let err = NodeConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_ordinary_node_skips_candidate_checks() {
        let raw = r#"
            node_id = 7
            node_ip = "127.0.0.1"
            internal_port = 5007
            client_port = 6007
            controller_candidate_servers = ["127.0.0.1:5001"]
        "#;
        let config = NodeConfig::from_toml_str(raw).unwrap();
        assert!(!config.is_controller_candidate);
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let err = NodeConfig::from_toml_str("node_ip = \"127.0.0.1\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_bad_ip_and_ports() {
        let bad_ip = CANDIDATE.replace("node_ip = \"127.0.0.1\"", "node_ip = \"localhost\"");
        assert!(NodeConfig::from_toml_str(&bad_ip).is_err());

        let same_ports = CANDIDATE.replace("client_port = 6002", "client_port = 5002");
        assert!(NodeConfig::from_toml_str(&same_ports).is_err());
    }

    #[test]
    fn test_cluster_count_covers_candidates() {
        let raw = CANDIDATE.replace("cluster_node_count = 3", "cluster_node_count = 1");
        assert!(NodeConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = NodeConfig::load("/nonexistent/registry.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
