//! Configuration types for dgi-broker.
//! Parsed from a TOML file passed with `--config`.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use dgi_protocol::{PeerIdentity, DEFAULT_PORT};

use crate::broker::BrokerConfig;
use crate::connection_manager::DEFAULT_MAX_PEERS;
use crate::error::ConfigError;
use crate::reliability::{validate_reliability, LossPolicy};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Explicit identity. Derived from `hostname` and the listen port when absent.
    pub uuid: Option<String>,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub advertise_addr: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            uuid: None,
            hostname: default_hostname(),
            listen_addr: default_listen_addr(),
            advertise_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub simulate_loss: bool,
    #[serde(default = "default_reliability")]
    pub default_reliability: i64,
    pub seed: Option<u64>,
    /// Reliability profile reloaded while running.
    pub profile: Option<String>,
    #[serde(default = "default_profile_reload_secs")]
    pub profile_reload_secs: u64,
    /// Bound on known hosts, and so on live connections.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            simulate_loss: false,
            default_reliability: default_reliability(),
            seed: None,
            profile: None,
            profile_reload_secs: default_profile_reload_secs(),
            max_peers: default_max_peers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub uuid: Option<String>,
    pub addr: String,
    pub reliability: Option<i64>,
}

/// A peer entry after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub identity: PeerIdentity,
    pub addr: SocketAddr,
    pub reliability: Option<u8>,
}

// Default value functions
fn default_hostname() -> String {
    "localhost".into()
}
fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}
fn default_reliability() -> i64 {
    100
}
fn default_profile_reload_secs() -> u64 {
    10
}
fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Check every value that can be wrong without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.advertise_addr()?;
        self.identity()?;
        validate_reliability(self.network.default_reliability).map_err(invalid)?;
        if self.network.profile.is_some() && self.network.profile_reload_secs == 0 {
            return Err(ConfigError::Invalid(
                "profile_reload_secs must be at least 1".into(),
            ));
        }
        if self.network.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        if self.peers.len() > self.network.max_peers {
            return Err(ConfigError::Invalid(format!(
                "{} peers configured but max_peers is {}",
                self.peers.len(),
                self.network.max_peers
            )));
        }
        self.peers()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.node.listen_addr)
    }

    pub fn advertise_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.node.advertise_addr.as_deref().map(parse_addr).transpose()
    }

    /// This agent's identity: explicit `uuid`, or derived from hostname and listen port.
    pub fn identity(&self) -> Result<PeerIdentity, ConfigError> {
        match &self.node.uuid {
            Some(uuid) => Ok(PeerIdentity::new(uuid.as_str())?),
            None => {
                let port = self.listen_addr()?.port();
                Ok(PeerIdentity::from_endpoint(&self.node.hostname, port))
            }
        }
    }

    /// Validated peer table. Peer addresses may name hosts; they are resolved here.
    pub fn peers(&self) -> Result<Vec<ResolvedPeer>, ConfigError> {
        self.peers.iter().map(resolve_peer).collect()
    }

    pub fn loss_policy(&self) -> LossPolicy {
        LossPolicy::from_config(self.network.simulate_loss, self.network.seed)
    }

    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        Ok(BrokerConfig {
            identity: self.identity()?,
            listen_addr: self.listen_addr()?,
            advertise_addr: self.advertise_addr()?,
        })
    }
}

fn resolve_peer(entry: &PeerEntry) -> Result<ResolvedPeer, ConfigError> {
    let (host, port) = entry
        .addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("peer address {} has no port", entry.addr)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("bad port in peer address {}", entry.addr)))?;

    let identity = match &entry.uuid {
        Some(uuid) => PeerIdentity::new(uuid.as_str())?,
        None => PeerIdentity::from_endpoint(host.trim_matches(&['[', ']'][..]), port),
    };
    let reliability = entry
        .reliability
        .map(validate_reliability)
        .transpose()
        .map_err(invalid)?;

    Ok(ResolvedPeer {
        identity,
        addr: parse_addr(&entry.addr)?,
        reliability,
    })
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::Invalid(format!("cannot resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| ConfigError::Invalid(format!("no address for {addr}")))
}

fn invalid(e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(e.to_string())
}
