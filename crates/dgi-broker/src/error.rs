//! Error types for the broker core.
//!
//! Simulated loss is not an error and has no variant here; a lookup miss
//! is an `Option::None`, not an error either.

use dgi_protocol::{PeerIdentity, ProtocolError};
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("reliability must be within 0..=100, got {0}")]
    InvalidReliability(i64),
    #[error("failed to bind socket for peer {peer}: {source}")]
    Bind {
        peer: PeerIdentity,
        #[source]
        source: std::io::Error,
    },
    #[error("send to peer {peer} at {addr} failed: {source}")]
    Send {
        peer: PeerIdentity,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to peer {0} is closed")]
    Closed(PeerIdentity),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker already started; a stopped broker cannot be run again")]
    AlreadyStarted,
    #[error("broker is stopped")]
    Stopped,
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("no address known for peer {0}")]
    UnknownPeer(PeerIdentity),
    #[error("connection limit of {max} peers reached")]
    ConnectionLimit { max: usize },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Error returned by a message handler. Isolated to that one handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(e: ProtocolError) -> Self {
        Self::Other(Box::new(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid identity: {0}")]
    Identity(#[from] ProtocolError),
}
