//! Peer identity -- the stable string naming one agent.
//!
//! Identities are opaque: two are equal iff their strings are equal.
//! Agents without a configured identity derive one from `host:port`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{ProtocolError, MAX_IDENTITY_LEN};

/// Unique, immutable name of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Validate and wrap an identity string.
    pub fn new(value: impl Into<String>) -> Result<Self, ProtocolError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ProtocolError::InvalidIdentity {
                identity: value,
                reason: "empty",
            });
        }
        if value.len() > MAX_IDENTITY_LEN {
            return Err(ProtocolError::InvalidIdentity {
                identity: value,
                reason: "longer than 256 bytes",
            });
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtocolError::InvalidIdentity {
                identity: value,
                reason: "contains whitespace or control characters",
            });
        }
        Ok(Self(value))
    }

    /// Derive a name-based identity from an agent's `host:port`.
    ///
    /// SHA-256 of the endpoint string, first 16 bytes rendered as a
    /// canonical 8-4-4-4-12 UUID.
    pub fn from_endpoint(host: &str, port: u16) -> Self {
        let digest = Sha256::digest(format!("{host}:{port}").as_bytes());
        let hex = hex::encode(&digest[..16]);
        Self(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerIdentity {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerIdentity> for String {
    fn from(id: PeerIdentity) -> Self {
        id.0
    }
}

impl std::str::FromStr for PeerIdentity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
