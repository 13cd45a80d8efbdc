//! DGI Protocol -- peer identities, message envelope, datagram codec.
//!
//! Agents exchange one message per UDP datagram.
//! 4-byte big-endian length prefix + serde JSON.

pub mod codec;
pub mod identity;
pub mod messages;

pub use codec::MessageCodec;
pub use identity::PeerIdentity;
pub use messages::*;

/// Default listener port for a DGI agent.
pub const DEFAULT_PORT: u16 = 1870;

/// Largest encoded message that fits in one datagram (60 KiB).
pub const MAX_DATAGRAM_SIZE: usize = 60 * 1024;

/// Longest accepted identity string, in bytes.
pub const MAX_IDENTITY_LEN: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid peer identity {identity:?}: {reason}")]
    InvalidIdentity { identity: String, reason: &'static str },
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("truncated datagram: header claims {claimed} bytes, {available} available")]
    Truncated { claimed: usize, available: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
