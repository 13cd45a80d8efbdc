//! Message envelope exchanged between agents.
//!
//! The broker routes on `kind` and never looks inside `payload`;
//! parsing the payload is the application's business.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::{PeerIdentity, ProtocolError};

/// Message-type discriminator used as the dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(String);

impl MessageType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageType,
    pub source: PeerIdentity,
    /// Listener address of the sender, so a receiver can answer a first contact.
    #[serde(default)]
    pub reply_to: Option<SocketAddr>,
    pub sent_at: DateTime<Utc>,
    /// Opaque application payload.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: impl Into<MessageType>, source: PeerIdentity, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            source,
            reply_to: None,
            sent_at: Utc::now(),
            payload,
        }
    }

    /// Build a message whose payload is the JSON encoding of `body`.
    pub fn with_json<T: Serialize>(
        kind: impl Into<MessageType>,
        source: PeerIdentity,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, source, serde_json::to_vec(body)?))
    }

    /// Parse the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize/deserialize Vec<u8> as base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> PeerIdentity {
        PeerIdentity::new("A1").unwrap()
    }

    #[test]
    fn test_payload_base64() {
        let msg = Message::new("sc.marker", source(), vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("AQIDBA==")); // base64 of [1,2,3,4]

        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert_eq!(decoded.kind.as_str(), "sc.marker");
    }

    #[test]
    fn test_json_payload_helpers() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Step {
            step: f64,
        }

        let msg = Message::with_json("desd.step", source(), &Step { step: 2.5 }).unwrap();
        let body: Step = msg.decode_json().unwrap();
        assert_eq!(body, Step { step: 2.5 });
    }

    #[test]
    fn test_reply_to_optional_on_wire() {
        let json =
            r#"{"kind":"lb.demand","source":"A1","sent_at":"2026-01-29T00:00:00Z","payload":""}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.reply_to.is_none());
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_invalid_source_rejected() {
        let json =
            r#"{"kind":"x","source":"bad id","sent_at":"2026-01-29T00:00:00Z","payload":""}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }
}
