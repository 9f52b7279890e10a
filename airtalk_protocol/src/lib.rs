//! Wire protocol for AirTalk random voice-call matchmaking
//!
//! Every frame is a JSON object tagged by its `type` field and travels as a
//! WebSocket text message.
//!
//! ## Client → server
//! - `{"type":"find","id":"<user id>","country":"🇫🇷"}` - Enter the waiting pool
//! - `{"type":"signal","data":{...}}` - Opaque negotiation envelope for the partner
//! - `{"type":"reconnect"}` - Leave the current match and search again
//! - `{"type":"ping"}` - Application keepalive
//!
//! ## Server → client
//! - `{"type":"match","country":"🇫🇷","partnerId":"<id>","initiator":true}`
//! - `{"type":"signal","data":{...}}`
//! - `{"type":"searching"}`
//! - `{"type":"partnerDisconnected"}`
//! - `{"type":"timeout"}`
//! - `{"type":"serverShutdown"}`
//! - `{"type":"pong","timestamp":1700000000000}`

#![forbid(unsafe_code)]

mod error;

pub use error::ProtocolError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Flag shown when a client does not report its country.
pub const DEFAULT_COUNTRY: &str = "🏳️";

/// Opaque user identifier, client supplied or generated by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// A fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Requests sent from a call agent to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Find {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<String>,
    },
    Signal {
        #[serde(default)]
        data: Value,
    },
    Reconnect,
    Ping,
}

impl ClientMessage {
    const TYPES: [&'static str; 4] = ["find", "signal", "reconnect", "ping"];

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Find { .. } => "find",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::Reconnect => "reconnect",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Events sent from the signaling server to a call agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Match {
        country: String,
        partner_id: UserId,
        /// Whether the receiver must create the offer
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator: Option<bool>,
    },
    Signal {
        #[serde(default)]
        data: Value,
    },
    Searching,
    PartnerDisconnected,
    Timeout,
    ServerShutdown,
    Pong {
        timestamp: i64,
    },
}

impl ServerMessage {
    const TYPES: [&'static str; 7] = [
        "match",
        "signal",
        "searching",
        "partnerDisconnected",
        "timeout",
        "serverShutdown",
        "pong",
    ];
}

/// Decode a tagged frame, telling unknown types apart from garbage
fn decode<T: serde::de::DeserializeOwned>(
    text: &str,
    known: &[&'static str],
) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !known.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

impl FromStr for ClientMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s, &Self::TYPES)
    }
}

impl FromStr for ServerMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s, &Self::TYPES)
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
