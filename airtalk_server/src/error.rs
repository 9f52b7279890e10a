//! Error types for the signaling server

use airtalk_protocol::ProtocolError;
use thiserror::Error;

/// Errors that stop the server from starting or serving
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Listener or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from client requests
#[derive(Error, Debug)]
pub enum ClientRequestError {
    /// Connection was closed
    #[error("Connection closed")]
    Close,

    /// Frame could not be decoded; the session is torn down
    #[error("Malformed request: {0}")]
    Malformed(#[from] ProtocolError),

    /// Binary frames carry nothing in this protocol
    #[error("Unsupported message type")]
    UnsupportedType,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}
