//! Error types for the call agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Signaling connection could not be opened or broke
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer layer rejected a negotiation payload
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Microphone could not be acquired
    #[error("Media error: {0}")]
    Media(String),

    /// The agent task has exited
    #[error("Agent stopped")]
    Stopped,
}
