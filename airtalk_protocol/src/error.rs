use thiserror::Error;

/// Errors decoding a protocol frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Not JSON, or the fields do not fit the declared type
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No string `type` tag
    #[error("Message has no type")]
    MissingType,

    /// Well-formed frame with a type this side does not understand
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}
