//! Error types for the CDTunnel protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during handshake and transport operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("handshake body too large: {len} bytes (max {max})")]
    BodyTooLarge { len: usize, max: usize },

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("malformed handshake response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
