//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Decoding errors
    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Cryptographic errors
    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid or malformed private key.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Producing a signature failed.
    #[error("signing failed: {0}")]
    Signing(String),

    // Connection errors
    /// Transport could not be established or failed mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Remote errors
    /// The remote answered a request with an `error` reply.
    #[error("remote error: {reason}")]
    Remote {
        /// Reason string parsed from the reply.
        reason: String,
    },

    /// The remote answered with a reply this client does not understand.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ProtocolError {
    /// Builds a [`ProtocolError::Remote`] from a reason string.
    pub fn remote(reason: impl Into<String>) -> Self {
        ProtocolError::Remote {
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the transport session is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed(_) | ProtocolError::Transport(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<k256::ecdsa::Error> for ProtocolError {
    fn from(err: k256::ecdsa::Error) -> Self {
        ProtocolError::Signing(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}
