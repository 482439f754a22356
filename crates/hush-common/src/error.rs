//! Common error types for Hush.

use hush_crypto::config::ConfigError;
use hush_crypto::{ChannelError, CipherError, HandshakeError, IdentityError, ReplayRejection};
use thiserror::Error;

/// Result type alias using Hush's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Hush operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayRejection),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::config(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_convert() {
        let err: Error = CipherError::DecryptionFailed.into();
        assert_eq!(err.to_string(), "cipher error: decryption failed");

        let err: Error = ReplayRejection::DuplicateNonce.into();
        assert!(matches!(err, Error::Replay(ReplayRejection::DuplicateNonce)));

        let err: Error = ConfigError::ZeroChunkSize.into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_json_error_converts() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
