//! Tunables for the handshake, replay guard, key wrapping and chunking.
//!
//! All durations are milliseconds. Every struct deserializes with missing
//! fields falling back to [`Default`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest PBKDF2 work factor accepted for wrapping identity keys.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Default plaintext size of one file chunk (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pbkdf2 iterations must be at least {MIN_PBKDF2_ITERATIONS}, got {0}")]
    WeakKeyWrap(u32),

    #[error("replay retention ({retention_ms} ms) must cover max age plus clock skew ({window_ms} ms)")]
    RetentionTooShort { retention_ms: u64, window_ms: u64 },

    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("handshake max age must be non-zero")]
    ZeroHandshakeWindow,
}

/// Handshake freshness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Maximum age of an inbound handshake message, and the lifetime of a
    /// pending outbound handshake.
    pub max_age_ms: u64,
    /// Tolerated amount by which a peer's clock may run ahead of ours.
    pub clock_skew_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 10 * 60 * 1000,
            clock_skew_ms: 30 * 1000,
        }
    }
}

/// Replay guard windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Envelopes older than this are rejected as expired.
    pub max_age_ms: u64,
    /// Tolerated amount by which a sender's clock may run ahead of ours.
    pub clock_skew_ms: u64,
    /// How long an accepted nonce is remembered.
    pub retention_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 5 * 60 * 1000,
            clock_skew_ms: 30 * 1000,
            retention_ms: 10 * 60 * 1000,
        }
    }
}

/// Passphrase wrapping work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyWrapConfig {
    pub iterations: u32,
}

impl Default for KeyWrapConfig {
    fn default() -> Self {
        Self {
            iterations: MIN_PBKDF2_ITERATIONS,
        }
    }
}

/// Chunked payload encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub chunk_size: usize,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Complete configuration for one Hush endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub handshake: HandshakeConfig,
    pub replay: ReplayConfig,
    pub key_wrap: KeyWrapConfig,
    pub cipher: CipherConfig,
}

impl SecurityConfig {
    /// Reject settings that would weaken the protocol's guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake.max_age_ms == 0 {
            return Err(ConfigError::ZeroHandshakeWindow);
        }

        if self.key_wrap.iterations < MIN_PBKDF2_ITERATIONS {
            return Err(ConfigError::WeakKeyWrap(self.key_wrap.iterations));
        }

        // A nonce forgotten while its timestamp is still fresh could be replayed.
        let window_ms = self
            .replay
            .max_age_ms
            .saturating_add(self.replay.clock_skew_ms);
        if self.replay.retention_ms < window_ms {
            return Err(ConfigError::RetentionTooShort {
                retention_ms: self.replay.retention_ms,
                window_ms,
            });
        }

        if self.cipher.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        Ok(())
    }
}
