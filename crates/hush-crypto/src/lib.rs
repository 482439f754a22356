//! Cryptographic core for Hush.
//!
//! This crate provides:
//! - Ed25519 identity keys, principal ids and passphrase-wrapped key blobs
//! - A three-message signed X25519 handshake for session establishment
//! - HKDF-SHA256 session key derivation
//! - ChaCha20-Poly1305 message and chunked file encryption
//! - Per-conversation replay protection (nonce, timestamp, sequence)
//!
//! # Design
//!
//! ```text
//! IdentityKeyManager ──► IdentityKeyPair
//!                              │ signs
//!                              ▼
//! HandshakeEngine:  initiate ──► respond ──► complete
//!                              │ ECDH + HKDF(N_A || N_B)
//!                              ▼
//!                          SessionKey
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!      cipher::seal_envelope          ReplayGuard::validate
//!              └───────────► SecureChannel ◄───┘
//! ```
//!
//! Nothing in this crate performs I/O. Transport and persistence are the
//! caller's concern; every wire type serializes to JSON with base64 fields.

#![forbid(unsafe_code)]

pub mod channel;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod replay;

mod encoding;

pub use channel::{ChannelError, SecureChannel};
pub use cipher::{CipherError, EncryptedChunk, EncryptedEnvelope, EncryptedFile, Sealed};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CipherConfig, HandshakeConfig, KeyWrapConfig, ReplayConfig, SecurityConfig};
pub use handshake::{
    EphemeralKeyPair, HandshakeEngine, HandshakeError, HandshakeMessage, HandshakeRegistry,
    HandshakeStatus,
};
pub use identity::{
    EncryptedKeyBlob, IdentityError, IdentityKeyManager, IdentityKeyPair, PrincipalId,
    PublicIdentity,
};
pub use kdf::SessionKey;
pub use replay::{ConversationId, ReplayGuard, ReplayRejection, ValidationMode};

/// Size of the random nonces carried by handshake messages and envelopes.
pub const NONCE_SIZE: usize = 16;

/// 128-bit random nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// Fill `buf` from the OS CSPRNG, surfacing failure instead of panicking.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), rand::Error> {
    use rand::RngCore;

    rand::rngs::OsRng.try_fill_bytes(buf)
}

/// Fresh 128-bit nonce from the OS CSPRNG.
pub fn random_nonce() -> Result<Nonce, rand::Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    fill_random(&mut nonce)?;
    Ok(nonce)
}
