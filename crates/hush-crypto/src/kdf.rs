//! Session key derivation.
//!
//! `SessionKey = HKDF-SHA256(ikm = shared_secret, salt = N_A || N_B,
//! info = "hush-session-key-v1")`, 32 bytes for ChaCha20-Poly1305.
//!
//! Both parties must feed the nonces in the same order or they end up with
//! different keys. [`handshake_salt`] is the only place the salt is built and
//! it always puts the initiator's nonce first.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Nonce, NONCE_SIZE};

/// Size of a derived session key.
pub const SESSION_KEY_SIZE: usize = 32;

/// HKDF info label, domain-separating session keys from any other use of
/// the same shared secret.
const SESSION_KEY_INFO: &[u8] = b"hush-session-key-v1";

/// Symmetric key shared by both ends of a completed handshake.
///
/// Zeroized on drop. `Debug` never prints the key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Wrap raw key bytes (e.g. a key exchanged out of band).
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }

    /// Export as standard base64 for manual exchange.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Import a key exported with [`SessionKey::to_base64`].
    ///
    /// Returns `None` for anything that is not exactly 32 bytes of base64.
    pub fn from_base64(encoded: &str) -> Option<Self> {
        let mut decoded = STANDARD.decode(encoded.trim()).ok()?;
        let key = <[u8; SESSION_KEY_SIZE]>::try_from(decoded.as_slice())
            .ok()
            .map(Self::from_bytes);
        decoded.zeroize();
        key
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &SessionKey) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }

    /// Overwrite the key with zeroes before the value is dropped.
    pub fn clear(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Canonical salt: initiator nonce first, responder nonce second.
pub fn handshake_salt(initiator_nonce: &Nonce, responder_nonce: &Nonce) -> [u8; 2 * NONCE_SIZE] {
    let mut salt = [0u8; 2 * NONCE_SIZE];
    salt[..NONCE_SIZE].copy_from_slice(initiator_nonce);
    salt[NONCE_SIZE..].copy_from_slice(responder_nonce);
    salt
}

/// Derive a session key from an ECDH shared secret.
///
/// Pure: identical inputs always produce identical keys.
pub fn derive(shared_secret: &[u8], salt: &[u8]) -> SessionKey {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut bytes = [0u8; SESSION_KEY_SIZE];

    // 32 bytes is far below HKDF-SHA256's 255 * 32 byte limit.
    let Ok(()) = hk.expand(SESSION_KEY_INFO, &mut bytes) else {
        unreachable!("HKDF-SHA256 expand cannot fail for a 32-byte output");
    };

    let key = SessionKey::from_bytes(bytes);
    bytes.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let secret = [7u8; 32];
        let salt = handshake_salt(&[1u8; 16], &[2u8; 16]);

        let a = derive(&secret, &salt);
        let b = derive(&secret, &salt);
        assert!(a.ct_eq(&b));
    }

    #[test]
    fn test_salt_order_matters() {
        let secret = [7u8; 32];
        let n_a = [0xAAu8; 16];
        let n_b = [0xBBu8; 16];

        let forward = derive(&secret, &handshake_salt(&n_a, &n_b));
        let reversed = derive(&secret, &handshake_salt(&n_b, &n_a));
        assert!(!forward.ct_eq(&reversed));
    }

    #[test]
    fn test_salt_layout() {
        let salt = handshake_salt(&[1u8; 16], &[2u8; 16]);
        assert_eq!(&salt[..16], &[1u8; 16]);
        assert_eq!(&salt[16..], &[2u8; 16]);
    }

    #[test]
    fn test_different_secrets_differ() {
        let salt = handshake_salt(&[1u8; 16], &[2u8; 16]);
        let a = derive(&[1u8; 32], &salt);
        let b = derive(&[2u8; 32], &salt);
        assert!(!a.ct_eq(&b));
    }

    #[test]
    fn test_base64_export_import() {
        let key = derive(&[3u8; 32], &[4u8; 32]);
        let exported = key.to_base64();
        let imported = SessionKey::from_base64(&exported).unwrap();
        assert!(key.ct_eq(&imported));

        assert!(SessionKey::from_base64("not base64!").is_none());
        assert!(SessionKey::from_base64(&STANDARD.encode([0u8; 16])).is_none());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SessionKey::from_bytes([0x41; 32]);
        let printed = format!("{:?}", key);
        assert_eq!(printed, "SessionKey(<redacted>)");
    }

    #[test]
    fn test_clear_zeroes_key() {
        let mut key = SessionKey::from_bytes([9u8; 32]);
        key.clear();
        assert_eq!(key.as_bytes(), &[0u8; 32]);
    }
}
