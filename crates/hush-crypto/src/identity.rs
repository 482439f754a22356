//! Ed25519 identity keys, principal ids and passphrase-wrapped key blobs.
//!
//! A **principal id** is the base64url-encoded Ed25519 public key (32 bytes →
//! 43 characters). It is what peers publish and what conversations are keyed
//! by.
//!
//! The private half of an identity is only stored as an [`EncryptedKeyBlob`]:
//! PBKDF2-HMAC-SHA256 stretches the passphrase into a wrapping key and
//! ChaCha20-Poly1305 seals the 32-byte Ed25519 seed.
//!
//! # Example
//!
//! ```
//! use hush_crypto::identity::{IdentityKeyManager, IdentityKeyPair};
//!
//! let keypair = IdentityKeyPair::generate().unwrap();
//! let manager = IdentityKeyManager::default();
//!
//! let blob = manager.wrap(&keypair, "correct horse").unwrap();
//! let restored = manager.unwrap(&blob, "correct horse").unwrap();
//! assert_eq!(restored.principal_id(), keypair.principal_id());
//!
//! assert!(manager.unwrap(&blob, "battery staple").is_err());
//! ```

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{KeyWrapConfig, MIN_PBKDF2_ITERATIONS};
use crate::encoding::b64;
use crate::fill_random;

/// Salt length for passphrase stretching (128 bits).
pub const KEY_WRAP_SALT_SIZE: usize = 16;

/// ChaCha20-Poly1305 IV length (96 bits).
pub const IV_SIZE: usize = 12;

/// Upper bound on the work factor accepted from a blob, so a crafted blob
/// cannot pin a CPU.
const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// Identity key errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("crypto operation failed: {0}")]
    CryptoOperation(&'static str),

    /// Any failure to open a key blob. Deliberately carries no detail.
    #[error("wrong passphrase or corrupt key blob")]
    WrongPassphraseOrCorrupt,

    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Principal id: base64url-encoded Ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Create a principal id from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a principal id from its string representation.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| IdentityError::InvalidPublicKey)?;

        if bytes.len() != 32 {
            return Err(IdentityError::InvalidPublicKey);
        }

        Ok(Self(s.to_string()))
    }

    /// Get the raw public key bytes.
    pub fn to_bytes(&self) -> Result<[u8; 32], IdentityError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|_| IdentityError::InvalidPublicKey)?;

        bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PrincipalId> for String {
    fn from(id: PrincipalId) -> Self {
        id.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrincipalId({})", self.0)
    }
}

/// Ed25519 identity keypair.
///
/// The signing key is zeroized on drop (ed25519-dalek's `SigningKey` is
/// `ZeroizeOnDrop`).
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        fill_random(&mut seed[..])
            .map_err(|_| IdentityError::CryptoOperation("random number generator failed"))?;

        Ok(Self::from_seed(&seed))
    }

    /// Rebuild a keypair from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Get the principal id (base64url-encoded public key).
    pub fn principal_id(&self) -> PrincipalId {
        PrincipalId::from_bytes(self.signing_key.verifying_key().as_bytes())
    }

    /// Get the public half.
    pub fn public_identity(&self) -> PublicIdentity {
        PublicIdentity {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.public_identity().verify(message, signature)
    }

    /// Seed bytes, wrapped so they are wiped when the caller is done.
    fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("principal_id", &self.principal_id())
            .finish_non_exhaustive()
    }
}

/// Public identity (verifying key only).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
}

impl PublicIdentity {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    /// Resolve a published principal id into a verifying key.
    pub fn from_principal_id(id: &PrincipalId) -> Result<Self, IdentityError> {
        Self::from_bytes(&id.to_bytes()?)
    }

    pub fn principal_id(&self) -> PrincipalId {
        PrincipalId::from_bytes(self.verifying_key.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// Verify a signature. Uses strict verification (rejects malleable
    /// signatures and small-order keys).
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.verifying_key.verify_strict(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.principal_id())
    }
}

/// Passphrase-wrapped identity seed, as stored by the key-blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyBlob {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// PBKDF2 work factor used when the blob was written.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_iterations() -> u32 {
    MIN_PBKDF2_ITERATIONS
}

/// Wraps and unwraps identity keys under a passphrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKeyManager {
    config: KeyWrapConfig,
}

impl IdentityKeyManager {
    /// Create a manager. Iteration counts below the protocol minimum are
    /// raised to it.
    pub fn new(config: KeyWrapConfig) -> Self {
        Self {
            config: KeyWrapConfig {
                iterations: config.iterations.max(MIN_PBKDF2_ITERATIONS),
            },
        }
    }

    pub fn iterations(&self) -> u32 {
        self.config.iterations
    }

    /// Generate a fresh identity keypair.
    pub fn generate(&self) -> Result<IdentityKeyPair, IdentityError> {
        IdentityKeyPair::generate()
    }

    /// Seal `keypair` under a key stretched from `passphrase`.
    pub fn wrap(
        &self,
        keypair: &IdentityKeyPair,
        passphrase: &str,
    ) -> Result<EncryptedKeyBlob, IdentityError> {
        let mut salt = [0u8; KEY_WRAP_SALT_SIZE];
        let mut iv = [0u8; IV_SIZE];
        fill_random(&mut salt)
            .and_then(|()| fill_random(&mut iv))
            .map_err(|_| IdentityError::CryptoOperation("random number generator failed"))?;

        let wrapping_key = stretch_passphrase(passphrase, &salt, self.config.iterations);
        let cipher = ChaCha20Poly1305::new((&*wrapping_key).into());
        let seed = keypair.seed();

        let ciphertext = cipher
            .encrypt(&Nonce::from(iv), seed.as_slice())
            .map_err(|_| IdentityError::CryptoOperation("key wrap encryption failed"))?;

        Ok(EncryptedKeyBlob {
            ciphertext,
            salt: salt.to_vec(),
            iv: iv.to_vec(),
            iterations: self.config.iterations,
        })
    }

    /// Open a blob written by [`IdentityKeyManager::wrap`].
    ///
    /// The passphrase is always stretched before the blob's shape is
    /// inspected, and every failure maps to
    /// [`IdentityError::WrongPassphraseOrCorrupt`].
    pub fn unwrap(
        &self,
        blob: &EncryptedKeyBlob,
        passphrase: &str,
    ) -> Result<IdentityKeyPair, IdentityError> {
        if !(MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&blob.iterations) {
            return Err(IdentityError::WrongPassphraseOrCorrupt);
        }

        let wrapping_key = stretch_passphrase(passphrase, &blob.salt, blob.iterations);
        let cipher = ChaCha20Poly1305::new((&*wrapping_key).into());

        let iv: [u8; IV_SIZE] = blob
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::WrongPassphraseOrCorrupt)?;

        let plaintext = cipher
            .decrypt(&Nonce::from(iv), blob.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| IdentityError::WrongPassphraseOrCorrupt)?;

        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            plaintext
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::WrongPassphraseOrCorrupt)?,
        );

        Ok(IdentityKeyPair::from_seed(&seed))
    }

    /// Re-seal a blob under a new passphrase with a fresh salt and IV.
    ///
    /// The caller is expected to overwrite the old blob with the result.
    pub fn rewrap(
        &self,
        blob: &EncryptedKeyBlob,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<EncryptedKeyBlob, IdentityError> {
        let keypair = self.unwrap(blob, old_passphrase)?;
        self.wrap(&keypair, new_passphrase)
    }
}

/// PBKDF2-HMAC-SHA256 → 32-byte wrapping key.
fn stretch_passphrase(passphrase: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    key
}
