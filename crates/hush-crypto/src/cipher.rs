//! ChaCha20-Poly1305 message and file encryption.
//!
//! Every encryption draws a fresh random 96-bit IV, so a (key, IV) pair is
//! never reused. The Poly1305 tag is appended to the ciphertext.
//!
//! Envelopes bind their replay metadata (`nonce || sequenceNumber ||
//! timestampMs`) as associated data, so a captured ciphertext cannot be
//! re-sent under a fresh nonce or a newer sequence number. File chunks bind
//! `fileId || chunkIndex || totalChunks` the same way. The random `fileId`
//! ties every chunk to the file it was sealed for, so chunks cannot be
//! reordered, dropped or spliced in from another file under the same key.
//!
//! All decryption failures collapse into [`CipherError::DecryptionFailed`].

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce as AeadNonce,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::encoding::{b64, b64_array};
use crate::kdf::SessionKey;
use crate::{fill_random, random_nonce, Nonce, NONCE_SIZE};

/// ChaCha20-Poly1305 IV length (96 bits).
pub const IV_SIZE: usize = 12;

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Cipher errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// Authentication failed or the input was malformed. Deliberately opaque.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid chunk size")]
    InvalidChunkSize,
}

/// Ciphertext plus the IV it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

/// One encrypted message with its replay-protection metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64_array")]
    pub nonce: Nonce,
    pub sequence_number: u64,
    pub timestamp_ms: u64,
}

impl EncryptedEnvelope {
    fn associated_data(&self) -> [u8; NONCE_SIZE + 16] {
        envelope_aad(&self.nonce, self.sequence_number, self.timestamp_ms)
    }
}

/// One chunk of an [`EncryptedFile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedChunk {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    pub chunk_index: u32,
}

/// A payload split into independently sealed chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedFile {
    /// Random per-file id bound into every chunk.
    #[serde(with = "b64_array")]
    pub file_id: Nonce,
    pub chunks: Vec<EncryptedChunk>,
    pub total_chunks: u32,
    /// Plaintext length in bytes.
    pub total_size: u64,
}

fn aead(key: &SessionKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(key.as_bytes().into())
}

fn fresh_iv() -> Result<[u8; IV_SIZE], CipherError> {
    let mut iv = [0u8; IV_SIZE];
    fill_random(&mut iv).map_err(|_| CipherError::EncryptionFailed)?;
    Ok(iv)
}

fn seal_with(key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let iv = fresh_iv()?;
    let ciphertext = aead(key)
        .encrypt(
            AeadNonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CipherError::EncryptionFailed)?;

    Ok(Sealed {
        ciphertext,
        iv: iv.to_vec(),
    })
}

fn open_with(
    key: &SessionKey,
    ciphertext: &[u8],
    iv: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if iv.len() != IV_SIZE || ciphertext.len() < TAG_SIZE {
        return Err(CipherError::DecryptionFailed);
    }

    aead(key)
        .decrypt(
            AeadNonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CipherError::DecryptionFailed)
}

/// Encrypt `plaintext` under a fresh random IV.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Sealed, CipherError> {
    seal_with(key, plaintext, &[])
}

/// Decrypt and authenticate.
pub fn decrypt(key: &SessionKey, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CipherError> {
    open_with(key, ciphertext, iv, &[])
}

fn envelope_aad(nonce: &Nonce, sequence_number: u64, timestamp_ms: u64) -> [u8; NONCE_SIZE + 16] {
    let mut aad = [0u8; NONCE_SIZE + 16];
    aad[..NONCE_SIZE].copy_from_slice(nonce);
    aad[NONCE_SIZE..NONCE_SIZE + 8].copy_from_slice(&sequence_number.to_be_bytes());
    aad[NONCE_SIZE + 8..].copy_from_slice(&timestamp_ms.to_be_bytes());
    aad
}

/// Seal a message into an envelope with a fresh replay nonce.
pub fn seal_envelope(
    key: &SessionKey,
    plaintext: &[u8],
    sequence_number: u64,
    timestamp_ms: u64,
) -> Result<EncryptedEnvelope, CipherError> {
    let nonce = random_nonce().map_err(|_| CipherError::EncryptionFailed)?;
    let sealed = seal_with(
        key,
        plaintext,
        &envelope_aad(&nonce, sequence_number, timestamp_ms),
    )?;

    Ok(EncryptedEnvelope {
        ciphertext: sealed.ciphertext,
        iv: sealed.iv,
        nonce,
        sequence_number,
        timestamp_ms,
    })
}

/// Authenticate and decrypt an envelope. Does not consult any replay state.
pub fn open_envelope(key: &SessionKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CipherError> {
    open_with(
        key,
        &envelope.ciphertext,
        &envelope.iv,
        &envelope.associated_data(),
    )
}

fn chunk_aad(file_id: &Nonce, chunk_index: u32, total_chunks: u32) -> [u8; NONCE_SIZE + 8] {
    let mut aad = [0u8; NONCE_SIZE + 8];
    aad[..NONCE_SIZE].copy_from_slice(file_id);
    aad[NONCE_SIZE..NONCE_SIZE + 4].copy_from_slice(&chunk_index.to_be_bytes());
    aad[NONCE_SIZE + 4..].copy_from_slice(&total_chunks.to_be_bytes());
    aad
}

/// Split `data` into `chunk_size` pieces and seal each one.
///
/// Empty input produces a single empty chunk so the file still carries an
/// authenticator.
pub fn encrypt_chunked(
    key: &SessionKey,
    data: &[u8],
    chunk_size: usize,
) -> Result<EncryptedFile, CipherError> {
    if chunk_size == 0 {
        return Err(CipherError::InvalidChunkSize);
    }

    let pieces: Vec<&[u8]> = if data.is_empty() {
        vec![&[][..]]
    } else {
        data.chunks(chunk_size).collect()
    };
    let total_chunks = u32::try_from(pieces.len()).map_err(|_| CipherError::InvalidChunkSize)?;
    let file_id = random_nonce().map_err(|_| CipherError::EncryptionFailed)?;

    let chunks = pieces
        .into_iter()
        .zip(0u32..)
        .map(|(piece, chunk_index)| {
            let sealed = seal_with(key, piece, &chunk_aad(&file_id, chunk_index, total_chunks))?;
            Ok(EncryptedChunk {
                ciphertext: sealed.ciphertext,
                iv: sealed.iv,
                chunk_index,
            })
        })
        .collect::<Result<Vec<_>, CipherError>>()?;

    Ok(EncryptedFile {
        file_id,
        chunks,
        total_chunks,
        total_size: data.len() as u64,
    })
}

/// Reassemble and decrypt a chunked file.
///
/// Chunks may arrive in any order. All-or-nothing: no plaintext is returned
/// unless every chunk authenticates and the sizes add up.
pub fn decrypt_chunked(key: &SessionKey, file: &EncryptedFile) -> Result<Vec<u8>, CipherError> {
    let total = file.total_chunks as usize;
    if total == 0 || file.chunks.len() != total {
        return Err(CipherError::DecryptionFailed);
    }

    let mut ordered: Vec<Option<&EncryptedChunk>> = vec![None; total];
    for chunk in &file.chunks {
        let slot = ordered
            .get_mut(chunk.chunk_index as usize)
            .ok_or(CipherError::DecryptionFailed)?;
        if slot.replace(chunk).is_some() {
            return Err(CipherError::DecryptionFailed);
        }
    }

    let mut plaintext = Vec::new();
    for chunk in ordered.into_iter().flatten() {
        let aad = chunk_aad(&file.file_id, chunk.chunk_index, file.total_chunks);
        match open_with(key, &chunk.ciphertext, &chunk.iv, &aad) {
            Ok(mut piece) => {
                plaintext.extend_from_slice(&piece);
                piece.zeroize();
            }
            Err(err) => {
                plaintext.zeroize();
                return Err(err);
            }
        }
    }

    if plaintext.len() as u64 != file.total_size {
        plaintext.zeroize();
        return Err(CipherError::DecryptionFailed);
    }

    Ok(plaintext)
}
