//! Encrypted conversation with replay protection.
//!
//! A [`SecureChannel`] is what a completed handshake turns into: the session
//! key, the two conversation directions, an outbound sequence counter and a
//! shared [`ReplayGuard`].
//!
//! Inbound envelopes are checked against the guard before decryption (fail
//! fast) but only recorded after they authenticate, so a forged envelope can
//! never burn a nonce or advance the sequence floor.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::cipher::{self, CipherError, EncryptedEnvelope, EncryptedFile};
use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::identity::PrincipalId;
use crate::kdf::SessionKey;
use crate::replay::{ConversationId, ReplayGuard, ReplayRejection, ValidationMode};

/// Channel errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayRejection),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// One side of an established session.
pub struct SecureChannel<C: Clock = SystemClock> {
    key: SessionKey,
    outbound: ConversationId,
    inbound: ConversationId,
    tx_sequence: u64,
    chunk_size: usize,
    replay: Arc<ReplayGuard>,
    clock: C,
}

impl<C: Clock> SecureChannel<C> {
    /// Create a channel between `local` and `peer`.
    ///
    /// The guard may be shared by every channel of an endpoint; it keys its
    /// state by conversation direction.
    pub fn new(
        key: SessionKey,
        local: PrincipalId,
        peer: PrincipalId,
        replay: Arc<ReplayGuard>,
        clock: C,
    ) -> Self {
        let outbound = ConversationId::new(local, peer);
        let inbound = outbound.reversed();

        Self {
            key,
            outbound,
            inbound,
            tx_sequence: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            replay,
            clock,
        }
    }

    /// Override the file chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn local(&self) -> &PrincipalId {
        &self.outbound.sender
    }

    pub fn peer(&self) -> &PrincipalId {
        &self.outbound.recipient
    }

    /// Sequence number the next sealed envelope will carry.
    pub fn next_sequence(&self) -> u64 {
        self.tx_sequence
    }

    /// Encrypt a message for the peer.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<EncryptedEnvelope, ChannelError> {
        let envelope = cipher::seal_envelope(
            &self.key,
            plaintext,
            self.tx_sequence,
            self.clock.now_ms(),
        )?;
        self.tx_sequence = self.tx_sequence.wrapping_add(1);

        Ok(envelope)
    }

    /// Authenticate, replay-check and decrypt a live envelope from the peer.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, ChannelError> {
        self.accept(envelope, ValidationMode::Live)
    }

    /// Decrypt a previously accepted envelope, e.g. when reloading stored
    /// history. Only nonce uniqueness is enforced.
    pub fn load_history(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, ChannelError> {
        self.accept(envelope, ValidationMode::Historical)
    }

    fn accept(
        &self,
        envelope: &EncryptedEnvelope,
        mode: ValidationMode,
    ) -> Result<Vec<u8>, ChannelError> {
        let now_ms = self.clock.now_ms();

        self.replay.check(
            &self.inbound,
            &envelope.nonce,
            envelope.timestamp_ms,
            envelope.sequence_number,
            now_ms,
            mode,
        )?;

        let mut plaintext = cipher::open_envelope(&self.key, envelope)?;

        // A concurrent open of the same envelope can still lose here.
        if let Err(rejection) = self.replay.validate(
            &self.inbound,
            &envelope.nonce,
            envelope.timestamp_ms,
            envelope.sequence_number,
            now_ms,
            mode,
        ) {
            plaintext.zeroize();
            return Err(rejection.into());
        }

        debug!(
            conversation = %self.inbound,
            sequence = envelope.sequence_number,
            "envelope accepted"
        );
        Ok(plaintext)
    }

    /// Encrypt a file for the peer in chunks.
    pub fn seal_file(&self, data: &[u8]) -> Result<EncryptedFile, ChannelError> {
        Ok(cipher::encrypt_chunked(&self.key, data, self.chunk_size)?)
    }

    /// Decrypt a chunked file from the peer.
    pub fn open_file(&self, file: &EncryptedFile) -> Result<Vec<u8>, ChannelError> {
        Ok(cipher::decrypt_chunked(&self.key, file)?)
    }
}
