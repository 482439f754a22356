//! Signed ephemeral X25519 handshake.
//!
//! Each side proves ownership of its fresh ephemeral key by signing it with
//! its long-term Ed25519 identity. A man in the middle who substitutes an
//! ephemeral key invalidates the signature; that check is the protocol's only
//! MITM defense.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator (A)                                   Responder (B)
//!     |                                                 |
//!     |  initiate: eA, N_A, t, sig_A(eA || N_A || t)    |
//!     |------------------------------------------------>|
//!     |                                                 |  respond: verify sig_A,
//!     |                                                 |  K = HKDF(DH(eB, eA), N_A || N_B)
//!     |  eB, N_B, t', sig_B(eB || N_B || t')            |
//!     |<------------------------------------------------|
//!     |                                                 |
//!     |  complete: verify sig_B,                        |
//!     |  K = HKDF(DH(eA, eB), N_A || N_B)               |
//!     [            both sides hold K                    ]
//! ```
//!
//! [`HandshakeEngine`] implements the three steps without keeping any state.
//! [`HandshakeRegistry`] tracks one handshake per peer, supersedes stale
//! attempts, consumes every inbound message at most once and prunes
//! handshakes that outlive their validity window.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::config::HandshakeConfig;
use crate::encoding::b64_array;
use crate::identity::{IdentityKeyPair, PrincipalId, PublicIdentity};
use crate::kdf::{self, SessionKey};
use crate::{fill_random, random_nonce, Nonce, NONCE_SIZE};

/// Length of the byte string covered by a handshake signature.
const SIGNED_PAYLOAD_SIZE: usize = 32 + NONCE_SIZE + 8;

/// Handshake errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake expired")]
    Expired,

    #[error("handshake timestamp is in the future")]
    FutureTimestamp,

    #[error("invalid handshake signature")]
    InvalidSignature,

    #[error("invalid ephemeral public key")]
    InvalidPublicKey,

    #[error("no pending handshake for peer")]
    NoPendingHandshake,

    #[error("handshake message already consumed")]
    AlreadyConsumed,

    #[error("crypto operation failed: {0}")]
    CryptoOperation(&'static str),
}

/// One handshake message, in either direction.
///
/// Serializes as `{ephemeralPublicKey, signature, nonce, timestampMs}` with
/// base64 binary fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    #[serde(with = "b64_array")]
    pub ephemeral_public_key: [u8; 32],
    #[serde(with = "b64_array")]
    pub signature: [u8; 64],
    #[serde(with = "b64_array")]
    pub nonce: Nonce,
    pub timestamp_ms: u64,
}

impl HandshakeMessage {
    /// The bytes the sender signed: `ephemeralPublicKey || nonce || timestampMs`.
    pub fn signed_payload(&self) -> [u8; SIGNED_PAYLOAD_SIZE] {
        signed_payload(&self.ephemeral_public_key, &self.nonce, self.timestamp_ms)
    }

    fn sign(
        identity: &IdentityKeyPair,
        ephemeral_public_key: [u8; 32],
        nonce: Nonce,
        timestamp_ms: u64,
    ) -> Self {
        let signature = identity.sign(&signed_payload(&ephemeral_public_key, &nonce, timestamp_ms));
        Self {
            ephemeral_public_key,
            signature,
            nonce,
            timestamp_ms,
        }
    }
}

fn signed_payload(
    ephemeral_public_key: &[u8; 32],
    nonce: &Nonce,
    timestamp_ms: u64,
) -> [u8; SIGNED_PAYLOAD_SIZE] {
    let mut payload = [0u8; SIGNED_PAYLOAD_SIZE];
    payload[..32].copy_from_slice(ephemeral_public_key);
    payload[32..32 + NONCE_SIZE].copy_from_slice(nonce);
    payload[32 + NONCE_SIZE..].copy_from_slice(&timestamp_ms.to_be_bytes());
    payload
}

/// X25519 keypair used for exactly one handshake attempt.
///
/// The secret half is zeroized on drop and is consumed by the key agreement,
/// so it cannot outlive session key derivation.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Result<Self, HandshakeError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        fill_random(&mut bytes[..])
            .map_err(|_| HandshakeError::CryptoOperation("random number generator failed"))?;

        let secret = StaticSecret::from(*bytes);
        let public = X25519PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// ECDH with the peer's ephemeral key, then derive the session key.
    ///
    /// Rejects low-order peer keys, which would force an all-zero secret.
    fn agree(self, peer_public: &[u8; 32], salt: &[u8]) -> Result<SessionKey, HandshakeError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer_public));

        if !shared.was_contributory() {
            return Err(HandshakeError::InvalidPublicKey);
        }

        Ok(kdf::derive(shared.as_bytes(), salt))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Stateless implementation of the three handshake steps.
#[derive(Debug, Clone)]
pub struct HandshakeEngine<C: Clock = SystemClock> {
    config: HandshakeConfig,
    clock: C,
}

impl Default for HandshakeEngine<SystemClock> {
    fn default() -> Self {
        Self::new(HandshakeConfig::default(), SystemClock)
    }
}

impl<C: Clock> HandshakeEngine<C> {
    pub fn new(config: HandshakeConfig, clock: C) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Step 1 (initiator): fresh ephemeral key and nonce, signed.
    pub fn initiate(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<(EphemeralKeyPair, HandshakeMessage), HandshakeError> {
        let ephemeral = EphemeralKeyPair::generate()?;
        let nonce = random_nonce()
            .map_err(|_| HandshakeError::CryptoOperation("random number generator failed"))?;

        let message =
            HandshakeMessage::sign(identity, ephemeral.public_key(), nonce, self.now_ms());

        Ok((ephemeral, message))
    }

    /// Step 2 (responder): authenticate the initiator and derive the session
    /// key. Returns the key and the reply to send back.
    pub fn respond(
        &self,
        inbound: &HandshakeMessage,
        peer_identity: &PublicIdentity,
        own_identity: &IdentityKeyPair,
    ) -> Result<(SessionKey, HandshakeMessage), HandshakeError> {
        self.authenticate(inbound, peer_identity)?;

        let ephemeral = EphemeralKeyPair::generate()?;
        let own_nonce = random_nonce()
            .map_err(|_| HandshakeError::CryptoOperation("random number generator failed"))?;
        let reply = HandshakeMessage::sign(
            own_identity,
            ephemeral.public_key(),
            own_nonce,
            self.now_ms(),
        );

        let salt = kdf::handshake_salt(&inbound.nonce, &own_nonce);
        let session_key = ephemeral.agree(&inbound.ephemeral_public_key, &salt)?;

        debug!(peer = %peer_identity.principal_id(), "handshake responded");
        Ok((session_key, reply))
    }

    /// Step 3 (initiator): authenticate the responder and derive the same
    /// session key. Consumes the ephemeral keypair from [`Self::initiate`].
    pub fn complete(
        &self,
        response: &HandshakeMessage,
        peer_identity: &PublicIdentity,
        own_ephemeral: EphemeralKeyPair,
        own_nonce: &Nonce,
    ) -> Result<SessionKey, HandshakeError> {
        self.authenticate(response, peer_identity)?;

        let salt = kdf::handshake_salt(own_nonce, &response.nonce);
        let session_key = own_ephemeral.agree(&response.ephemeral_public_key, &salt)?;

        debug!(peer = %peer_identity.principal_id(), "handshake completed");
        Ok(session_key)
    }

    /// Freshness first, then the signature.
    fn authenticate(
        &self,
        message: &HandshakeMessage,
        peer_identity: &PublicIdentity,
    ) -> Result<(), HandshakeError> {
        self.check_freshness(message.timestamp_ms)?;

        if !peer_identity.verify(&message.signed_payload(), &message.signature) {
            warn!(
                peer = %peer_identity.principal_id(),
                "handshake signature verification failed"
            );
            return Err(HandshakeError::InvalidSignature);
        }

        Ok(())
    }

    fn check_freshness(&self, timestamp_ms: u64) -> Result<(), HandshakeError> {
        let now = self.now_ms();

        if now.saturating_sub(timestamp_ms) > self.config.max_age_ms {
            return Err(HandshakeError::Expired);
        }
        if timestamp_ms > now.saturating_add(self.config.clock_skew_ms) {
            return Err(HandshakeError::FutureTimestamp);
        }

        Ok(())
    }

    /// How long a consumed message nonce must be remembered: any message
    /// older than this fails the freshness check anyway.
    fn consumption_window_ms(&self) -> u64 {
        self.config
            .max_age_ms
            .saturating_add(self.config.clock_skew_ms)
    }
}

/// Observable state of the handshake with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// No handshake in progress (never started, or pruned).
    Idle,
    /// We sent an initiation and await the response.
    Initiated,
    /// We answered the peer's initiation; the session key is in use.
    Responded,
    /// We completed our own initiation.
    Confirmed,
    /// Terminal failure; a fresh `initiate` is required.
    Failed(HandshakeError),
    /// The validity window elapsed; a fresh `initiate` is required.
    Expired,
}

enum PeerState {
    Initiated {
        ephemeral: EphemeralKeyPair,
        nonce: Nonce,
    },
    Responded,
    Confirmed,
    Failed(HandshakeError),
    Expired,
}

struct PeerEntry {
    state: PeerState,
    since_ms: u64,
}

/// Per-peer handshake state machine.
///
/// Not internally synchronized: one registry is owned by one task (or held
/// behind a lock) so a peer's handshake has a single writer.
pub struct HandshakeRegistry<C: Clock = SystemClock> {
    engine: HandshakeEngine<C>,
    peers: HashMap<PrincipalId, PeerEntry>,
    /// Nonces of inbound messages already accepted, with their forget time.
    consumed: HashMap<Nonce, u64>,
}

impl Default for HandshakeRegistry<SystemClock> {
    fn default() -> Self {
        Self::new(HandshakeEngine::default())
    }
}

impl<C: Clock> HandshakeRegistry<C> {
    pub fn new(engine: HandshakeEngine<C>) -> Self {
        Self {
            engine,
            peers: HashMap::new(),
            consumed: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &HandshakeEngine<C> {
        &self.engine
    }

    /// Start a handshake with `peer`, superseding any attempt in flight.
    pub fn initiate(
        &mut self,
        peer: &PrincipalId,
        identity: &IdentityKeyPair,
    ) -> Result<HandshakeMessage, HandshakeError> {
        let (ephemeral, message) = self.engine.initiate(identity)?;

        let previous = self.peers.insert(
            peer.clone(),
            PeerEntry {
                state: PeerState::Initiated {
                    ephemeral,
                    nonce: message.nonce,
                },
                since_ms: message.timestamp_ms,
            },
        );
        if matches!(
            previous,
            Some(PeerEntry {
                state: PeerState::Initiated { .. },
                ..
            })
        ) {
            debug!(peer = %peer, "superseded pending handshake");
        }

        Ok(message)
    }

    /// Answer `peer`'s initiation.
    pub fn respond(
        &mut self,
        peer: &PrincipalId,
        inbound: &HandshakeMessage,
        peer_identity: &PublicIdentity,
        own_identity: &IdentityKeyPair,
    ) -> Result<(SessionKey, HandshakeMessage), HandshakeError> {
        let now = self.engine.now_ms();
        self.ensure_unconsumed(&inbound.nonce, now)?;

        match self.engine.respond(inbound, peer_identity, own_identity) {
            Ok((session_key, reply)) => {
                self.consume(inbound.nonce, now);
                self.set_state(peer, PeerState::Responded, now);
                Ok((session_key, reply))
            }
            Err(err) => {
                // An unauthenticated initiation must not cancel our own attempt.
                if self.has_pending(peer) {
                    debug!(
                        peer = %peer,
                        error = %err,
                        "rejected initiation, pending handshake kept"
                    );
                } else {
                    self.record_failure(peer, err, now);
                }
                Err(err)
            }
        }
    }

    /// Finish the handshake we initiated with `peer`.
    pub fn complete(
        &mut self,
        peer: &PrincipalId,
        response: &HandshakeMessage,
        peer_identity: &PublicIdentity,
    ) -> Result<SessionKey, HandshakeError> {
        let now = self.engine.now_ms();

        let Some(entry) = self.peers.get(peer) else {
            return Err(HandshakeError::NoPendingHandshake);
        };
        if !matches!(entry.state, PeerState::Initiated { .. }) {
            return Err(HandshakeError::NoPendingHandshake);
        }
        let started_ms = entry.since_ms;
        self.ensure_unconsumed(&response.nonce, now)?;

        if now.saturating_sub(started_ms) > self.engine.config().max_age_ms {
            // Dropping the entry drops the ephemeral secret.
            self.set_state(peer, PeerState::Expired, now);
            debug!(peer = %peer, "pending handshake expired");
            return Err(HandshakeError::Expired);
        }

        let Some(PeerEntry {
            state: PeerState::Initiated { ephemeral, nonce },
            ..
        }) = self.peers.remove(peer)
        else {
            return Err(HandshakeError::NoPendingHandshake);
        };

        match self
            .engine
            .complete(response, peer_identity, ephemeral, &nonce)
        {
            Ok(session_key) => {
                self.consume(response.nonce, now);
                self.set_state(peer, PeerState::Confirmed, now);
                Ok(session_key)
            }
            Err(err) => {
                self.record_failure(peer, err, now);
                Err(err)
            }
        }
    }

    pub fn status(&self, peer: &PrincipalId) -> HandshakeStatus {
        match self.peers.get(peer).map(|entry| &entry.state) {
            None => HandshakeStatus::Idle,
            Some(PeerState::Initiated { .. }) => HandshakeStatus::Initiated,
            Some(PeerState::Responded) => HandshakeStatus::Responded,
            Some(PeerState::Confirmed) => HandshakeStatus::Confirmed,
            Some(PeerState::Failed(err)) => HandshakeStatus::Failed(*err),
            Some(PeerState::Expired) => HandshakeStatus::Expired,
        }
    }

    /// Number of handshakes awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.peers
            .values()
            .filter(|entry| matches!(entry.state, PeerState::Initiated { .. }))
            .count()
    }

    /// Drop every peer entry older than the validity window (pending
    /// handshakes included) and forget stale consumed nonces.
    ///
    /// Returns the number of peer entries removed.
    pub fn prune_expired(&mut self) -> usize {
        let now = self.engine.now_ms();
        let max_age_ms = self.engine.config().max_age_ms;

        let before = self.peers.len();
        self.peers
            .retain(|_, entry| now.saturating_sub(entry.since_ms) <= max_age_ms);
        self.consumed.retain(|_, forget_at| *forget_at > now);

        let removed = before - self.peers.len();
        if removed > 0 {
            trace!(removed, "pruned handshake entries");
        }
        removed
    }

    /// Forget everything about `peer`. Returns whether an entry existed.
    pub fn forget(&mut self, peer: &PrincipalId) -> bool {
        self.peers.remove(peer).is_some()
    }

    fn has_pending(&self, peer: &PrincipalId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|entry| matches!(entry.state, PeerState::Initiated { .. }))
    }

    fn ensure_unconsumed(&self, nonce: &Nonce, now: u64) -> Result<(), HandshakeError> {
        match self.consumed.get(nonce) {
            Some(forget_at) if *forget_at > now => Err(HandshakeError::AlreadyConsumed),
            _ => Ok(()),
        }
    }

    fn consume(&mut self, nonce: Nonce, now: u64) {
        let forget_at = now.saturating_add(self.engine.consumption_window_ms());
        self.consumed.insert(nonce, forget_at);
    }

    fn set_state(&mut self, peer: &PrincipalId, state: PeerState, now: u64) {
        self.peers.insert(
            peer.clone(),
            PeerEntry {
                state,
                since_ms: now,
            },
        );
    }

    fn record_failure(&mut self, peer: &PrincipalId, err: HandshakeError, now: u64) {
        let state = match err {
            HandshakeError::Expired => PeerState::Expired,
            other => PeerState::Failed(other),
        };
        self.set_state(peer, state, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn engine(clock: &ManualClock) -> HandshakeEngine<ManualClock> {
        HandshakeEngine::new(HandshakeConfig::default(), clock.clone())
    }

    fn identities() -> (IdentityKeyPair, IdentityKeyPair) {
        (
            IdentityKeyPair::generate().unwrap(),
            IdentityKeyPair::generate().unwrap(),
        )
    }

    #[test]
    fn test_full_handshake_agrees() {
        let clock = ManualClock::new(T0);
        let engine = engine(&clock);
        let (alice, bob) = identities();

        let (ephemeral, init) = engine.initiate(&alice).unwrap();
        let own_nonce = init.nonce;

        let (bob_key, reply) = engine
            .respond(&init, &alice.public_identity(), &bob)
            .unwrap();
        let alice_key = engine
            .complete(&reply, &bob.public_identity(), ephemeral, &own_nonce)
            .unwrap();

        assert!(alice_key.ct_eq(&bob_key));
    }

    #[test]
    fn test_signature_covers_every_field() {
        let clock = ManualClock::new(T0);
        let engine = engine(&clock);
        let (alice, bob) = identities();

        let (_, init) = engine.initiate(&alice).unwrap();

        let mut bad_key = init.clone();
        bad_key.ephemeral_public_key[0] ^= 0x01;
        let mut bad_nonce = init.clone();
        bad_nonce.nonce[15] ^= 0x80;
        let mut bad_time = init.clone();
        bad_time.timestamp_ms -= 1;

        for tampered in [bad_key, bad_nonce, bad_time] {
            assert_eq!(
                engine
                    .respond(&tampered, &alice.public_identity(), &bob)
                    .unwrap_err(),
                HandshakeError::InvalidSignature
            );
        }
    }

    #[test]
    fn test_substituted_ephemeral_key_detected() {
        let clock = ManualClock::new(T0);
        let engine = engine(&clock);
        let (alice, bob) = identities();
        let mallory = IdentityKeyPair::generate().unwrap();

        let (_, init) = engine.initiate(&alice).unwrap();
        let (_, forged) = engine.initiate(&mallory).unwrap();

        let mut substituted = init;
        substituted.ephemeral_public_key = forged.ephemeral_public_key;

        assert_eq!(
            engine
                .respond(&substituted, &alice.public_identity(), &bob)
                .unwrap_err(),
            HandshakeError::InvalidSignature
        );
        // Mallory's own signature does not pass as Alice's either
        assert_eq!(
            engine
                .respond(&forged, &alice.public_identity(), &bob)
                .unwrap_err(),
            HandshakeError::InvalidSignature
        );
    }

    #[test]
    fn test_expired_message_rejected_despite_valid_signature() {
        let clock = ManualClock::new(T0);
        let engine = engine(&clock);
        let (alice, bob) = identities();

        let (_, init) = engine.initiate(&alice).unwrap();
        clock.advance(engine.config().max_age_ms + 1);

        assert_eq!(
            engine
                .respond(&init, &alice.public_identity(), &bob)
                .unwrap_err(),
            HandshakeError::Expired
        );
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let clock = ManualClock::new(T0);
        let engine = engine(&clock);
        let (alice, bob) = identities();

        let (_, init) = engine.initiate(&alice).unwrap();
        clock.set(T0 - engine.config().clock_skew_ms - 1);

        assert_eq!(
            engine
                .respond(&init, &alice.public_identity(), &bob)
                .unwrap_err(),
            HandshakeError::FutureTimestamp
        );

        // Within the tolerated skew it is fine
        clock.set(T0 - engine.config().clock_skew_ms);
        assert!(engine
            .respond(&init, &alice.public_identity(), &bob)
            .is_ok());
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let clock = ManualClock::new(T0);
        let engine = engine(&clock);
        let (alice, bob) = identities();

        // The identity point: signed correctly, but forces a zero secret.
        let message = HandshakeMessage::sign(&alice, [0u8; 32], [9u8; 16], T0);
        assert_eq!(
            engine
                .respond(&message, &alice.public_identity(), &bob)
                .unwrap_err(),
            HandshakeError::InvalidPublicKey
        );
    }

    #[test]
    fn test_message_json_shape() {
        let clock = ManualClock::new(T0);
        let (alice, _) = identities();
        let (_, init) = engine(&clock).initiate(&alice).unwrap();

        let json = serde_json::to_value(&init).unwrap();
        assert!(json["ephemeralPublicKey"].is_string());
        assert!(json["signature"].is_string());
        assert!(json["nonce"].is_string());
        assert_eq!(json["timestampMs"], T0);

        let parsed: HandshakeMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn test_registry_lifecycle() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let mut bob_side = HandshakeRegistry::new(engine(&clock));
        let alice_id = alice.principal_id();
        let bob_id = bob.principal_id();

        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Idle);

        let init = alice_side.initiate(&bob_id, &alice).unwrap();
        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Initiated);
        assert_eq!(alice_side.pending_count(), 1);

        let (bob_key, reply) = bob_side
            .respond(&alice_id, &init, &alice.public_identity(), &bob)
            .unwrap();
        assert_eq!(bob_side.status(&alice_id), HandshakeStatus::Responded);

        let alice_key = alice_side
            .complete(&bob_id, &reply, &bob.public_identity())
            .unwrap();
        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Confirmed);
        assert_eq!(alice_side.pending_count(), 0);
        assert!(alice_key.ct_eq(&bob_key));

        // No second completion from the same pending state
        assert_eq!(
            alice_side
                .complete(&bob_id, &reply, &bob.public_identity())
                .unwrap_err(),
            HandshakeError::NoPendingHandshake
        );
    }

    #[test]
    fn test_registry_consumes_messages_once() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut bob_side = HandshakeRegistry::new(engine(&clock));
        let alice_id = alice.principal_id();

        let (_, init) = engine(&clock).initiate(&alice).unwrap();
        bob_side
            .respond(&alice_id, &init, &alice.public_identity(), &bob)
            .unwrap();

        assert_eq!(
            bob_side
                .respond(&alice_id, &init, &alice.public_identity(), &bob)
                .unwrap_err(),
            HandshakeError::AlreadyConsumed
        );
    }

    #[test]
    fn test_registry_signature_failure_is_terminal() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let bob_id = bob.principal_id();

        let init = alice_side.initiate(&bob_id, &alice).unwrap();
        let (_, mut reply) = engine(&clock)
            .respond(&init, &alice.public_identity(), &bob)
            .unwrap();
        reply.signature[0] ^= 0x01;

        assert_eq!(
            alice_side
                .complete(&bob_id, &reply, &bob.public_identity())
                .unwrap_err(),
            HandshakeError::InvalidSignature
        );
        assert_eq!(
            alice_side.status(&bob_id),
            HandshakeStatus::Failed(HandshakeError::InvalidSignature)
        );
    }

    #[test]
    fn test_registry_forged_initiation_keeps_pending() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mallory = IdentityKeyPair::generate().unwrap();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let bob_id = bob.principal_id();

        let init = alice_side.initiate(&bob_id, &alice).unwrap();

        // Signed by Mallory but presented as coming from Bob
        let (_, forged) = engine(&clock).initiate(&mallory).unwrap();
        assert_eq!(
            alice_side
                .respond(&bob_id, &forged, &bob.public_identity(), &alice)
                .unwrap_err(),
            HandshakeError::InvalidSignature
        );
        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Initiated);

        let (bob_key, reply) = engine(&clock)
            .respond(&init, &alice.public_identity(), &bob)
            .unwrap();
        let alice_key = alice_side
            .complete(&bob_id, &reply, &bob.public_identity())
            .unwrap();
        assert!(alice_key.ct_eq(&bob_key));
    }

    #[test]
    fn test_registry_stale_initiation_keeps_pending() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let bob_id = bob.principal_id();
        let max_age = alice_side.engine().config().max_age_ms;

        // An old initiation from Bob, captured and held back
        let (_, captured) = engine(&clock).initiate(&bob).unwrap();
        clock.advance(max_age + 1);

        let init = alice_side.initiate(&bob_id, &alice).unwrap();
        assert_eq!(
            alice_side
                .respond(&bob_id, &captured, &bob.public_identity(), &alice)
                .unwrap_err(),
            HandshakeError::Expired
        );
        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Initiated);

        let (bob_key, reply) = engine(&clock)
            .respond(&init, &alice.public_identity(), &bob)
            .unwrap();
        let alice_key = alice_side
            .complete(&bob_id, &reply, &bob.public_identity())
            .unwrap();
        assert!(alice_key.ct_eq(&bob_key));
    }

    #[test]
    fn test_registry_failed_initiation_recorded_without_pending() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut bob_side = HandshakeRegistry::new(engine(&clock));
        let alice_id = alice.principal_id();

        let (_, mut init) = engine(&clock).initiate(&alice).unwrap();
        init.signature[0] ^= 0x01;

        assert!(bob_side
            .respond(&alice_id, &init, &alice.public_identity(), &bob)
            .is_err());
        assert_eq!(
            bob_side.status(&alice_id),
            HandshakeStatus::Failed(HandshakeError::InvalidSignature)
        );
    }

    #[test]
    fn test_registry_pending_handshake_expires() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let bob_id = bob.principal_id();

        let init = alice_side.initiate(&bob_id, &alice).unwrap();
        let max_age = alice_side.engine().config().max_age_ms;

        // Bob's reply is itself fresh, but Alice's pending attempt is not.
        clock.advance(max_age / 2);
        let (_, reply) = engine(&clock)
            .respond(&init, &alice.public_identity(), &bob)
            .unwrap();
        clock.advance(max_age / 2 + 1);

        assert_eq!(
            alice_side
                .complete(&bob_id, &reply, &bob.public_identity())
                .unwrap_err(),
            HandshakeError::Expired
        );
        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Expired);
    }

    #[test]
    fn test_registry_prunes_stale_pending() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let bob_id = bob.principal_id();

        alice_side.initiate(&bob_id, &alice).unwrap();
        assert_eq!(alice_side.prune_expired(), 0);

        clock.advance(alice_side.engine().config().max_age_ms + 1);
        assert_eq!(alice_side.prune_expired(), 1);
        assert_eq!(alice_side.status(&bob_id), HandshakeStatus::Idle);
    }

    #[test]
    fn test_registry_initiate_supersedes_previous() {
        let clock = ManualClock::new(T0);
        let (alice, bob) = identities();
        let mut alice_side = HandshakeRegistry::new(engine(&clock));
        let bob_id = bob.principal_id();

        let first = alice_side.initiate(&bob_id, &alice).unwrap();
        let second = alice_side.initiate(&bob_id, &alice).unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_eq!(alice_side.pending_count(), 1);

        // A response to the superseded attempt cannot produce Bob's key.
        let (bob_key, stale_reply) = engine(&clock)
            .respond(&first, &alice.public_identity(), &bob)
            .unwrap();
        let alice_key = alice_side
            .complete(&bob_id, &stale_reply, &bob.public_identity())
            .unwrap();
        assert!(!alice_key.ct_eq(&bob_key));
    }
}
