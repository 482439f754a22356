//! Handshake tampering and shared replay state across concurrent sessions.
//!
//! The full relay scenario, with real wire frames, lives in `hush-common`.

use std::sync::Arc;

use hush_crypto::{
    HandshakeEngine, HandshakeError, HandshakeRegistry, HandshakeStatus, IdentityKeyPair,
    ManualClock, PrincipalId, ReplayGuard, SecureChannel, SecurityConfig, SessionKey,
};

const T0: u64 = 1_700_000_000_000;

struct Endpoint {
    identity: IdentityKeyPair,
    registry: HandshakeRegistry<ManualClock>,
}

impl Endpoint {
    fn new(seed: u8, clock: &ManualClock) -> Self {
        let config = SecurityConfig::default();
        Self {
            identity: IdentityKeyPair::from_seed(&[seed; 32]),
            registry: HandshakeRegistry::new(HandshakeEngine::new(config.handshake, clock.clone())),
        }
    }

    fn id(&self) -> PrincipalId {
        self.identity.principal_id()
    }
}

#[tokio::test]
async fn test_relay_substituting_ephemeral_key_is_detected() {
    let clock = ManualClock::new(T0);
    let mut alice = Endpoint::new(1, &clock);
    let mut bob = Endpoint::new(2, &clock);
    let mallory = Endpoint::new(3, &clock);

    let init = alice.registry.initiate(&bob.id(), &alice.identity).unwrap();

    // A malicious relay swaps in its own ephemeral key
    let (_, mallory_init) = mallory.registry.engine().initiate(&mallory.identity).unwrap();
    let mut tampered = init;
    tampered.ephemeral_public_key = mallory_init.ephemeral_public_key;

    let alice_id = alice.id();
    let alice_identity = alice.identity.public_identity();
    let err = bob
        .registry
        .respond(&alice_id, &tampered, &alice_identity, &bob.identity)
        .unwrap_err();
    assert_eq!(err, HandshakeError::InvalidSignature);
    assert_eq!(
        bob.registry.status(&alice_id),
        HandshakeStatus::Failed(HandshakeError::InvalidSignature)
    );

    // Alice's own attempt is untouched and can still be pruned later
    assert_eq!(alice.registry.status(&bob.id()), HandshakeStatus::Initiated);
    clock.advance(SecurityConfig::default().handshake.max_age_ms + 1);
    assert_eq!(alice.registry.prune_expired(), 1);
}

#[tokio::test]
async fn test_concurrent_conversations_share_one_guard() {
    let clock = ManualClock::new(T0);
    let guard = Arc::new(ReplayGuard::new(SecurityConfig::default().replay));
    let hub = IdentityKeyPair::from_seed(&[9u8; 32]).principal_id();

    let mut tasks = Vec::new();
    for seed in 10..18u8 {
        let guard = guard.clone();
        let clock = clock.clone();
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let peer = IdentityKeyPair::from_seed(&[seed; 32]).principal_id();
            let key = SessionKey::from_bytes([seed; 32]);

            let mut sender = SecureChannel::new(
                key.clone(),
                peer.clone(),
                hub.clone(),
                Arc::new(ReplayGuard::default()),
                clock.clone(),
            );
            let receiver = SecureChannel::new(key, hub, peer, guard, clock);

            for i in 0..20u32 {
                let envelope = sender.seal(&i.to_be_bytes()).unwrap();
                assert_eq!(receiver.open(&envelope).unwrap(), i.to_be_bytes());
                tokio::task::yield_now().await;
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(guard.conversation_count(), 8);
}
