//! Replay protection for encrypted envelopes.
//!
//! Each conversation (ordered `sender -> recipient` pair) keeps the nonces it
//! has accepted, each with an expiry, and the highest sequence number it
//! has accepted. An envelope is accepted only if:
//!
//! 1. its timestamp is fresh (`Live` mode only),
//! 2. its nonce has not been seen within the retention window,
//! 3. its sequence number is above every one accepted so far (`Live` mode only).
//!
//! `Historical` mode is for re-loading envelopes that were accepted earlier
//! (e.g. from local storage): timestamp and ordering are ignored, but each
//! nonce is still recorded exactly once.
//!
//! # Thread Safety
//!
//! [`ReplayGuard`] is `Send + Sync`. The conversation map sits behind an
//! `RwLock` and each conversation behind its own `Mutex`, so validation for
//! one conversation is serialized while different conversations proceed in
//! parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tracing::{trace, warn};

use crate::config::ReplayConfig;
use crate::identity::PrincipalId;
use crate::Nonce;

/// Why an envelope was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplayRejection {
    #[error("message timestamp expired")]
    ExpiredTimestamp,

    #[error("message timestamp is in the future")]
    FutureTimestamp,

    #[error("duplicate message nonce")]
    DuplicateNonce,

    #[error("sequence number already passed")]
    OldSequence,
}

/// How strictly an envelope is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Newly received traffic: every check applies.
    #[default]
    Live,
    /// Previously accepted traffic being reloaded: only nonce uniqueness.
    Historical,
}

/// Direction-sensitive conversation key. `(a, b)` and `(b, a)` are distinct.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConversationId {
    pub sender: PrincipalId,
    pub recipient: PrincipalId,
}

impl ConversationId {
    pub fn new(sender: PrincipalId, recipient: PrincipalId) -> Self {
        Self { sender, recipient }
    }

    /// The same pair in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            sender: self.recipient.clone(),
            recipient: self.sender.clone(),
        }
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.sender, self.recipient)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Default)]
struct ReplayState {
    /// Accepted nonce -> time (ms) after which it may be forgotten.
    nonces: HashMap<Nonce, u64>,
    /// `None` until the first envelope is accepted.
    highest_sequence: Option<u64>,
}

impl ReplayState {
    fn is_duplicate(&self, nonce: &Nonce, now_ms: u64) -> bool {
        self.nonces
            .get(nonce)
            .is_some_and(|expires_at| *expires_at > now_ms)
    }

    fn purge(&mut self, now_ms: u64) -> usize {
        let before = self.nonces.len();
        self.nonces.retain(|_, expires_at| *expires_at > now_ms);
        before - self.nonces.len()
    }
}

/// Per-conversation replay guard.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    config: ReplayConfig,
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<ReplayState>>>>,
}

fn lock(state: &Mutex<ReplayState>) -> MutexGuard<'_, ReplayState> {
    // Every mutation leaves the state consistent, so a poisoned lock is still usable.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReplayGuard {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Check an envelope and, if it passes, record it.
    pub fn validate(
        &self,
        conversation: &ConversationId,
        nonce: &Nonce,
        timestamp_ms: u64,
        sequence: u64,
        now_ms: u64,
        mode: ValidationMode,
    ) -> Result<(), ReplayRejection> {
        // Rejected traffic must not leave a conversation entry behind.
        let entry = match self.existing(conversation) {
            Some(entry) => entry,
            None => {
                let fresh = ReplayState::default();
                if let Err(rejection) =
                    self.evaluate(&fresh, nonce, timestamp_ms, sequence, now_ms, mode)
                {
                    warn!(%conversation, sequence, reason = %rejection, "envelope rejected");
                    return Err(rejection);
                }
                self.state_for(conversation)
            }
        };
        let mut state = lock(&entry);

        let purged = state.purge(now_ms);
        if purged > 0 {
            trace!(%conversation, purged, "purged expired nonces");
        }

        if let Err(rejection) = self.evaluate(&state, nonce, timestamp_ms, sequence, now_ms, mode) {
            warn!(%conversation, sequence, reason = %rejection, "envelope rejected");
            return Err(rejection);
        }

        state
            .nonces
            .insert(*nonce, now_ms.saturating_add(self.config.retention_ms));
        state.highest_sequence = Some(
            state
                .highest_sequence
                .map_or(sequence, |highest| highest.max(sequence)),
        );

        Ok(())
    }

    /// Run the same checks as [`Self::validate`] without recording anything.
    pub fn check(
        &self,
        conversation: &ConversationId,
        nonce: &Nonce,
        timestamp_ms: u64,
        sequence: u64,
        now_ms: u64,
        mode: ValidationMode,
    ) -> Result<(), ReplayRejection> {
        match self.existing(conversation) {
            Some(entry) => {
                let state = lock(&entry);
                self.evaluate(&state, nonce, timestamp_ms, sequence, now_ms, mode)
            }
            None => self.evaluate(
                &ReplayState::default(),
                nonce,
                timestamp_ms,
                sequence,
                now_ms,
                mode,
            ),
        }
    }

    fn evaluate(
        &self,
        state: &ReplayState,
        nonce: &Nonce,
        timestamp_ms: u64,
        sequence: u64,
        now_ms: u64,
        mode: ValidationMode,
    ) -> Result<(), ReplayRejection> {
        let live = mode == ValidationMode::Live;

        if live {
            if now_ms.saturating_sub(timestamp_ms) > self.config.max_age_ms {
                return Err(ReplayRejection::ExpiredTimestamp);
            }
            if timestamp_ms > now_ms.saturating_add(self.config.clock_skew_ms) {
                return Err(ReplayRejection::FutureTimestamp);
            }
        }

        if state.is_duplicate(nonce, now_ms) {
            return Err(ReplayRejection::DuplicateNonce);
        }

        if live && state.highest_sequence.is_some_and(|highest| sequence <= highest) {
            return Err(ReplayRejection::OldSequence);
        }

        Ok(())
    }

    /// Evict expired nonces across all conversations. Returns the count.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let purged: usize = conversations
            .values()
            .map(|state| lock(state).purge(now_ms))
            .sum();

        if purged > 0 {
            trace!(purged, "purged expired nonces");
        }
        purged
    }

    /// Lowest sequence number the conversation will accept in live mode.
    ///
    /// `None` once `u64::MAX` has been accepted: the conversation is exhausted.
    pub fn next_expected_sequence(&self, conversation: &ConversationId) -> Option<u64> {
        match self.existing(conversation) {
            Some(state) => match lock(&state).highest_sequence {
                Some(highest) => highest.checked_add(1),
                None => Some(0),
            },
            None => Some(0),
        }
    }

    /// Highest sequence number accepted so far, if any.
    pub fn highest_sequence(&self, conversation: &ConversationId) -> Option<u64> {
        self.existing(conversation)
            .and_then(|state| lock(&state).highest_sequence)
    }

    /// Nonces currently remembered for the conversation (expired ones
    /// included until the next purge).
    pub fn tracked_nonces(&self, conversation: &ConversationId) -> usize {
        self.existing(conversation)
            .map(|state| lock(&state).nonces.len())
            .unwrap_or(0)
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop all state for a conversation. Returns whether it existed.
    pub fn remove_conversation(&self, conversation: &ConversationId) -> bool {
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation)
            .is_some()
    }

    fn existing(&self, conversation: &ConversationId) -> Option<Arc<Mutex<ReplayState>>> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation)
            .cloned()
    }

    fn state_for(&self, conversation: &ConversationId) -> Arc<Mutex<ReplayState>> {
        if let Some(state) = self.existing(conversation) {
            return state;
        }

        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation.clone())
            .or_default()
            .clone()
    }
}
