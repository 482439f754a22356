use hush_crypto::{EncryptedEnvelope, EncryptedFile, HandshakeMessage, PrincipalId};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Frame moved by a relay between two principals.
///
/// The relay routes on `to` and never interprets the payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
#[allow(non_camel_case_types)]
pub enum RelayFrame {
    /// Handshake step 1, initiator to responder.
    HANDSHAKE_INIT {
        from: PrincipalId,
        to: PrincipalId,
        message: HandshakeMessage,
    },

    /// Handshake step 2, responder back to initiator.
    HANDSHAKE_RESPONSE {
        from: PrincipalId,
        to: PrincipalId,
        message: HandshakeMessage,
    },

    /// An encrypted message.
    ENVELOPE {
        from: PrincipalId,
        to: PrincipalId,
        envelope: EncryptedEnvelope,
    },

    /// An encrypted, chunked file.
    FILE {
        from: PrincipalId,
        to: PrincipalId,
        #[serde(default)]
        name: Option<String>,
        file: EncryptedFile,
    },

    /// Delivery failure reported by the relay or the peer.
    ERROR {
        from: PrincipalId,
        to: PrincipalId,
        code: Option<u16>,
        message: String,
    },
}

impl RelayFrame {
    pub fn from(&self) -> &PrincipalId {
        match self {
            RelayFrame::HANDSHAKE_INIT { from, .. }
            | RelayFrame::HANDSHAKE_RESPONSE { from, .. }
            | RelayFrame::ENVELOPE { from, .. }
            | RelayFrame::FILE { from, .. }
            | RelayFrame::ERROR { from, .. } => from,
        }
    }

    pub fn to(&self) -> &PrincipalId {
        match self {
            RelayFrame::HANDSHAKE_INIT { to, .. }
            | RelayFrame::HANDSHAKE_RESPONSE { to, .. }
            | RelayFrame::ENVELOPE { to, .. }
            | RelayFrame::FILE { to, .. }
            | RelayFrame::ERROR { to, .. } => to,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let frame: Self = serde_json::from_str(raw)?;
        if frame.from() == frame.to() {
            return Err(Error::protocol("frame addressed to its sender"));
        }
        Ok(frame)
    }
}
