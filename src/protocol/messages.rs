// protocol/messages.rs - Wire Messages

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::trust::{Fingerprint, PublicKey, RelatedData, Signature};

/// Upper bound on a decoded message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors raised while encoding or decoding messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),
}

/// Messages exchanged between peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Opening move of a handshake, or the reply to one
    HandshakeInit {
        public_key: PublicKey,
        signature: Signature,
        is_response: bool,
    },

    /// Certificate the sender issued on the receiver's key
    HandshakeSignature { signature: Signature },

    /// The subjects the sender already trusts
    SyncRequest { trusted_subjects: HashSet<Fingerprint> },

    /// Certificate material the receiver is missing
    Sync { related_data: HashSet<RelatedData> },
}

impl Message {
    /// Short name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Message::HandshakeInit { is_response: false, .. } => "handshake_init",
            Message::HandshakeInit { is_response: true, .. } => "handshake_response",
            Message::HandshakeSignature { .. } => "handshake_signature",
            Message::SyncRequest { .. } => "sync_request",
            Message::Sync { .. } => "sync",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let config = bincode::config::standard().with_limit::<MAX_MESSAGE_SIZE>();
        let (message, read): (Message, usize) = bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        if read != bytes.len() {
            return Err(CodecError::TrailingBytes(bytes.len() - read));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{KeyManager, SoftwareKeyManager};

    #[test]
    fn test_handshake_init_wire_format() {
        let keys = SoftwareKeyManager::generate();
        let message = Message::HandshakeInit {
            public_key: keys.public_key().clone(),
            signature: keys.self_signature().clone(),
            is_response: true,
        };

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "handshake_response");
    }

    #[test]
    fn test_sync_wire_format() {
        let alice = SoftwareKeyManager::generate();
        let bob = SoftwareKeyManager::generate();
        let related = HashSet::from([
            RelatedData::PublicKey(bob.public_key().clone()),
            RelatedData::Signature(bob.self_signature().clone()),
            RelatedData::Signature(alice.create_signature(bob.public_key(), None).unwrap()),
        ]);
        let message = Message::Sync {
            related_data: related,
        };

        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode(&[0xff; 4]), Err(CodecError::Decode(_))));
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let message = Message::SyncRequest {
            trusted_subjects: HashSet::new(),
        };
        let mut bytes = message.encode().unwrap();
        bytes.push(0);

        assert_eq!(Message::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }
}
