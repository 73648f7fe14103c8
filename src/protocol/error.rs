// protocol/error.rs - Protocol Errors

use crate::network::TransportError;
use crate::trust::{Fingerprint, IntegrityError, KeyError, StoreError};

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Handshake with {} already in progress", .0.short())]
    HandshakeInProgress(Fingerprint),

    #[error("No handshake in progress with {}", .0.short())]
    NoHandshake(Fingerprint),

    #[error("Invalid handshake transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Key verification failed: {0}")]
    Verification(String),

    #[error("Key manager error: {0}")]
    Keys(#[from] KeyError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Repository error: {0}")]
    Store(#[from] StoreError),

    #[error("Trust state inconsistent: {0}")]
    Inconsistent(String),
}
