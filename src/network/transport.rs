// network/transport.rs - Transport Abstraction

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

use crate::protocol::{CodecError, Message};
use crate::trust::Fingerprint;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer unreachable: {}", .0.short())]
    Unreachable(Fingerprint),

    #[error("Connection to {} closed", .0.short())]
    Closed(Fingerprint),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Events a transport delivers to the protocol
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A message arrived from a peer
    MessageReceived { from: Fingerprint, message: Message },

    /// The set of reachable neighbours changed
    PeersChanged(HashSet<Fingerprint>),
}

/// Fingerprint-addressed message delivery
///
/// Implementations deliver inbound traffic as [`NetworkEvent`]s on a channel
/// owned by whoever runs the protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to one peer
    async fn send(&self, peer: &Fingerprint, message: Message) -> Result<(), TransportError>;

    /// Send a message to every reachable peer
    async fn broadcast(&self, message: Message) -> Result<(), TransportError>;
}
