// protocol/mod.rs - Handshake and Sync Protocols

//! Peer-to-peer protocols built on the trust graph.
//!
//! - `HandshakeCache` - per-peer handshake state machine with timeout
//! - `Message` - wire messages and their bincode codec
//! - `apply_related_data` - merging gossiped certificate material
//! - `TrustProtocol` - drives handshakes and sync rounds over a [`Transport`]
//!
//! A handshake exchanges keys, asks a [`VerificationOracle`] whether the
//! remote key belongs to the intended peer, then swaps certificates. A
//! completed handshake triggers a sync round, in which each side sends the
//! subjects it trusts and receives the certificates and keys it is missing.
//!
//! [`Transport`]: crate::network::Transport

mod error;
mod handshake;
mod messages;
mod service;
mod sync;

pub use error::ProtocolError;
pub use handshake::{HandshakeCache, HandshakeEntry, HandshakeState, Role};
pub use messages::{CodecError, Message, MAX_MESSAGE_SIZE};
pub use service::{KeyVerification, ProtocolEvent, TrustProtocol, VerificationOracle};
pub use sync::{apply_related_data, SyncSummary};
