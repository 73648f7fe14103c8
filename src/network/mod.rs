// network/mod.rs - Network Layer

//! Fingerprint-addressed transport used by the trust protocol.
//!
//! - `Transport` - the send/broadcast seam the protocol talks to
//! - `MemoryNetwork` - in-process hub for tests and embedding

mod memory;
mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use transport::{NetworkEvent, Transport, TransportError};
