// lib.rs - Peer Trust
//
// Certificate-based web of trust for pairwise device authentication
// over intermittent peer-to-peer links.

#![doc = include_str!("../README.md")]

pub mod config;
pub mod network;
pub mod observability;
pub mod protocol;
pub mod trust;

// Re-export commonly used types
pub use config::{LogConfig, NodeConfig, TrustConfig};

pub use network::{MemoryNetwork, MemoryTransport, NetworkEvent, Transport, TransportError};

pub use protocol::{
    apply_related_data, HandshakeState, KeyVerification, Message, ProtocolError, ProtocolEvent,
    SyncSummary, TrustProtocol, VerificationOracle,
};

pub use trust::{
    AppDetails, Fingerprint, IntegrityError, KeyId, KeyManager, MetaInformation, PublicKey,
    RelatedData, Signature, SoftwareKeyManager, StoreError, SubKeySignature, TrustInfo,
    TrustLevel, TrustManager, TrustStore,
};

pub use observability::{init_metrics, init_tracing, MetricsConfig, MetricsHandle, TracingConfig, TracingFormat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{NodeConfig, TrustConfig};
    pub use crate::network::{MemoryNetwork, Transport};
    pub use crate::protocol::{KeyVerification, ProtocolError, ProtocolEvent, TrustProtocol, VerificationOracle};
    pub use crate::trust::{
        AppDetails, Fingerprint, KeyManager, SoftwareKeyManager, TrustInfo, TrustLevel, TrustManager,
        TrustStore,
    };
}
