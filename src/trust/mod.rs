// trust/mod.rs - Web of Trust Module

//! Certificate-based web of trust.
//!
//! - **Identity**: public keys, fingerprints and sub-key IDs
//! - **Signature**: certificates between subjects and on sub-keys
//! - **Keys**: the owner's master key behind the [`KeyManager`] seam
//! - **Store**: write-once, file-backed certificate repository
//! - **Manager**: the trust graph and its validity computation
//!
//! # Example
//!
//! ```no_run
//! use peer_trust::config::TrustConfig;
//! use peer_trust::trust::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let owner = SoftwareKeyManager::generate();
//! let store = TrustStore::open("/tmp/trust", true)?;
//! let mut manager = TrustManager::open(store, &owner, TrustConfig::default())?;
//!
//! // Certify a peer we verified out-of-band
//! let peer = SoftwareKeyManager::generate();
//! manager.add_subject(peer.public_key().clone(), peer.self_signature().clone())?;
//! manager.add_signature(owner.create_signature(peer.public_key(), Some("laptop".into()))?)?;
//! manager.refresh_validity();
//!
//! assert_eq!(manager.trust_info(&peer.fingerprint()).level, TrustLevel::Trusted);
//! # Ok(())
//! # }
//! ```

mod identity;
mod info;
mod keys;
mod manager;
mod signature;
mod store;

pub use identity::{Fingerprint, IntegrityError, KeyId, PublicKey};

pub use info::{MetaInformation, TrustInfo, TrustLevel};

pub use keys::{ExportedKey, KeyError, KeyManager, SoftwareKeyManager};

pub use manager::{RefreshOutcome, RelatedData, Subject, TrustManager};

pub use signature::{AppDetails, Signature, SubKeyEntry, SubKeySignature};

pub use store::{StoreError, TrustStore};
