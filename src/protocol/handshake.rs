// protocol/handshake.rs - Handshake State Machine and Session Cache

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::error::ProtocolError;
use crate::trust::{Fingerprint, PublicKey, Signature};

/// Handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet
    Idle,
    /// Our init went out, waiting for the peer's response
    InitSent,
    /// The peer's init arrived
    InitReceived,
    /// Our response went out
    ResponseSent,
    /// Both keys exchanged, waiting for the verification oracle
    AwaitingVerification,
    /// Our certificate went out, waiting for the peer's
    SignatureSent,
    /// Both certificates exchanged
    Complete,
    /// Rejected, failed or timed out
    Aborted,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::InitSent => "init_sent",
            HandshakeState::InitReceived => "init_received",
            HandshakeState::ResponseSent => "response_sent",
            HandshakeState::AwaitingVerification => "awaiting_verification",
            HandshakeState::SignatureSent => "signature_sent",
            HandshakeState::Complete => "complete",
            HandshakeState::Aborted => "aborted",
        }
    }

    /// Validate state transition
    fn validate_transition(self, next: HandshakeState) -> Result<HandshakeState, ProtocolError> {
        use HandshakeState::*;

        match (self, next) {
            (Idle, InitSent) | (Idle, InitReceived) => Ok(next),
            (InitReceived, ResponseSent) => Ok(next),
            (InitSent, AwaitingVerification) | (ResponseSent, AwaitingVerification) => Ok(next),
            (AwaitingVerification, SignatureSent) => Ok(next),
            (SignatureSent, Complete) => Ok(next),
            (Complete, _) | (Aborted, _) => Err(ProtocolError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            }),
            (_, Aborted) => Ok(next),
            (from, to) => Err(ProtocolError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            }),
        }
    }
}

/// Which side opened the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

/// In-flight handshake with one peer
#[derive(Debug, Clone)]
pub struct HandshakeEntry {
    pub state: HandshakeState,
    pub role: Role,

    /// The peer's key and self-signature
    pub remote_init: Option<(PublicKey, Signature)>,

    /// Our certificate on the peer
    pub my_signature: Option<Signature>,

    /// The peer's certificate on us
    pub remote_signature: Option<Signature>,

    pub started_at: Instant,
}

impl HandshakeEntry {
    pub fn new(role: Role) -> Self {
        Self {
            state: HandshakeState::Idle,
            role,
            remote_init: None,
            my_signature: None,
            remote_signature: None,
            started_at: Instant::now(),
        }
    }

    pub fn advance(&mut self, next: HandshakeState) -> Result<(), ProtocolError> {
        self.state = self.state.validate_transition(next)?;
        Ok(())
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.started_at.elapsed() >= timeout
    }

    /// Both certificates and the peer's key are present
    pub fn is_complete(&self) -> bool {
        self.remote_init.is_some() && self.my_signature.is_some() && self.remote_signature.is_some()
    }
}

/// Handshakes in progress, keyed by peer, discarded after a timeout
pub struct HandshakeCache {
    entries: DashMap<Fingerprint, HandshakeEntry>,
    timeout: Duration,
}

impl HandshakeCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new handshake; fails if an unexpired one exists
    pub fn begin(&self, peer: &Fingerprint, role: Role) -> Result<(), ProtocolError> {
        self.evict_expired();

        match self.entries.entry(peer.clone()) {
            Entry::Occupied(entry) if !entry.get().is_expired(self.timeout) => {
                Err(ProtocolError::HandshakeInProgress(peer.clone()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(HandshakeEntry::new(role));
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(HandshakeEntry::new(role));
                Ok(())
            }
        }
    }

    /// Run `f` on the peer's live entry
    pub fn update<R>(
        &self,
        peer: &Fingerprint,
        f: impl FnOnce(&mut HandshakeEntry) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        let mut entry = self
            .entries
            .get_mut(peer)
            .filter(|e| !e.is_expired(self.timeout))
            .ok_or_else(|| ProtocolError::NoHandshake(peer.clone()))?;
        f(entry.value_mut())
    }

    pub fn state(&self, peer: &Fingerprint) -> Option<HandshakeState> {
        self.entries
            .get(peer)
            .filter(|e| !e.is_expired(self.timeout))
            .map(|e| e.state)
    }

    pub fn contains(&self, peer: &Fingerprint) -> bool {
        self.state(peer).is_some()
    }

    /// Remove and return the entry if both certificates are in
    ///
    /// Only one caller can win, so completion runs exactly once.
    pub fn take_if_complete(&self, peer: &Fingerprint) -> Option<HandshakeEntry> {
        self.entries
            .remove_if(peer, |_, e| e.is_complete())
            .map(|(_, entry)| entry)
    }

    pub fn remove(&self, peer: &Fingerprint) -> Option<HandshakeEntry> {
        self.entries.remove(peer).map(|(_, entry)| entry)
    }

    /// Remove the peer's entry and move it to `Aborted`
    ///
    /// Expired entries are returned too. A completed entry keeps its state.
    pub fn abort(&self, peer: &Fingerprint) -> Option<HandshakeEntry> {
        let (_, mut entry) = self.entries.remove(peer)?;
        let from = entry.state.as_str();
        match entry.advance(HandshakeState::Aborted) {
            Ok(()) => debug!(peer = %peer.short(), from, "Handshake aborted"),
            Err(e) => debug!(peer = %peer.short(), error = %e, "Handshake already finished"),
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        let timeout = self.timeout;
        self.entries.retain(|peer, entry| {
            let keep = !entry.is_expired(timeout);
            if !keep {
                debug!(peer = %peer.short(), state = entry.state.as_str(), "Handshake timed out");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{KeyManager, SoftwareKeyManager};

    #[test]
    fn test_initiator_path() {
        let mut entry = HandshakeEntry::new(Role::Initiator);
        entry.advance(HandshakeState::InitSent).unwrap();
        entry.advance(HandshakeState::AwaitingVerification).unwrap();
        entry.advance(HandshakeState::SignatureSent).unwrap();
        entry.advance(HandshakeState::Complete).unwrap();
        assert_eq!(entry.state, HandshakeState::Complete);
    }

    #[test]
    fn test_responder_path() {
        let mut entry = HandshakeEntry::new(Role::Responder);
        entry.advance(HandshakeState::InitReceived).unwrap();
        entry.advance(HandshakeState::ResponseSent).unwrap();
        entry.advance(HandshakeState::AwaitingVerification).unwrap();
        entry.advance(HandshakeState::SignatureSent).unwrap();
        assert_eq!(entry.state, HandshakeState::SignatureSent);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut entry = HandshakeEntry::new(Role::Initiator);
        assert!(matches!(
            entry.advance(HandshakeState::SignatureSent),
            Err(ProtocolError::InvalidTransition {
                from: "idle",
                to: "signature_sent"
            })
        ));

        entry.advance(HandshakeState::InitSent).unwrap();
        assert!(entry.advance(HandshakeState::ResponseSent).is_err());

        entry.advance(HandshakeState::Aborted).unwrap();
        assert!(entry.advance(HandshakeState::InitSent).is_err());
        assert!(entry.advance(HandshakeState::Aborted).is_err());
    }

    #[test]
    fn test_second_begin_rejected() {
        let cache = HandshakeCache::new(Duration::from_secs(60));
        let peer = SoftwareKeyManager::generate().fingerprint();

        cache.begin(&peer, Role::Initiator).unwrap();
        assert!(matches!(
            cache.begin(&peer, Role::Responder),
            Err(ProtocolError::HandshakeInProgress(_))
        ));
        assert_eq!(cache.state(&peer), Some(HandshakeState::Idle));
    }

    #[test]
    fn test_expired_entries_evicted() {
        let cache = HandshakeCache::new(Duration::ZERO);
        let peer = SoftwareKeyManager::generate().fingerprint();
        let other = SoftwareKeyManager::generate().fingerprint();

        cache.begin(&peer, Role::Initiator).unwrap();
        assert!(!cache.contains(&peer));
        assert!(matches!(
            cache.update(&peer, |_| Ok(())),
            Err(ProtocolError::NoHandshake(_))
        ));

        // a fresh begin replaces the stale entry and sweeps the rest
        cache.begin(&peer, Role::Responder).unwrap();
        cache.begin(&other, Role::Initiator).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_take_if_complete_once() {
        let cache = HandshakeCache::new(Duration::from_secs(60));
        let me = SoftwareKeyManager::generate();
        let peer = SoftwareKeyManager::generate();
        let fp = peer.fingerprint();

        cache.begin(&fp, Role::Initiator).unwrap();
        cache
            .update(&fp, |e| {
                e.remote_init = Some((peer.public_key().clone(), peer.self_signature().clone()));
                e.my_signature = Some(me.create_signature(peer.public_key(), None)?);
                Ok(())
            })
            .unwrap();
        assert!(cache.take_if_complete(&fp).is_none());

        cache
            .update(&fp, |e| {
                e.remote_signature = Some(peer.create_signature(me.public_key(), None)?);
                Ok(())
            })
            .unwrap();
        assert!(cache.take_if_complete(&fp).is_some());
        assert!(cache.take_if_complete(&fp).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_abort_moves_entry_to_aborted() {
        let cache = HandshakeCache::new(Duration::from_secs(60));
        let peer = SoftwareKeyManager::generate().fingerprint();

        cache.begin(&peer, Role::Responder).unwrap();
        cache.update(&peer, |e| e.advance(HandshakeState::InitReceived)).unwrap();

        let entry = cache.abort(&peer).unwrap();
        assert_eq!(entry.state, HandshakeState::Aborted);
        assert_eq!(entry.role, Role::Responder);
        assert!(!cache.contains(&peer));
        assert!(cache.abort(&peer).is_none());

        // the peer can start over after an abort
        cache.begin(&peer, Role::Initiator).unwrap();
        assert_eq!(cache.state(&peer), Some(HandshakeState::Idle));
    }

    #[test]
    fn test_abort_returns_expired_entry() {
        let cache = HandshakeCache::new(Duration::ZERO);
        let peer = SoftwareKeyManager::generate().fingerprint();

        cache.begin(&peer, Role::Initiator).unwrap();
        assert!(!cache.contains(&peer));
        assert_eq!(cache.abort(&peer).map(|e| e.state), Some(HandshakeState::Aborted));
        assert!(cache.is_empty());
    }
}
