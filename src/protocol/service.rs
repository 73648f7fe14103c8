// protocol/service.rs - Handshake and Sync Orchestration

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::error::ProtocolError;
use super::handshake::{HandshakeCache, HandshakeState, Role};
use super::messages::Message;
use super::sync::{apply_related_data, SyncSummary};
use crate::network::{NetworkEvent, Transport};
use crate::observability::{
    record_handshake_finished, record_handshake_started, record_message_received,
    record_message_sent,
};
use crate::trust::{
    AppDetails, Fingerprint, IntegrityError, KeyId, KeyManager, MetaInformation, PublicKey,
    RelatedData, Signature, TrustInfo, TrustLevel, TrustManager,
};

const EVENT_CAPACITY: usize = 256;

/// Outcome of out-of-band key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVerification {
    pub matched: bool,

    /// Label for the peer, recorded in our certificate on it
    pub alias: Option<String>,
}

impl KeyVerification {
    pub fn accept(alias: Option<String>) -> Self {
        Self {
            matched: true,
            alias,
        }
    }

    pub fn reject() -> Self {
        Self {
            matched: false,
            alias: None,
        }
    }
}

/// Out-of-band check that a remote key belongs to the intended peer
///
/// Typically a prompt asking the user to compare fingerprints or scan a code.
#[async_trait]
pub trait VerificationOracle: Send + Sync {
    async fn verify(
        &self,
        local: &PublicKey,
        remote: &PublicKey,
        remote_signature: &Signature,
    ) -> Result<KeyVerification, ProtocolError>;
}

/// Notifications published by the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The handshake ended; `accepted` is false when the oracle said no
    HandshakeFinished { peer: Fingerprint, accepted: bool },

    /// The handshake was aborted by an error
    HandshakeFailed { peer: Fingerprint, reason: String },

    SyncCompleted { peer: Fingerprint, summary: SyncSummary },

    SyncFailed { peer: Fingerprint, reason: String },
}

/// Runs handshakes and sync rounds on top of a [`TrustManager`]
pub struct TrustProtocol {
    trust: Arc<Mutex<TrustManager>>,
    keys: Arc<dyn KeyManager>,
    transport: Arc<dyn Transport>,
    oracle: Arc<dyn VerificationOracle>,
    handshakes: HandshakeCache,
    events: broadcast::Sender<ProtocolEvent>,
}

impl TrustProtocol {
    pub fn new(
        trust: Arc<Mutex<TrustManager>>,
        keys: Arc<dyn KeyManager>,
        transport: Arc<dyn Transport>,
        oracle: Arc<dyn VerificationOracle>,
    ) -> Arc<Self> {
        let timeout = trust.lock().config().handshake_timeout();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            trust,
            keys,
            transport,
            oracle,
            handshakes: HandshakeCache::new(timeout),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    pub fn trust(&self) -> &Arc<Mutex<TrustManager>> {
        &self.trust
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keys.fingerprint()
    }

    pub fn is_known(&self, fingerprint: &Fingerprint) -> TrustInfo {
        self.trust.lock().trust_info(fingerprint)
    }

    pub fn is_handshaking(&self, fingerprint: &Fingerprint) -> bool {
        self.handshakes.contains(fingerprint)
    }

    pub fn meta_information(&self, fingerprint: &Fingerprint) -> Option<MetaInformation> {
        self.trust.lock().meta_information(fingerprint)
    }

    pub fn available_subkeys(
        &self,
        fingerprint: &Fingerprint,
        app: &AppDetails,
        tag: Option<&str>,
    ) -> Option<HashSet<KeyId>> {
        self.trust.lock().available_subkeys(fingerprint, app, tag)
    }

    pub fn subkey_bytes(&self, fingerprint: &Fingerprint, key_id: &KeyId, app: &AppDetails) -> Option<Vec<u8>> {
        self.trust
            .lock()
            .subkey_bytes(fingerprint, key_id, app)
            .map(<[u8]>::to_vec)
    }

    /// Certify one of our own sub-keys for an application
    pub fn register_subkey(
        &self,
        subkey: &[u8],
        app: &AppDetails,
        bind_to_app: bool,
        tag: Option<String>,
    ) -> Result<bool, ProtocolError> {
        let signature = self
            .keys
            .create_subkey_signature(subkey, app, bind_to_app, tag)?;
        Ok(self.trust.lock().add_subkey(subkey.to_vec(), signature)?)
    }

    /// Consume transport events until the channel closes
    pub async fn serve(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::MessageReceived { from, message } => self.on_message(from, message).await,
                NetworkEvent::PeersChanged(peers) => self.on_peers_changed(&peers).await,
            }
        }
        debug!(node = %self.fingerprint().short(), "Event stream closed");
    }

    // Handshake

    /// Start a handshake with `peer`
    ///
    /// Completes immediately if the peer is already trusted. Fails if a
    /// handshake with the peer is still running.
    pub async fn perform_handshake(&self, peer: &Fingerprint) -> Result<(), ProtocolError> {
        if peer == &self.fingerprint() {
            return Err(ProtocolError::UnexpectedMessage("handshake with ourselves".into()));
        }

        self.handshakes.begin(peer, Role::Initiator)?;
        record_handshake_started(Role::Initiator.as_str());

        if self.is_known(peer).level >= TrustLevel::Trusted {
            self.finish_trusted(peer);
            return Ok(());
        }

        if let Err(e) = self.send_init(peer).await {
            self.fail_handshake(peer, &e);
            return Err(e);
        }
        info!(peer = %peer.short(), "Handshake started");
        Ok(())
    }

    async fn send_init(&self, peer: &Fingerprint) -> Result<(), ProtocolError> {
        self.handshakes
            .update(peer, |e| e.advance(HandshakeState::InitSent))?;
        self.send(peer, self.init_message(false)).await
    }

    fn init_message(&self, is_response: bool) -> Message {
        Message::HandshakeInit {
            public_key: self.keys.public_key().clone(),
            signature: self.keys.self_signature().clone(),
            is_response,
        }
    }

    /// Handle one inbound message
    pub async fn on_message(self: &Arc<Self>, from: Fingerprint, message: Message) {
        record_message_received(message.kind());
        debug!(peer = %from.short(), kind = message.kind(), "Received message");

        match message {
            Message::HandshakeInit {
                public_key,
                signature,
                is_response,
            } => {
                if let Err(e) = self.on_handshake_init(&from, public_key, signature, is_response).await {
                    self.handshake_error(&from, e);
                }
            }
            Message::HandshakeSignature { signature } => {
                if let Err(e) = self.on_handshake_signature(&from, signature).await {
                    self.handshake_error(&from, e);
                }
            }
            Message::SyncRequest { trusted_subjects } => {
                if let Err(e) = self.on_sync_request(&from, trusted_subjects).await {
                    warn!(peer = %from.short(), error = %e, "Failed to answer sync request");
                }
            }
            Message::Sync { related_data } => self.on_sync(&from, related_data),
        }
    }

    async fn on_handshake_init(
        self: &Arc<Self>,
        from: &Fingerprint,
        public_key: PublicKey,
        signature: Signature,
        is_response: bool,
    ) -> Result<(), ProtocolError> {
        let fingerprint = public_key.fingerprint();
        if &fingerprint != from {
            return Err(IntegrityError::FingerprintMismatch {
                expected: from.clone(),
                actual: fingerprint,
            }
            .into());
        }
        signature.verify_self(&public_key)?;

        if is_response {
            self.accept_remote_init(from, public_key, signature)?;
            self.spawn_verification(from.clone());
            return Ok(());
        }

        match self.handshakes.begin(from, Role::Responder) {
            Ok(()) => {}
            Err(ProtocolError::HandshakeInProgress(_))
                if self.handshakes.state(from) == Some(HandshakeState::InitSent) =>
            {
                // both sides opened at once: their init doubles as the response
                debug!(peer = %from.short(), "Crossed handshake inits");
                self.accept_remote_init(from, public_key, signature)?;
                self.spawn_verification(from.clone());
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        record_handshake_started(Role::Responder.as_str());

        if self.is_known(from).level >= TrustLevel::Trusted {
            self.finish_trusted(from);
            return Ok(());
        }

        self.handshakes.update(from, |e| {
            e.advance(HandshakeState::InitReceived)?;
            e.remote_init = Some((public_key, signature));
            e.advance(HandshakeState::ResponseSent)
        })?;
        self.send(from, self.init_message(true)).await?;
        self.handshakes
            .update(from, |e| e.advance(HandshakeState::AwaitingVerification))?;

        self.spawn_verification(from.clone());
        Ok(())
    }

    fn accept_remote_init(
        &self,
        from: &Fingerprint,
        public_key: PublicKey,
        signature: Signature,
    ) -> Result<(), ProtocolError> {
        self.handshakes.update(from, |e| {
            e.advance(HandshakeState::AwaitingVerification)?;
            e.remote_init = Some((public_key, signature));
            Ok(())
        })
    }

    /// Run the oracle off the message loop
    fn spawn_verification(self: &Arc<Self>, peer: Fingerprint) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.verify_and_sign(&peer).await {
                this.handshake_error(&peer, e);
            }
        });
    }

    async fn verify_and_sign(&self, peer: &Fingerprint) -> Result<(), ProtocolError> {
        let (remote_key, remote_self_signature) = self.handshakes.update(peer, |e| {
            e.remote_init
                .clone()
                .ok_or_else(|| ProtocolError::UnexpectedMessage("verification before init".into()))
        })?;

        let verification = self
            .oracle
            .verify(self.keys.public_key(), &remote_key, &remote_self_signature)
            .await?;

        if !verification.matched {
            let elapsed = self.abort(peer);
            info!(peer = %peer.short(), "Key verification rejected");
            record_handshake_finished("rejected", elapsed);
            self.emit(ProtocolEvent::HandshakeFinished {
                peer: peer.clone(),
                accepted: false,
            });
            return Ok(());
        }

        let signature = self
            .keys
            .create_signature(&remote_key, verification.alias)?;
        self.handshakes.update(peer, |e| {
            e.my_signature = Some(signature.clone());
            e.advance(HandshakeState::SignatureSent)
        })?;
        self.send(peer, Message::HandshakeSignature { signature }).await?;

        self.try_complete(peer).await
    }

    async fn on_handshake_signature(&self, from: &Fingerprint, signature: Signature) -> Result<(), ProtocolError> {
        let local_key = self.keys.public_key();
        self.handshakes.update(from, |e| {
            let (remote_key, _) = e
                .remote_init
                .as_ref()
                .ok_or_else(|| ProtocolError::UnexpectedMessage("signature before init".into()))?;
            signature.verify(remote_key, local_key)?;
            e.remote_signature = Some(signature);
            Ok(())
        })?;

        self.try_complete(from).await
    }

    /// Commit the relationship once both certificates are in
    async fn try_complete(&self, peer: &Fingerprint) -> Result<(), ProtocolError> {
        let Some(mut entry) = self.handshakes.take_if_complete(peer) else {
            return Ok(());
        };
        entry.advance(HandshakeState::Complete)?;

        let (Some((remote_key, remote_self_signature)), Some(mine), Some(theirs)) =
            (entry.remote_init, entry.my_signature, entry.remote_signature)
        else {
            return Err(ProtocolError::Inconsistent("completed handshake missing data".into()));
        };

        if let Err(e) = self.commit(peer, remote_key, remote_self_signature, mine, theirs) {
            record_handshake_finished("failed", entry.started_at.elapsed());
            self.emit(ProtocolEvent::HandshakeFailed {
                peer: peer.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        info!(peer = %peer.short(), "Handshake complete");
        record_handshake_finished("accepted", entry.started_at.elapsed());
        self.emit(ProtocolEvent::HandshakeFinished {
            peer: peer.clone(),
            accepted: true,
        });

        if let Err(e) = self.perform_sync(peer).await {
            warn!(peer = %peer.short(), error = %e, "Post-handshake sync failed");
        }
        Ok(())
    }

    fn commit(
        &self,
        peer: &Fingerprint,
        remote_key: PublicKey,
        remote_self_signature: Signature,
        mine: Signature,
        theirs: Signature,
    ) -> Result<(), ProtocolError> {
        let mut trust = self.trust.lock();

        if !trust.add_subject(remote_key, remote_self_signature)? && !trust.contains(peer) {
            return Err(ProtocolError::Inconsistent(format!(
                "could not add subject {}",
                peer.short()
            )));
        }
        trust.add_signature(mine)?;
        trust.add_signature(theirs)?;

        if !trust.check_validity(peer) {
            return Err(ProtocolError::Inconsistent(format!(
                "subject {} invalid after handshake",
                peer.short()
            )));
        }
        trust.refresh_validity();
        Ok(())
    }

    fn finish_trusted(&self, peer: &Fingerprint) {
        let elapsed = self.elapsed(peer);
        self.handshakes.remove(peer);
        debug!(peer = %peer.short(), "Peer already trusted");
        record_handshake_finished("accepted", elapsed);
        self.emit(ProtocolEvent::HandshakeFinished {
            peer: peer.clone(),
            accepted: true,
        });
    }

    fn handshake_error(&self, peer: &Fingerprint, error: ProtocolError) {
        match error {
            // someone else's handshake with this peer is still running
            ProtocolError::HandshakeInProgress(_) => {
                warn!(peer = %peer.short(), "Ignoring handshake init, one is already running");
            }
            ProtocolError::NoHandshake(_) => {
                debug!(peer = %peer.short(), "Ignoring message for unknown or expired handshake");
            }
            e => self.fail_handshake(peer, &e),
        }
    }

    fn fail_handshake(&self, peer: &Fingerprint, error: &ProtocolError) {
        let elapsed = self.abort(peer);
        warn!(peer = %peer.short(), error = %error, "Handshake aborted");
        record_handshake_finished("failed", elapsed);
        self.emit(ProtocolEvent::HandshakeFailed {
            peer: peer.clone(),
            reason: error.to_string(),
        });
    }

    /// Drop the peer's handshake as aborted; returns how long it ran
    fn abort(&self, peer: &Fingerprint) -> Duration {
        self.handshakes
            .abort(peer)
            .map(|e| e.started_at.elapsed())
            .unwrap_or_default()
    }

    fn elapsed(&self, peer: &Fingerprint) -> Duration {
        self.handshakes
            .update(peer, |e| Ok(e.started_at.elapsed()))
            .unwrap_or_default()
    }

    // Sync

    /// Ask `peer` for certificate material on everything we trust
    pub async fn perform_sync(&self, peer: &Fingerprint) -> Result<(), ProtocolError> {
        let trusted_subjects = self.trust.lock().subjects_with_trust_level(TrustLevel::Known);

        if let Err(e) = self.send(peer, Message::SyncRequest { trusted_subjects }).await {
            self.emit(ProtocolEvent::SyncFailed {
                peer: peer.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Sync with every neighbour
    pub async fn on_peers_changed(&self, neighbors: &HashSet<Fingerprint>) {
        for peer in neighbors {
            if let Err(e) = self.perform_sync(peer).await {
                warn!(peer = %peer.short(), error = %e, "Sync request failed");
            }
        }
    }

    async fn on_sync_request(
        &self,
        from: &Fingerprint,
        trusted_subjects: HashSet<Fingerprint>,
    ) -> Result<(), ProtocolError> {
        let related_data = self.trust.lock().related_data(&trusted_subjects);
        if related_data.is_empty() {
            debug!(peer = %from.short(), "Nothing to sync");
            return Ok(());
        }

        debug!(peer = %from.short(), items = related_data.len(), "Answering sync request");
        self.send(from, Message::Sync { related_data }).await
    }

    fn on_sync(&self, from: &Fingerprint, related_data: HashSet<RelatedData>) {
        let summary = {
            let mut trust = self.trust.lock();
            apply_related_data(&mut trust, from, related_data)
        };

        info!(
            peer = %from.short(),
            added = summary.added(),
            rejected = summary.rejected,
            "Sync applied"
        );
        self.emit(ProtocolEvent::SyncCompleted {
            peer: from.clone(),
            summary,
        });
    }

    async fn send(&self, peer: &Fingerprint, message: Message) -> Result<(), ProtocolError> {
        let kind = message.kind();
        self.transport.send(peer, message).await?;
        record_message_sent(kind);
        Ok(())
    }

    fn emit(&self, event: ProtocolEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustConfig;
    use crate::network::{MemoryNetwork, TransportError};
    use crate::trust::{SoftwareKeyManager, TrustStore};
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Oracle answering every prompt the same way
    struct FixedOracle(KeyVerification);

    #[async_trait]
    impl VerificationOracle for FixedOracle {
        async fn verify(
            &self,
            _local: &PublicKey,
            _remote: &PublicKey,
            _remote_signature: &Signature,
        ) -> Result<KeyVerification, ProtocolError> {
            Ok(self.0.clone())
        }
    }

    /// Oracle that never answers
    struct SilentOracle;

    #[async_trait]
    impl VerificationOracle for SilentOracle {
        async fn verify(
            &self,
            _local: &PublicKey,
            _remote: &PublicKey,
            _remote_signature: &Signature,
        ) -> Result<KeyVerification, ProtocolError> {
            std::future::pending().await
        }
    }

    /// Transport that drops everything
    struct DeadTransport;

    #[async_trait]
    impl Transport for DeadTransport {
        async fn send(&self, peer: &Fingerprint, _message: Message) -> Result<(), TransportError> {
            Err(TransportError::Unreachable(peer.clone()))
        }

        async fn broadcast(&self, _message: Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct Node {
        _dir: TempDir,
        keys: Arc<SoftwareKeyManager>,
        protocol: Arc<TrustProtocol>,
        events: broadcast::Receiver<ProtocolEvent>,
    }

    impl Node {
        fn fp(&self) -> Fingerprint {
            self.keys.fingerprint()
        }

        async fn next_event(&mut self) -> ProtocolEvent {
            timeout(WAIT, self.events.recv()).await.unwrap().unwrap()
        }

        /// Skip events until one matches
        async fn wait_for(&mut self, pred: impl Fn(&ProtocolEvent) -> bool) -> ProtocolEvent {
            loop {
                let event = self.next_event().await;
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    fn spawn_node(
        network: &MemoryNetwork,
        oracle: Arc<dyn VerificationOracle>,
        config: TrustConfig,
    ) -> Node {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(SoftwareKeyManager::generate());
        let store = TrustStore::open(dir.path(), true).unwrap();
        let trust = TrustManager::open(store, keys.as_ref(), config).unwrap();

        let (transport, inbox) = network.join(keys.fingerprint());
        let protocol = TrustProtocol::new(
            Arc::new(Mutex::new(trust)),
            keys.clone(),
            Arc::new(transport),
            oracle,
        );
        tokio::spawn(Arc::clone(&protocol).serve(inbox));

        let events = protocol.subscribe();
        Node {
            _dir: dir,
            keys,
            protocol,
            events,
        }
    }

    fn accepting(alias: &str) -> Arc<dyn VerificationOracle> {
        Arc::new(FixedOracle(KeyVerification::accept(Some(alias.into()))))
    }

    fn finished(event: &ProtocolEvent) -> bool {
        matches!(
            event,
            ProtocolEvent::HandshakeFinished { .. } | ProtocolEvent::HandshakeFailed { .. }
        )
    }

    #[tokio::test]
    async fn test_handshake_mutually_certifies() {
        let network = MemoryNetwork::new();
        let mut alice = spawn_node(&network, accepting("bob"), TrustConfig::default());
        let mut bob = spawn_node(&network, accepting("alice"), TrustConfig::default());

        alice.protocol.perform_handshake(&bob.fp()).await.unwrap();

        assert_eq!(
            alice.wait_for(finished).await,
            ProtocolEvent::HandshakeFinished {
                peer: bob.fp(),
                accepted: true
            }
        );
        assert_eq!(
            bob.wait_for(finished).await,
            ProtocolEvent::HandshakeFinished {
                peer: alice.fp(),
                accepted: true
            }
        );

        assert_eq!(
            alice.protocol.is_known(&bob.fp()),
            TrustInfo::new(TrustLevel::Trusted, 1)
        );
        assert_eq!(
            bob.protocol.is_known(&alice.fp()),
            TrustInfo::new(TrustLevel::Trusted, 1)
        );
        assert_eq!(
            alice.protocol.meta_information(&bob.fp()).unwrap().aliases,
            vec!["bob".to_string()]
        );
        assert!(!alice.protocol.is_handshaking(&bob.fp()));
    }

    #[tokio::test]
    async fn test_handshake_rejected_by_oracle() {
        let network = MemoryNetwork::new();
        let mut alice = spawn_node(&network, accepting("bob"), TrustConfig::default());
        let mut bob = spawn_node(
            &network,
            Arc::new(FixedOracle(KeyVerification::reject())),
            TrustConfig::default(),
        );

        alice.protocol.perform_handshake(&bob.fp()).await.unwrap();

        assert_eq!(
            bob.wait_for(finished).await,
            ProtocolEvent::HandshakeFinished {
                peer: alice.fp(),
                accepted: false
            }
        );

        // alice signs and waits; bob never answers
        assert!(timeout(Duration::from_millis(200), alice.wait_for(finished))
            .await
            .is_err());
        assert_eq!(alice.protocol.is_known(&bob.fp()), TrustInfo::UNKNOWN);
        assert_eq!(bob.protocol.is_known(&alice.fp()), TrustInfo::UNKNOWN);
        assert!(!bob.protocol.is_handshaking(&alice.fp()));
    }

    #[tokio::test]
    async fn test_duplicate_handshake_rejected() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, Arc::new(SilentOracle), TrustConfig::default());
        let bob = spawn_node(&network, Arc::new(SilentOracle), TrustConfig::default());

        alice.protocol.perform_handshake(&bob.fp()).await.unwrap();
        assert!(matches!(
            alice.protocol.perform_handshake(&bob.fp()).await,
            Err(ProtocolError::HandshakeInProgress(_))
        ));
        assert!(alice.protocol.is_handshaking(&bob.fp()));
    }

    #[tokio::test]
    async fn test_handshake_with_trusted_peer_short_circuits() {
        let network = MemoryNetwork::new();
        let mut alice = spawn_node(&network, accepting("bob"), TrustConfig::default());
        let mut bob = spawn_node(&network, accepting("alice"), TrustConfig::default());

        alice.protocol.perform_handshake(&bob.fp()).await.unwrap();
        alice.wait_for(finished).await;
        bob.wait_for(finished).await;

        alice.protocol.perform_handshake(&bob.fp()).await.unwrap();
        assert!(!alice.protocol.is_handshaking(&bob.fp()));
        assert_eq!(
            alice.wait_for(finished).await,
            ProtocolEvent::HandshakeFinished {
                peer: bob.fp(),
                accepted: true
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_handshake() {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(SoftwareKeyManager::generate());
        let store = TrustStore::open(dir.path(), true).unwrap();
        let trust = TrustManager::open(store, keys.as_ref(), TrustConfig::default()).unwrap();
        let protocol = TrustProtocol::new(
            Arc::new(Mutex::new(trust)),
            keys,
            Arc::new(DeadTransport),
            accepting("x"),
        );
        let mut events = protocol.subscribe();
        let peer = SoftwareKeyManager::generate().fingerprint();

        assert!(matches!(
            protocol.perform_handshake(&peer).await,
            Err(ProtocolError::Transport(_))
        ));
        assert!(!protocol.is_handshaking(&peer));
        assert!(protocol.handshakes.is_empty());
        assert!(matches!(
            events.recv().await.unwrap(),
            ProtocolEvent::HandshakeFailed { .. }
        ));

        // the aborted entry is gone, so a retry fails on the link again
        assert!(matches!(
            protocol.perform_handshake(&peer).await,
            Err(ProtocolError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_init_rejected() {
        let network = MemoryNetwork::new();
        let mut alice = spawn_node(&network, accepting("x"), TrustConfig::default());
        let mallory = SoftwareKeyManager::generate();
        let victim = SoftwareKeyManager::generate();

        // mallory presents someone else's key under her own fingerprint
        alice
            .protocol
            .on_message(
                mallory.fingerprint(),
                Message::HandshakeInit {
                    public_key: victim.public_key().clone(),
                    signature: victim.self_signature().clone(),
                    is_response: false,
                },
            )
            .await;

        assert!(matches!(
            alice.next_event().await,
            ProtocolEvent::HandshakeFailed { .. }
        ));
        assert!(!alice.protocol.is_handshaking(&mallory.fingerprint()));
        assert_eq!(alice.protocol.is_known(&victim.fingerprint()), TrustInfo::UNKNOWN);
    }

    #[tokio::test]
    async fn test_stray_signature_ignored() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, accepting("x"), TrustConfig::default());
        let mallory = SoftwareKeyManager::generate();
        let signature = mallory.create_signature(alice.keys.public_key(), None).unwrap();

        alice
            .protocol
            .on_message(mallory.fingerprint(), Message::HandshakeSignature { signature })
            .await;

        assert_eq!(alice.protocol.is_known(&mallory.fingerprint()), TrustInfo::UNKNOWN);
        assert!(!alice.protocol.is_handshaking(&mallory.fingerprint()));
    }

    #[tokio::test]
    async fn test_sync_propagates_trust() {
        let network = MemoryNetwork::new();
        let mut alice = spawn_node(&network, accepting("peer"), TrustConfig::default());
        let mut bob = spawn_node(&network, accepting("peer"), TrustConfig::default());
        let mut carol = spawn_node(&network, accepting("peer"), TrustConfig::default());

        bob.protocol.perform_handshake(&carol.fp()).await.unwrap();
        bob.wait_for(finished).await;
        carol.wait_for(finished).await;

        alice.protocol.perform_handshake(&bob.fp()).await.unwrap();
        alice.wait_for(finished).await;

        // the post-handshake sync tells alice about carol
        alice
            .wait_for(|e| matches!(e, ProtocolEvent::SyncCompleted { summary, .. } if summary.subjects_added > 0))
            .await;
        assert_eq!(
            alice.protocol.is_known(&carol.fp()),
            TrustInfo::new(TrustLevel::Known, 2)
        );
    }

    #[tokio::test]
    async fn test_register_subkey() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, accepting("x"), TrustConfig::default());
        let app = AppDetails::new("org.example.chat");
        let subkey = vec![4u8; 32];

        assert!(alice
            .protocol
            .register_subkey(&subkey, &app, false, Some("chat".into()))
            .unwrap());
        assert!(!alice.protocol.register_subkey(&subkey, &app, false, None).unwrap());

        let ids = alice
            .protocol
            .available_subkeys(&alice.fp(), &app, Some("CHAT"))
            .unwrap();
        assert_eq!(ids.len(), 1);
        let id = ids.into_iter().next().unwrap();
        assert_eq!(alice.protocol.subkey_bytes(&alice.fp(), &id, &app), Some(subkey));
    }
}
