// network/memory.rs - In-Process Network

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use super::transport::{NetworkEvent, Transport, TransportError};
use crate::protocol::Message;
use crate::trust::Fingerprint;

/// Hub connecting in-process nodes by fingerprint
///
/// Every message is encoded and decoded on the way through, so nodes see
/// exactly what would cross a real wire.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<Fingerprint, mpsc::UnboundedSender<NetworkEvent>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its transport and inbound event stream
    pub fn join(&self, local: Fingerprint) -> (MemoryTransport, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(local.clone(), tx);

        let transport = MemoryTransport {
            local,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Detach a node; its event stream ends
    pub fn leave(&self, node: &Fingerprint) {
        self.nodes.remove(node);
    }

    pub fn nodes(&self) -> HashSet<Fingerprint> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tell every node who its neighbours are (everyone else)
    pub fn announce_peers(&self) {
        let all = self.nodes();
        for entry in self.nodes.iter() {
            let mut peers = all.clone();
            peers.remove(entry.key());
            let _ = entry.value().send(NetworkEvent::PeersChanged(peers));
        }
    }

    fn deliver(&self, from: &Fingerprint, to: &Fingerprint, message: &Message) -> Result<(), TransportError> {
        let bytes = message.encode()?;
        let sender = self
            .nodes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        trace!(from = %from.short(), to = %to.short(), kind = message.kind(), bytes = bytes.len(), "Delivering message");
        sender
            .send(NetworkEvent::MessageReceived {
                from: from.clone(),
                message: Message::decode(&bytes)?,
            })
            .map_err(|_| TransportError::Closed(to.clone()))
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    local: Fingerprint,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local(&self) -> &Fingerprint {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &Fingerprint, message: Message) -> Result<(), TransportError> {
        self.network.deliver(&self.local, peer, &message)
    }

    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        for peer in self.network.nodes() {
            if peer != self.local {
                self.network.deliver(&self.local, &peer, &message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{KeyManager, SoftwareKeyManager};

    fn request() -> Message {
        Message::SyncRequest {
            trusted_subjects: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn test_send_delivers_with_sender() {
        let network = MemoryNetwork::new();
        let a = SoftwareKeyManager::generate().fingerprint();
        let b = SoftwareKeyManager::generate().fingerprint();
        let (transport_a, _rx_a) = network.join(a.clone());
        let (_transport_b, mut rx_b) = network.join(b.clone());

        transport_a.send(&b, request()).await.unwrap();

        match rx_b.recv().await.unwrap() {
            NetworkEvent::MessageReceived { from, message } => {
                assert_eq!(from, a);
                assert_eq!(message, request());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let a = SoftwareKeyManager::generate().fingerprint();
        let ghost = SoftwareKeyManager::generate().fingerprint();
        let (transport, _rx) = network.join(a);

        assert!(matches!(
            transport.send(&ghost, request()).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_fails() {
        let network = MemoryNetwork::new();
        let a = SoftwareKeyManager::generate().fingerprint();
        let b = SoftwareKeyManager::generate().fingerprint();
        let (transport, _rx) = network.join(a);
        let (_, rx_b) = network.join(b.clone());
        drop(rx_b);

        assert!(matches!(
            transport.send(&b, request()).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let network = MemoryNetwork::new();
        let fps: Vec<Fingerprint> = (0..3).map(|_| SoftwareKeyManager::generate().fingerprint()).collect();
        let (transport, mut rx_self) = network.join(fps[0].clone());
        let (_t1, mut rx1) = network.join(fps[1].clone());
        let (_t2, mut rx2) = network.join(fps[2].clone());

        transport.broadcast(request()).await.unwrap();

        assert!(matches!(rx1.recv().await, Some(NetworkEvent::MessageReceived { .. })));
        assert!(matches!(rx2.recv().await, Some(NetworkEvent::MessageReceived { .. })));
        assert!(rx_self.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_announce_peers() {
        let network = MemoryNetwork::new();
        let a = SoftwareKeyManager::generate().fingerprint();
        let b = SoftwareKeyManager::generate().fingerprint();
        let (_ta, mut rx_a) = network.join(a.clone());
        let (_tb, _rx_b) = network.join(b.clone());

        network.announce_peers();
        match rx_a.recv().await.unwrap() {
            NetworkEvent::PeersChanged(peers) => assert_eq!(peers, HashSet::from([b.clone()])),
            other => panic!("unexpected event: {:?}", other),
        }

        network.leave(&b);
        assert_eq!(network.nodes(), HashSet::from([a]));
    }
}
