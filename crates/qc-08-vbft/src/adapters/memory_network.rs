//! In-memory transport connecting the nodes of a local committee

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{ConsensusError, ConsensusResult, PeerIndex};
use crate::ports::Transport;

/// Payload delivered to a node: sender and encoded envelope
pub type Inbound = (PeerIndex, Vec<u8>);

/// Shared switchboard routing payloads between endpoints
#[derive(Default)]
pub struct InMemoryNetwork {
    inboxes: RwLock<HashMap<PeerIndex, mpsc::Sender<Inbound>>>,
    isolated: RwLock<HashSet<PeerIndex>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `index` and return its transport and inbox.
    pub fn endpoint(
        self: &Arc<Self>,
        index: PeerIndex,
        capacity: usize,
    ) -> (InMemoryTransport, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.inboxes.write().insert(index, tx);
        let transport = InMemoryTransport {
            local: index,
            network: Arc::clone(self),
        };
        (transport, rx)
    }

    /// Cut a node off; its traffic is dropped in both directions.
    pub fn isolate(&self, index: PeerIndex) {
        self.isolated.write().insert(index);
    }

    pub fn reconnect(&self, index: PeerIndex) {
        self.isolated.write().remove(&index);
    }

    fn route(&self, from: PeerIndex, to: PeerIndex) -> Option<mpsc::Sender<Inbound>> {
        let isolated = self.isolated.read();
        if isolated.contains(&from) || isolated.contains(&to) {
            return None;
        }
        self.inboxes.read().get(&to).cloned()
    }

    fn peers_of(&self, from: PeerIndex) -> Vec<PeerIndex> {
        self.inboxes
            .read()
            .keys()
            .copied()
            .filter(|p| *p != from)
            .collect()
    }
}

/// Transport endpoint of one node
pub struct InMemoryTransport {
    local: PeerIndex,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_to(&self, peer: PeerIndex, payload: Vec<u8>) -> ConsensusResult<()> {
        let Some(inbox) = self.network.route(self.local, peer) else {
            debug!("[node {}] dropping payload to unreachable peer {}", self.local, peer);
            return Ok(());
        };
        inbox
            .send((self.local, payload))
            .await
            .map_err(|_| ConsensusError::Transport(format!("peer {} inbox closed", peer)))
    }

    async fn broadcast(&self, payload: Vec<u8>) -> ConsensusResult<()> {
        for peer in self.network.peers_of(self.local) {
            if let Err(e) = self.send_to(peer, payload.clone()).await {
                debug!("[node {}] broadcast to {} failed: {}", self.local, peer, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let net = InMemoryNetwork::new();
        let (t1, mut r1) = net.endpoint(1, 8);
        let (t2, mut r2) = net.endpoint(2, 8);
        let (_t3, mut r3) = net.endpoint(3, 8);

        t1.send_to(2, vec![1]).await.unwrap();
        assert_eq!(r2.recv().await, Some((1, vec![1])));

        t2.broadcast(vec![9]).await.unwrap();
        assert_eq!(r1.recv().await, Some((2, vec![9])));
        assert_eq!(r3.recv().await, Some((2, vec![9])));
    }

    #[tokio::test]
    async fn test_isolated_node_gets_nothing() {
        let net = InMemoryNetwork::new();
        let (t1, _r1) = net.endpoint(1, 8);
        let (_t2, mut r2) = net.endpoint(2, 8);
        net.isolate(2);
        t1.send_to(2, vec![1]).await.unwrap();
        assert!(r2.try_recv().is_err());
        net.reconnect(2);
        t1.send_to(2, vec![2]).await.unwrap();
        assert_eq!(r2.recv().await, Some((1, vec![2])));
    }
}
