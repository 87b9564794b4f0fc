//! # Peer Pool
//!
//! Liveness record of every committee peer: public key, last handshake,
//! last heartbeat, time of last update and connection flag.
//!
//! Handshake and heartbeat updates touch only their own fields; the rest of
//! the record is left as it was.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{
    ConsensusError, ConsensusResult, PeerConfig, PeerHandshakeMsg, PeerHeartbeatMsg, PeerIndex,
    PublicKey,
};

/// Record of one peer
#[derive(Clone, Debug)]
struct Peer {
    index: PeerIndex,
    pubkey: PublicKey,
    handshake: Option<PeerHandshakeMsg>,
    heartbeat: Option<PeerHeartbeatMsg>,
    last_update: Option<Instant>,
    connected: bool,
}

impl Peer {
    fn new(index: PeerIndex, pubkey: PublicKey) -> Self {
        Self {
            index,
            pubkey,
            handshake: None,
            heartbeat: None,
            last_update: None,
            connected: false,
        }
    }

    /// Committed height the peer last reported.
    fn committed_height(&self) -> Option<u32> {
        self.heartbeat
            .as_ref()
            .map(|h| h.committed_block_number)
            .or_else(|| self.handshake.as_ref().map(|h| h.committed_block_number))
    }
}

#[derive(Default)]
struct PoolState {
    peers: HashMap<PeerIndex, Peer>,
}

/// Connected-peer registry
pub struct PeerPool {
    local: PeerIndex,
    max_size: usize,
    active_window: u32,
    handshake_timeout: RwLock<Duration>,
    state: RwLock<PoolState>,
}

impl PeerPool {
    pub fn new(local: PeerIndex, max_size: usize, active_window: u32) -> Self {
        Self {
            local,
            max_size,
            active_window,
            handshake_timeout: RwLock::new(Duration::from_secs(10)),
            state: RwLock::new(PoolState::default()),
        }
    }

    /// Update the handshake timeout after a chain config change.
    pub fn set_handshake_timeout(&self, timeout: Duration) {
        *self.handshake_timeout.write() = timeout;
    }

    /// Register a committee peer. An existing record keeps its liveness data.
    pub fn add_peer(&self, config: &PeerConfig) -> ConsensusResult<()> {
        let mut state = self.state.write();
        if !state.peers.contains_key(&config.index) && state.peers.len() >= self.max_size {
            return Err(ConsensusError::InvalidState(format!(
                "peer pool full ({} peers)",
                self.max_size
            )));
        }
        state
            .peers
            .entry(config.index)
            .and_modify(|p| p.pubkey = config.id.clone())
            .or_insert_with(|| Peer::new(config.index, config.id.clone()));
        Ok(())
    }

    pub fn peer_connected(&self, index: PeerIndex) -> ConsensusResult<()> {
        let mut state = self.state.write();
        let peer = state
            .peers
            .get_mut(&index)
            .ok_or(ConsensusError::UnknownPeer(index))?;
        peer.connected = true;
        peer.last_update = Some(Instant::now());
        debug!("[peers] peer {} connected", index);
        Ok(())
    }

    pub fn peer_disconnected(&self, index: PeerIndex) {
        if let Some(peer) = self.state.write().peers.get_mut(&index) {
            peer.connected = false;
            debug!("[peers] peer {} disconnected", index);
        }
    }

    pub fn record_handshake(&self, index: PeerIndex, msg: PeerHandshakeMsg) -> ConsensusResult<()> {
        let mut state = self.state.write();
        let peer = state
            .peers
            .get_mut(&index)
            .ok_or(ConsensusError::UnknownPeer(index))?;
        peer.handshake = Some(msg);
        peer.last_update = Some(Instant::now());
        peer.connected = true;
        Ok(())
    }

    pub fn record_heartbeat(&self, index: PeerIndex, msg: PeerHeartbeatMsg) -> ConsensusResult<()> {
        let mut state = self.state.write();
        let peer = state
            .peers
            .get_mut(&index)
            .ok_or(ConsensusError::UnknownPeer(index))?;
        peer.heartbeat = Some(msg);
        peer.last_update = Some(Instant::now());
        peer.connected = true;
        Ok(())
    }

    /// Connected and heard from within twice the handshake timeout.
    /// The local node is always alive.
    pub fn is_peer_alive(&self, index: PeerIndex) -> bool {
        if index == self.local {
            return true;
        }
        let limit = *self.handshake_timeout.read() * 2;
        let state = self.state.read();
        match state.peers.get(&index) {
            Some(p) if p.connected => p
                .last_update
                .map(|t| t.elapsed() < limit)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Alive and, if it has reported a height, not too far behind `local_height`.
    pub fn is_peer_active(&self, index: PeerIndex, local_height: u32) -> bool {
        if !self.is_peer_alive(index) {
            return false;
        }
        if index == self.local {
            return true;
        }
        let state = self.state.read();
        match state.peers.get(&index).and_then(|p| p.heartbeat.as_ref()) {
            Some(hb) => {
                u64::from(hb.committed_block_number) + u64::from(self.active_window)
                    > u64::from(local_height)
            }
            None => true,
        }
    }

    pub fn active_peer_count(&self) -> usize {
        self.state.read().peers.values().filter(|p| p.connected).count()
    }

    pub fn peer_pubkey(&self, index: PeerIndex) -> Option<PublicKey> {
        self.state.read().peers.get(&index).map(|p| p.pubkey.clone())
    }

    /// Last reported committed height of every connected peer, by index.
    pub fn peer_heights(&self) -> Vec<(PeerIndex, u32)> {
        let mut heights: Vec<(PeerIndex, u32)> = self
            .state
            .read()
            .peers
            .values()
            .filter(|p| p.connected)
            .filter_map(|p| p.committed_height().map(|h| (p.index, h)))
            .collect();
        heights.sort_unstable();
        heights
    }
}
