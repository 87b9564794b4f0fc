//! # State Manager
//!
//! Node lifecycle from bootstrap to active consensus:
//!
//! ```text
//! Init ─► LocalConfigured ─► Syncing ─► WaitNetworkReady ─► SyncReady ─► Synced
//!                                                                           │
//!                                                 SyncingCheck ◄────────────┘
//! ```
//!
//! Peer heartbeats drive the transitions. The manager never calls into the
//! server directly; it reads through [`StateHost`] and asks for work with
//! [`StateAction`]s.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{ChainConfig, ConsensusError, ConsensusResult, PeerIndex};
use crate::metrics;
use crate::syncer::{BlockSyncReq, SyncerHandle};

/// Lifecycle state, ordered
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerState {
    Init = 0,
    LocalConfigured = 1,
    /// Config loaded from chain
    Configured = 2,
    Syncing = 3,
    /// Synced, waiting for enough peers
    WaitNetworkReady = 4,
    /// Processing consensus messages without proposing
    SyncReady = 5,
    Synced = 6,
    /// Possibly lost sync
    SyncingCheck = 7,
}

impl ServerState {
    fn from_u8(v: u8) -> ServerState {
        match v {
            0 => ServerState::Init,
            1 => ServerState::LocalConfigured,
            2 => ServerState::Configured,
            3 => ServerState::Syncing,
            4 => ServerState::WaitNetworkReady,
            5 => ServerState::SyncReady,
            6 => ServerState::Synced,
            _ => ServerState::SyncingCheck,
        }
    }

    /// Consensus messages are processed.
    pub fn is_ready(self) -> bool {
        self >= ServerState::SyncReady
    }

    /// The node takes part in rounds.
    pub fn is_active(self) -> bool {
        self >= ServerState::Synced
    }
}

/// Peer status reported through heartbeats
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerState {
    pub peer_index: PeerIndex,
    pub chain_config_view: u32,
    pub committed_block_num: u32,
    pub connected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateEvent {
    ConfigLoaded,
    UpdatePeerConfig(PeerState),
    UpdatePeerState(PeerState),
    /// Carries the block number current when SyncReady was entered.
    SyncReadyTimeout(u32),
    ForceCheckSync(u32),
    SyncDone(u32),
    /// Carries the committed height at tick time.
    LiveTick(u32),
}

/// Work the state manager asks the server to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateAction {
    StartNewRound,
    FastForward,
    ReBroadcast,
}

/// Read access to the node plus a way to request actions
pub trait StateHost: Send + Sync {
    fn committed_height(&self) -> u32;

    fn current_block_num(&self) -> u32;

    fn chain_config(&self) -> Arc<ChainConfig>;

    fn active_peer_count(&self) -> usize;

    /// Commit consensus and the matching proposal for `block_num` are both
    /// in the message pool.
    fn round_has_consensus_evidence(&self, block_num: u32) -> bool;

    fn peer_handshake_timeout(&self) -> Duration;

    /// Queue an action. Must not block.
    fn request(&self, action: StateAction);
}

/// Shared view of the state plus the event queue sender
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<AtomicU8>,
    tx: mpsc::Sender<StateEvent>,
}

impl StateHandle {
    pub fn channel(capacity: usize) -> (StateHandle, mpsc::Receiver<StateEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            StateHandle {
                state: Arc::new(AtomicU8::new(ServerState::Init as u8)),
                tx,
            },
            rx,
        )
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
        metrics::record_state(state as u8);
    }

    pub async fn send(&self, event: StateEvent) -> ConsensusResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ConsensusError::ChannelClosed("state events"))
    }

    /// Best-effort send for callers that cannot wait.
    pub fn try_send(&self, event: StateEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("[state] event dropped: {}", e);
                false
            }
        }
    }
}

/// Lifecycle state machine
pub struct StateMgr {
    local: PeerIndex,
    host: Arc<dyn StateHost>,
    syncer: SyncerHandle,
    handle: StateHandle,
    rx: mpsc::Receiver<StateEvent>,
    sync_ready_timeout: Duration,
    max_check_distance: u32,
    max_peer_connections: usize,
    peers: BTreeMap<PeerIndex, PeerState>,
    last_tick_height: u32,
    last_sync_req_height: u32,
}

impl StateMgr {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerIndex,
        host: Arc<dyn StateHost>,
        syncer: SyncerHandle,
        handle: StateHandle,
        rx: mpsc::Receiver<StateEvent>,
        sync_ready_timeout: Duration,
        max_check_distance: u32,
        max_peer_connections: usize,
    ) -> Self {
        Self {
            local,
            host,
            syncer,
            handle,
            rx,
            sync_ready_timeout,
            max_check_distance,
            max_peer_connections,
            peers: BTreeMap::new(),
            last_tick_height: 0,
            last_sync_req_height: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.handle.state()
    }

    fn set_state(&self, state: ServerState) {
        let prev = self.state();
        if prev != state {
            debug!("[node {}] state {:?} -> {:?}", self.local, prev, state);
        }
        self.handle.set_state(state);
    }

    /// Event loop with the live ticker. First tick after 5x the handshake
    /// timeout, then every 3x.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let live = tokio::time::sleep(self.host.peer_handshake_timeout() * 5);
        tokio::pin!(live);
        loop {
            tokio::select! {
                Some(event) = self.rx.recv() => self.process_event(event),
                _ = &mut live => {
                    let height = self.host.committed_height();
                    self.process_event(StateEvent::LiveTick(height));
                    let next = tokio::time::Instant::now() + self.host.peer_handshake_timeout() * 3;
                    live.as_mut().reset(next);
                }
                _ = shutdown.changed() => {
                    info!("[node {}] state mgr quit", self.local);
                    return;
                }
            }
        }
    }

    pub fn process_event(&mut self, event: StateEvent) {
        match event {
            StateEvent::ConfigLoaded => {
                if self.state() == ServerState::Init {
                    self.set_state(ServerState::LocalConfigured);
                }
            }
            StateEvent::SyncReadyTimeout(block_num) => {
                if self.state() == ServerState::SyncReady {
                    self.set_state(ServerState::Synced);
                    if block_num == self.host.current_block_num() {
                        self.host.request(StateAction::StartNewRound);
                    }
                }
            }
            StateEvent::UpdatePeerConfig(peer) => {
                self.peers.insert(peer.peer_index, peer);
                if self.state() >= ServerState::LocalConfigured {
                    let local_view = self.host.chain_config().view;
                    let v = self.synced_chain_config_view();
                    if v == local_view && self.state() < ServerState::Syncing {
                        info!("[node {}] start syncing", self.local);
                        self.set_state(ServerState::Syncing);
                    } else if v > local_view {
                        warn!(
                            "[node {}] peers on chain config view {} (local {})",
                            self.local, v, local_view
                        );
                        self.set_state(ServerState::LocalConfigured);
                    }
                }
            }
            StateEvent::UpdatePeerState(peer) => {
                if peer.connected {
                    self.on_peer_update(peer);
                } else {
                    self.on_peer_disconnected(peer.peer_index);
                }
            }
            StateEvent::ForceCheckSync(block_num) => self.check_start_syncing(block_num, true),
            StateEvent::SyncDone(target) => {
                info!(
                    "[node {}] sync done at {}, current {}",
                    self.local,
                    target,
                    self.host.current_block_num()
                );
                self.set_synced_ready();
            }
            StateEvent::LiveTick(height) => {
                debug!(
                    "[node {}] live tick, current {}, state {:?}, peers {:?}",
                    self.local,
                    self.host.current_block_num(),
                    self.state(),
                    self.peers.values().collect::<Vec<_>>()
                );
                self.on_live_tick(height);
            }
        }
    }

    fn on_peer_update(&mut self, peer: PeerState) {
        let known = self.peers.insert(peer.peer_index, peer).is_some();
        let committed = self.host.committed_height();

        if known
            && self.state().is_active()
            && peer.committed_block_num > self.host.current_block_num() + self.max_check_distance
        {
            warn!(
                "[node {}] seems to have lost sync: peer {} at {} vs {}",
                self.local,
                peer.peer_index,
                peer.committed_block_num,
                self.host.current_block_num()
            );
            self.check_start_syncing(committed + self.max_check_distance, false);
            return;
        }

        match self.state() {
            ServerState::LocalConfigured => {
                if self.synced_chain_config_view() == self.host.chain_config().view {
                    self.set_state(ServerState::Syncing);
                }
            }
            ServerState::Syncing => {
                if peer.committed_block_num > committed {
                    if let Some(target) = self.consensused_committed_block_num() {
                        if target > committed {
                            let fast_forward = self.can_fast_forward(target);
                            info!(
                                "[node {}] syncing {}, target {}, fast-forward {}",
                                self.local, committed, target, fast_forward
                            );
                            if fast_forward {
                                self.host.request(StateAction::FastForward);
                            } else {
                                self.check_start_syncing(committed, false);
                            }
                        }
                    }
                }
                if self.is_synced_ready() {
                    info!("[node {}] synced from syncing", self.local);
                    self.set_synced_ready();
                }
            }
            ServerState::WaitNetworkReady => {
                if self.is_synced_ready() {
                    info!("[node {}] synced from network wait", self.local);
                    self.set_synced_ready();
                }
            }
            ServerState::Synced => {
                if let Some(target) = self.consensused_committed_block_num() {
                    if target > committed + 1 {
                        info!("[node {}] synced, fast-forward from {}", self.local, committed);
                        self.host.request(StateAction::FastForward);
                    }
                }
            }
            ServerState::SyncingCheck => {
                if self.is_synced_ready() {
                    self.set_synced_ready();
                } else {
                    self.check_start_syncing(committed + self.max_check_distance, false);
                }
            }
            ServerState::Init | ServerState::Configured | ServerState::SyncReady => {}
        }
    }

    fn on_peer_disconnected(&mut self, peer: PeerIndex) {
        if self.peers.remove(&peer).is_none() {
            return;
        }
        let state = self.state();
        if (state == ServerState::Synced || state == ServerState::SyncingCheck)
            && self.host.active_peer_count() < self.min_active_peer_count()
        {
            warn!("[node {}] too few peers, waiting for network", self.local);
            self.set_state(ServerState::WaitNetworkReady);
        }
    }

    fn on_live_tick(&mut self, height: u32) {
        if height > self.last_tick_height || self.last_tick_height == 0 {
            self.last_tick_height = height;
            return;
        }
        let state = self.state();
        if state != ServerState::Synced && state != ServerState::SyncReady {
            return;
        }
        warn!(
            "[node {}] consensus halt detected at {}",
            self.local,
            self.host.current_block_num()
        );
        let committed = self.host.committed_height();
        if let Some(target) = self.consensused_committed_block_num() {
            if target > committed {
                if self.can_fast_forward(target) {
                    self.host.request(StateAction::FastForward);
                } else {
                    self.check_start_syncing(committed, false);
                }
            }
        }
        self.host.request(StateAction::ReBroadcast);
    }

    /// Peers other than self needed for network readiness: `2C`.
    fn min_active_peer_count(&self) -> usize {
        (self.host.chain_config().c as usize * 2).min(self.max_peer_connections)
    }

    /// View reported by at least `2C` peers, or 0.
    fn synced_chain_config_view(&self) -> u32 {
        let min = self.min_active_peer_count();
        if min == 0 {
            return self.host.chain_config().view;
        }
        if self.peers.len() < min {
            return 0;
        }
        let mut views: BTreeMap<u32, usize> = BTreeMap::new();
        for p in self.peers.values() {
            *views.entry(p.chain_config_view).or_default() += 1;
        }
        views
            .into_iter()
            .rev()
            .find(|(_, n)| *n >= min)
            .map(|(v, _)| v)
            .unwrap_or(0)
    }

    /// Highest reported height above `floor` (or equal to it when
    /// `floor_inclusive`) that more than `C` peers have reached, with those peers.
    fn highest_quorum_height(&self, floor_inclusive: bool, floor: u32) -> Option<(u32, Vec<PeerIndex>)> {
        let c = self.host.chain_config().c as usize;
        let mut heights: Vec<u32> = self
            .peers
            .values()
            .map(|p| p.committed_block_num)
            .filter(|n| if floor_inclusive { *n >= floor } else { *n > floor })
            .collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();
        heights.into_iter().find_map(|h| {
            let peers: Vec<PeerIndex> = self
                .peers
                .values()
                .filter(|p| p.committed_block_num >= h)
                .map(|p| p.peer_index)
                .collect();
            (peers.len() > c).then_some((h, peers))
        })
    }

    /// Committed height more than `C` peers agree on.
    fn consensused_committed_block_num(&self) -> Option<u32> {
        self.highest_quorum_height(true, self.host.committed_height())
            .map(|(h, _)| h)
    }

    fn is_synced_ready(&self) -> bool {
        if self.peers.len() < self.min_active_peer_count() {
            return false;
        }
        match self.consensused_committed_block_num() {
            Some(target) if self.host.committed_height() >= target => true,
            Some(target) => self.can_fast_forward(target),
            None => false,
        }
    }

    /// Enter SyncReady. The promotion timer and the fast-forward are only
    /// started on entry, so repeated calls while SyncReady arm nothing.
    fn set_synced_ready(&mut self) {
        let prev = self.state();
        if prev == ServerState::SyncReady {
            return;
        }
        self.set_state(ServerState::SyncReady);
        info!("[node {}] sync ready (was {:?})", self.local, prev);

        let block_num = self.host.current_block_num();
        let handle = self.handle.clone();
        let timeout = self.sync_ready_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = handle.send(StateEvent::SyncReadyTimeout(block_num)).await;
        });
        self.host.request(StateAction::FastForward);
    }

    fn check_start_syncing(&mut self, start: u32, force: bool) {
        let quorum = self.highest_quorum_height(false, start);
        let max_committed = quorum.as_ref().map(|(h, _)| *h).unwrap_or(0);

        if max_committed > start || force {
            self.set_state(ServerState::Syncing);
            let start = self.host.committed_height() + 1;
            if max_committed > self.syncer.target_block_num() {
                let peers = quorum.map(|(_, p)| p).unwrap_or_default();
                info!(
                    "[node {}] start syncing {} - {} with {:?}",
                    self.local, start, max_committed, peers
                );
                self.last_sync_req_height = max_committed;
                self.syncer.request(BlockSyncReq {
                    target_peers: peers,
                    start_block_num: start,
                    target_block_num: max_committed,
                });
            }
        } else if self.state() == ServerState::Synced {
            info!(
                "[node {}] syncing check at {}",
                self.local,
                self.host.current_block_num()
            );
            self.set_state(ServerState::SyncingCheck);
        }
    }

    /// Every round from the current one up to `target` has commit consensus
    /// and its proposal locally, and no sync is running.
    fn can_fast_forward(&self, target: u32) -> bool {
        if target > self.host.committed_height() + self.max_check_distance * 4 {
            return false;
        }
        for block_num in self.host.current_block_num()..=target {
            if !self.host.round_has_consensus_evidence(block_num) {
                debug!(
                    "[node {}] no fast-forward: missing evidence for {}",
                    self.local, block_num
                );
                return false;
            }
        }
        !self.syncer.is_active()
    }

    pub fn last_sync_req_height(&self) -> u32 {
        self.last_sync_req_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain_config::tests::settings;
    use crate::domain::PosTableBuilder;
    use crate::ports::{BlockFetcher, ChainHeightSource, SyncedBlockSink};
    use crate::domain::Block;
    use crate::syncer::{Syncer, SyncerCapacity};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FakeHost {
        committed: Mutex<u32>,
        config: Arc<ChainConfig>,
        active_peers: Mutex<usize>,
        evidence: Mutex<Vec<u32>>,
        actions: Mutex<Vec<StateAction>>,
    }

    impl StateHost for FakeHost {
        fn committed_height(&self) -> u32 {
            *self.committed.lock()
        }
        fn current_block_num(&self) -> u32 {
            *self.committed.lock() + 1
        }
        fn chain_config(&self) -> Arc<ChainConfig> {
            self.config.clone()
        }
        fn active_peer_count(&self) -> usize {
            *self.active_peers.lock()
        }
        fn round_has_consensus_evidence(&self, block_num: u32) -> bool {
            self.evidence.lock().contains(&block_num)
        }
        fn peer_handshake_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn request(&self, action: StateAction) {
            self.actions.lock().push(action);
        }
    }

    struct Idle;

    impl ChainHeightSource for Idle {
        fn committed_height(&self) -> u32 {
            0
        }
        fn local_block(&self, _height: u32) -> Option<Block> {
            None
        }
        fn fault_tolerance(&self) -> u32 {
            1
        }
        fn peers_reaching(&self, _height: u32) -> Vec<PeerIndex> {
            Vec::new()
        }
    }

    #[async_trait]
    impl BlockFetcher for Idle {
        async fn request_block_info(&self, _peer: PeerIndex, _start: u32) -> ConsensusResult<()> {
            Ok(())
        }
        async fn request_block(&self, _peer: PeerIndex, _height: u32) -> ConsensusResult<()> {
            Ok(())
        }
        fn cached_proposal(&self, _height: u32, _proposer: PeerIndex) -> Option<Block> {
            None
        }
        fn request_timeout(&self) -> Duration {
            Duration::from_millis(600)
        }
    }

    #[async_trait]
    impl SyncedBlockSink for Idle {
        async fn fast_forward(&self, _block: Block) -> ConsensusResult<()> {
            Ok(())
        }
    }

    fn setup() -> (StateMgr, Arc<FakeHost>, mpsc::Receiver<BlockSyncReq>) {
        let config = PosTableBuilder::new(settings(4, 1), [0u8; 32], 0)
            .build(1)
            .unwrap();
        let host = Arc::new(FakeHost {
            committed: Mutex::new(0),
            config: Arc::new(config),
            active_peers: Mutex::new(3),
            evidence: Mutex::new(vec![]),
            actions: Mutex::new(vec![]),
        });
        let (handle, rx) = StateHandle::channel(16);
        let idle = Arc::new(Idle);
        let (syncer, syncer_handle) = Syncer::new(
            1,
            idle.clone(),
            idle.clone(),
            idle,
            handle.clone(),
            SyncerCapacity {
                requests: 4,
                messages: 4,
                blocks: 4,
                per_peer: 4,
            },
        );
        let reqs = syncer.into_request_rx();
        let mgr = StateMgr::new(
            1,
            host.clone(),
            syncer_handle,
            handle,
            rx,
            Duration::from_millis(500),
            10,
            100,
        );
        (mgr, host, reqs)
    }

    fn peer(index: PeerIndex, view: u32, height: u32) -> PeerState {
        PeerState {
            peer_index: index,
            chain_config_view: view,
            committed_block_num: height,
            connected: true,
        }
    }

    #[test]
    fn test_state_order() {
        assert!(ServerState::SyncReady.is_ready());
        assert!(!ServerState::SyncReady.is_active());
        assert!(ServerState::SyncingCheck.is_active());
        assert!(!ServerState::WaitNetworkReady.is_ready());
    }

    #[tokio::test]
    async fn test_bootstrap_to_synced() {
        let (mut mgr, host, _reqs) = setup();
        assert_eq!(mgr.state(), ServerState::Init);
        mgr.process_event(StateEvent::ConfigLoaded);
        assert_eq!(mgr.state(), ServerState::LocalConfigured);

        mgr.process_event(StateEvent::UpdatePeerConfig(peer(2, 1, 0)));
        assert_eq!(mgr.state(), ServerState::LocalConfigured);
        mgr.process_event(StateEvent::UpdatePeerConfig(peer(3, 1, 0)));
        assert_eq!(mgr.state(), ServerState::Syncing);

        mgr.process_event(StateEvent::UpdatePeerState(peer(2, 1, 0)));
        assert_eq!(mgr.state(), ServerState::SyncReady);
        assert!(host.actions.lock().contains(&StateAction::FastForward));

        mgr.process_event(StateEvent::SyncReadyTimeout(1));
        assert_eq!(mgr.state(), ServerState::Synced);
        assert_eq!(host.actions.lock().last(), Some(&StateAction::StartNewRound));
    }

    #[tokio::test]
    async fn test_newer_view_falls_back() {
        let (mut mgr, _host, _reqs) = setup();
        mgr.process_event(StateEvent::ConfigLoaded);
        mgr.process_event(StateEvent::UpdatePeerConfig(peer(2, 1, 0)));
        mgr.process_event(StateEvent::UpdatePeerConfig(peer(3, 1, 0)));
        assert_eq!(mgr.state(), ServerState::Syncing);
        mgr.process_event(StateEvent::UpdatePeerConfig(peer(2, 2, 0)));
        mgr.process_event(StateEvent::UpdatePeerConfig(peer(3, 2, 0)));
        assert_eq!(mgr.state(), ServerState::LocalConfigured);
    }

    #[tokio::test]
    async fn test_lagging_node_requests_sync() {
        let (mut mgr, _host, mut reqs) = setup();
        mgr.set_state(ServerState::Syncing);
        mgr.process_event(StateEvent::UpdatePeerState(peer(2, 1, 5)));
        mgr.process_event(StateEvent::UpdatePeerState(peer(3, 1, 5)));
        mgr.process_event(StateEvent::UpdatePeerState(peer(4, 1, 3)));

        let req = reqs.try_recv().unwrap();
        assert_eq!(req.start_block_num, 1);
        assert_eq!(req.target_block_num, 5);
        assert_eq!(req.target_peers, vec![2, 3]);
        assert_eq!(mgr.last_sync_req_height(), 5);
        assert_eq!(mgr.state(), ServerState::Syncing);
    }

    #[tokio::test]
    async fn test_lagging_node_fast_forwards_with_evidence() {
        let (mut mgr, host, mut reqs) = setup();
        host.evidence.lock().extend([1, 2, 3]);
        mgr.set_state(ServerState::Syncing);
        mgr.process_event(StateEvent::UpdatePeerState(peer(2, 1, 3)));
        mgr.process_event(StateEvent::UpdatePeerState(peer(3, 1, 3)));
        assert!(host.actions.lock().contains(&StateAction::FastForward));
        assert!(reqs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_regresses_to_wait_network() {
        let (mut mgr, host, _reqs) = setup();
        mgr.set_state(ServerState::Synced);
        mgr.peers.insert(2, peer(2, 1, 0));
        *host.active_peers.lock() = 1;
        let mut gone = peer(2, 1, 0);
        gone.connected = false;
        mgr.process_event(StateEvent::UpdatePeerState(gone));
        assert_eq!(mgr.state(), ServerState::WaitNetworkReady);
    }

    #[tokio::test]
    async fn test_live_tick_rebroadcasts_on_stall() {
        let (mut mgr, host, _reqs) = setup();
        mgr.set_state(ServerState::Synced);
        mgr.process_event(StateEvent::LiveTick(4));
        assert!(host.actions.lock().is_empty());
        mgr.process_event(StateEvent::LiveTick(4));
        assert_eq!(host.actions.lock().as_slice(), &[StateAction::ReBroadcast]);
        mgr.process_event(StateEvent::LiveTick(5));
        assert_eq!(host.actions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_far_ahead_peer_triggers_sync_check() {
        let (mut mgr, _host, _reqs) = setup();
        mgr.set_state(ServerState::Synced);
        mgr.process_event(StateEvent::UpdatePeerState(peer(2, 1, 0)));
        mgr.process_event(StateEvent::UpdatePeerState(peer(2, 1, 30)));
        assert_eq!(mgr.state(), ServerState::SyncingCheck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_ready_timer_armed_once() {
        fn fast_forwards(host: &FakeHost) -> usize {
            host.actions
                .lock()
                .iter()
                .filter(|a| **a == StateAction::FastForward)
                .count()
        }
        let (mut mgr, host, _reqs) = setup();

        mgr.set_state(ServerState::WaitNetworkReady);
        mgr.set_synced_ready();
        mgr.set_synced_ready();
        assert_eq!(mgr.state(), ServerState::SyncReady);
        assert_eq!(fast_forwards(&host), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(mgr.rx.try_recv(), Ok(StateEvent::SyncReadyTimeout(_))));
        assert!(mgr.rx.try_recv().is_err());

        // re-entry from a sync check arms a fresh timer
        mgr.set_state(ServerState::SyncingCheck);
        mgr.set_synced_ready();
        assert_eq!(fast_forwards(&host), 2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(mgr.rx.try_recv(), Ok(StateEvent::SyncReadyTimeout(_))));
    }
}
