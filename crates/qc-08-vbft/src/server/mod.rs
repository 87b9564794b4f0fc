//! # VBFT Server
//!
//! One consensus node: the pools, the event timer, the state manager and the
//! syncer wired together and driven by a handful of loops.
//!
//! ```text
//!  transport ─► deliver ─► peer loop ──(decode, verify)──► msg loop ──┐
//!                                                                     ├─► handlers ─► action loop
//!  event timer ─────────────────────────────────────────► timer loop ─┘        │
//!                                                                              ▼
//!                                                             send loop ─► transport
//! ```
//!
//! Handlers are synchronous and never wait on a queue. Work that must happen
//! later is pushed as a [`BftAction`] or a timer event, and outbound messages
//! go through a bounded send queue drained by the send loop.

mod actions;
mod builder;
mod handlers;
mod roles;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::block_pool::BlockPool;
use crate::config::{TimingConfig, VbftConfig};
use crate::domain::{
    encode_msg, get_commit_consensus, msg_hash, Block, BlockCommitMsg, BlockEndorseMsg,
    BlockParticipantConfig, BlockProposalMsg, ChainConfig, ConsensusError, ConsensusMsg,
    ConsensusResult, Hash, PeerIndex, PublicKey,
};
use crate::event_timer::{EventTimer, TimerEvent};
use crate::msg_pool::MsgPool;
use crate::peer_pool::PeerPool;
use crate::ports::{
    BlockFetcher, BlockStore, ChainHeightSource, Signer, SyncedBlockSink, TransactionPool,
    Transport, VbftApi,
};
use crate::state_mgr::{
    PeerState, ServerState, StateAction, StateEvent, StateHandle, StateHost, StateMgr,
};
use crate::syncer::{Syncer, SyncerCapacity, SyncerHandle};

/// Round message after decoding and verification
#[derive(Clone, Debug)]
pub(crate) enum RoundMsg {
    Proposal(Arc<BlockProposalMsg>),
    Endorse(Arc<BlockEndorseMsg>),
    Commit(Arc<BlockCommitMsg>),
}

/// Protocol step queued for the action loop
#[derive(Clone, Debug)]
pub(crate) enum BftAction {
    MakeProposal {
        block_num: u32,
        for_empty: bool,
    },
    EndorseBlock {
        proposal: Arc<BlockProposalMsg>,
        for_empty: bool,
    },
    CommitBlock {
        proposal: Arc<BlockProposalMsg>,
        for_empty: bool,
    },
    SealBlock {
        proposal: Arc<BlockProposalMsg>,
        for_empty: bool,
    },
    FastForward,
    ReBroadcast {
        block_num: u32,
    },
    StartNewRound,
}

/// Encoded message and its destination; `None` broadcasts.
struct Outbound {
    to: Option<PeerIndex>,
    payload: Vec<u8>,
}

struct RoundMeta {
    chain_config: Arc<ChainConfig>,
    participants: Option<Arc<BlockParticipantConfig>>,
    current_block_num: u32,
    /// Carried by the next local proposal until a block with it is sealed
    pending_chain_config: Option<ChainConfig>,
}

/// Collaborators a server drives
pub struct ServerPorts {
    pub signer: Arc<dyn Signer>,
    pub store: Arc<dyn BlockStore>,
    pub transport: Arc<dyn Transport>,
    pub tx_pool: Arc<dyn TransactionPool>,
}

/// Shared node state reached from every loop
pub struct ServerCore {
    local: PeerIndex,
    config: VbftConfig,
    signer: Arc<dyn Signer>,
    store: Arc<dyn BlockStore>,
    transport: Arc<dyn Transport>,
    tx_pool: Arc<dyn TransactionPool>,

    block_pool: BlockPool,
    msg_pool: MsgPool,
    peer_pool: PeerPool,
    timer: EventTimer,
    state: StateHandle,
    syncer: SyncerHandle,

    meta: RwLock<RoundMeta>,

    msg_tx: mpsc::Sender<RoundMsg>,
    action_tx: mpsc::Sender<BftAction>,
    send_tx: mpsc::Sender<Outbound>,
    peer_inboxes: RwLock<HashMap<PeerIndex, mpsc::Sender<Vec<u8>>>>,
    shutdown: watch::Receiver<bool>,
}

/// Chain config in force after the chained head.
fn load_chain_config(store: &dyn BlockStore) -> ConsensusResult<ChainConfig> {
    let head = store.get_block(store.chained_height())?;
    let config_block_num = head.config_block_for_next();
    let config_block = store.get_block(config_block_num)?;
    let config = config_block
        .info()
        .new_chain_config
        .clone()
        .ok_or_else(|| {
            ConsensusError::InvalidChainConfig(format!(
                "block {} carries no chain config",
                config_block_num
            ))
        })?;
    config.validate()?;
    Ok(config)
}

/// Running consensus node
pub struct VbftServer {
    core: Arc<ServerCore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VbftServer {
    /// Load the chain config from the store, wire every component and spawn
    /// the loops. Must be called from within a tokio runtime.
    pub fn start(config: VbftConfig, ports: ServerPorts) -> ConsensusResult<Self> {
        let chain_config = load_chain_config(ports.store.as_ref())?;
        let local = chain_config
            .index_of(&ports.signer.public_key())
            .ok_or_else(|| ConsensusError::InvalidState("local key is not a committee member".into()))?;

        let timing = Arc::new(TimingConfig::from_chain_config(&chain_config));
        let block_pool = BlockPool::new(config.history_len, ports.store.clone())?;
        let current_block_num = block_pool.chained_height() + 1;
        let msg_pool = MsgPool::new(config.history_len);
        let peer_pool = PeerPool::new(local, config.max_peer_connections, config.active_window());
        peer_pool.set_handshake_timeout(chain_config.peer_handshake_timeout);
        for peer in &chain_config.peers {
            peer_pool.add_peer(peer)?;
        }
        let (timer, timer_rx) = EventTimer::new(config.timer_channel_capacity, timing);

        let (msg_tx, msg_rx) = mpsc::channel(config.msg_channel_capacity);
        let (action_tx, action_rx) = mpsc::channel(config.action_channel_capacity);
        let (send_tx, send_rx) = mpsc::channel(config.send_channel_capacity);
        let (state, state_rx) = StateHandle::channel(config.state_channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let capacity = SyncerCapacity {
            requests: config.sync_req_capacity,
            messages: config.sync_msg_capacity,
            blocks: config.blocks_from_peer_capacity,
            per_peer: config.peer_syncer_capacity,
        };

        let mut syncer_slot = None;
        let core = Arc::new_cyclic(|weak: &Weak<ServerCore>| {
            let link = Arc::new(CoreLink(weak.clone()));
            let (syncer, syncer_handle) = Syncer::new(
                local,
                link.clone(),
                link.clone(),
                link,
                state.clone(),
                capacity,
            );
            syncer_slot = Some(syncer);
            ServerCore {
                local,
                config,
                signer: ports.signer,
                store: ports.store,
                transport: ports.transport,
                tx_pool: ports.tx_pool,
                block_pool,
                msg_pool,
                peer_pool,
                timer,
                state: state.clone(),
                syncer: syncer_handle,
                meta: RwLock::new(RoundMeta {
                    chain_config: Arc::new(chain_config),
                    participants: None,
                    current_block_num,
                    pending_chain_config: None,
                }),
                msg_tx,
                action_tx,
                send_tx,
                peer_inboxes: RwLock::new(HashMap::new()),
                shutdown: shutdown_rx.clone(),
            }
        });
        let syncer = syncer_slot
            .ok_or_else(|| ConsensusError::InvalidState("syncer was not built".into()))?;

        let host: Arc<dyn StateHost> = core.clone();
        let state_mgr = StateMgr::new(
            local,
            host,
            core.syncer.clone(),
            state.clone(),
            state_rx,
            core.config.sync_ready_timeout,
            core.config.max_syncing_check_blk_num,
            core.config.max_peer_connections,
        );

        if let Err(e) = core.update_participant_config() {
            debug!("[node {}] participants not ready: {}", local, e);
        }

        let tasks = vec![
            tokio::spawn(core.clone().msg_loop(msg_rx)),
            tokio::spawn(core.clone().action_loop(action_rx)),
            tokio::spawn(core.clone().timer_loop(timer_rx)),
            tokio::spawn(core.clone().send_loop(send_rx)),
            tokio::spawn(syncer.run(shutdown_rx.clone())),
            tokio::spawn(state_mgr.run(shutdown_rx)),
        ];
        state.try_send(StateEvent::ConfigLoaded);
        info!(
            "[node {}] started at block {}, chain config view {}",
            local,
            current_block_num,
            core.chain_config().view
        );

        Ok(Self {
            core,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_index(&self) -> PeerIndex {
        self.core.local
    }

    /// Sealed block at `height`, from the pool or the store.
    pub fn sealed_block(&self, height: u32) -> Option<Block> {
        self.core.block_pool.get_sealed_block(height).map(|(b, _)| b)
    }

    /// Drain a transport inbox into [`VbftApi::deliver`] until shutdown.
    pub fn spawn_inbound(&self, mut rx: mpsc::Receiver<(PeerIndex, Vec<u8>)>) {
        let core = self.core.clone();
        let mut shutdown = self.core.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some((from, payload)) = rx.recv() => {
                        if let Err(e) = core.deliver(from, payload).await {
                            debug!("[node {}] inbound from {} dropped: {}", core.local, from, e);
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop every loop and wait for them to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.core.timer.stop();
        self.core.peer_inboxes.write().clear();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("[node {}] stopped", self.core.local);
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }
}

#[async_trait]
impl VbftApi for VbftServer {
    async fn deliver(&self, peer: PeerIndex, payload: Vec<u8>) -> ConsensusResult<()> {
        self.core.deliver(peer, payload).await
    }

    fn peer_connected(&self, peer: PeerIndex, pubkey: PublicKey) {
        if self.core.peer_pool.peer_pubkey(peer).as_ref() != Some(&pubkey) {
            warn!(
                "[node {}] peer {} connected with unknown key {}",
                self.core.local,
                peer,
                pubkey.to_hex()
            );
            return;
        }
        if let Err(e) = self.core.on_peer_connected(peer) {
            warn!("[node {}] peer {} connect failed: {}", self.core.local, peer, e);
        }
    }

    fn peer_disconnected(&self, peer: PeerIndex) {
        self.core.on_peer_disconnected(peer);
    }

    fn current_block_num(&self) -> u32 {
        self.core.current_block_num()
    }

    fn committed_height(&self) -> u32 {
        self.core.committed_height()
    }

    fn state(&self) -> ServerState {
        self.core.state.state()
    }

    fn update_chain_config(&self, config: ChainConfig) -> ConsensusResult<()> {
        config.validate()?;
        let current_view = self.core.chain_config().view;
        if config.view <= current_view {
            return Err(ConsensusError::InvalidChainConfig(format!(
                "view {} is not above current view {}",
                config.view, current_view
            )));
        }
        info!(
            "[node {}] chain config view {} scheduled",
            self.core.local, config.view
        );
        self.core.meta.write().pending_chain_config = Some(config);
        Ok(())
    }
}

impl ServerCore {
    pub(crate) fn current_block_num(&self) -> u32 {
        self.meta.read().current_block_num
    }

    pub(crate) fn committed_height(&self) -> u32 {
        self.block_pool.chained_height()
    }

    pub(crate) fn chain_config(&self) -> Arc<ChainConfig> {
        self.meta.read().chain_config.clone()
    }

    pub(crate) fn participants(&self) -> Option<Arc<BlockParticipantConfig>> {
        self.meta.read().participants.clone()
    }

    fn is_ready(&self) -> bool {
        self.state.state().is_ready()
    }

    fn is_active(&self) -> bool {
        self.state.state().is_active()
    }

    fn pubkey_of(&self, peer: PeerIndex) -> Option<PublicKey> {
        self.peer_pool
            .peer_pubkey(peer)
            .or_else(|| self.chain_config().peer_id(peer).cloned())
    }

    fn push_action(&self, action: BftAction) {
        if let Err(e) = self.action_tx.try_send(action) {
            warn!("[node {}] action dropped: {}", self.local, e);
        }
    }

    fn send_payload(&self, to: Option<PeerIndex>, payload: Vec<u8>) {
        if let Err(e) = self.send_tx.try_send(Outbound { to, payload }) {
            warn!("[node {}] send queue: {}", self.local, e);
        }
    }

    /// Encode and queue `msg`; `None` broadcasts.
    fn send_msg(&self, to: Option<PeerIndex>, msg: &ConsensusMsg) {
        match encode_msg(msg) {
            Ok(payload) => self.send_payload(to, payload),
            Err(e) => warn!("[node {}] failed to encode {:?}: {}", self.local, msg.msg_type(), e),
        }
    }

    /// Encode `msg` and return the payload with its pool hash.
    fn encode_with_hash(msg: &ConsensusMsg) -> ConsensusResult<(Vec<u8>, Hash)> {
        let payload = encode_msg(msg)?;
        let hash = msg_hash(&payload);
        Ok((payload, hash))
    }

    fn restart_syncing(&self) {
        let committed = self.committed_height();
        info!("[node {}] restart syncing from {}", self.local, committed);
        self.state.try_send(StateEvent::ForceCheckSync(committed));
    }

    /// Rebuild the participant config for the current round.
    pub(crate) fn update_participant_config(&self) -> ConsensusResult<()> {
        let block_num = self.current_block_num();
        let prev_num = block_num
            .checked_sub(1)
            .ok_or(ConsensusError::BlockNotFound(0))?;
        let (prev, _) = self
            .block_pool
            .get_sealed_block(prev_num)
            .ok_or(ConsensusError::BlockNotFound(prev_num))?;
        let vrf = crate::domain::participant_seed(&prev)?;
        let cfg = BlockParticipantConfig::build(block_num, vrf, self.chain_config())?;
        debug!(
            "[node {}] block {} proposers {:?} endorsers {:?} committers {:?}",
            self.local, block_num, cfg.proposers, cfg.endorsers, cfg.committers
        );
        self.meta.write().participants = Some(Arc::new(cfg));
        Ok(())
    }

    async fn deliver(self: &Arc<Self>, peer: PeerIndex, payload: Vec<u8>) -> ConsensusResult<()> {
        if peer == self.local || self.peer_pool.peer_pubkey(peer).is_none() {
            return Err(ConsensusError::UnknownPeer(peer));
        }
        let existing = self.peer_inboxes.read().get(&peer).cloned();
        let inbox = match existing {
            Some(tx) => tx,
            None => self.on_peer_connected(peer)?,
        };
        inbox
            .send(payload)
            .await
            .map_err(|_| ConsensusError::ChannelClosed("peer receive"))
    }

    /// Open the receive queue of `peer`, start its heartbeat ticker and
    /// introduce ourselves.
    fn on_peer_connected(self: &Arc<Self>, peer: PeerIndex) -> ConsensusResult<mpsc::Sender<Vec<u8>>> {
        if peer == self.local {
            return Err(ConsensusError::UnknownPeer(peer));
        }
        self.peer_pool.peer_connected(peer)?;
        let (tx, rx) = mpsc::channel(self.config.peer_recv_capacity);
        {
            let mut inboxes = self.peer_inboxes.write();
            if let Some(existing) = inboxes.get(&peer) {
                return Ok(existing.clone());
            }
            inboxes.insert(peer, tx.clone());
        }
        tokio::spawn(self.clone().peer_loop(peer, rx));
        self.timer.start_peer_ticker(peer)?;

        match self.build_handshake_msg() {
            Ok(msg) => self.send_msg(Some(peer), &ConsensusMsg::Handshake(msg)),
            Err(e) => warn!("[node {}] handshake to {} failed: {}", self.local, peer, e),
        }
        match self.build_heartbeat_msg() {
            Ok(msg) => self.send_msg(Some(peer), &ConsensusMsg::Heartbeat(msg)),
            Err(e) => warn!("[node {}] heartbeat to {} failed: {}", self.local, peer, e),
        }
        info!("[node {}] peer {} connected", self.local, peer);
        Ok(tx)
    }

    fn on_peer_disconnected(&self, peer: PeerIndex) {
        self.peer_pool.peer_disconnected(peer);
        self.timer.stop_peer_ticker(peer);
        self.peer_inboxes.write().remove(&peer);
        self.state.try_send(StateEvent::UpdatePeerState(PeerState {
            peer_index: peer,
            chain_config_view: 0,
            committed_block_num: 0,
            connected: false,
        }));
        info!("[node {}] peer {} disconnected", self.local, peer);
    }

    async fn peer_loop(self: Arc<Self>, peer: PeerIndex, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                payload = rx.recv() => match payload {
                    Some(payload) => self.on_peer_payload(peer, payload).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("[node {}] receive loop for peer {} quit", self.local, peer);
    }

    async fn msg_loop(self: Arc<Self>, mut rx: mpsc::Receiver<RoundMsg>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if let Err(e) = self.handle_round_msg(msg) {
                        warn!("[node {}] round message: {}", self.local, e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("[node {}] msg loop quit", self.local);
                    return;
                }
            }
        }
    }

    async fn action_loop(self: Arc<Self>, mut rx: mpsc::Receiver<BftAction>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                Some(action) = rx.recv() => self.process_action(action),
                _ = shutdown.changed() => {
                    info!("[node {}] action loop quit", self.local);
                    return;
                }
            }
        }
    }

    async fn timer_loop(self: Arc<Self>, mut rx: mpsc::Receiver<TimerEvent>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if let Err(e) = self.process_timer_event(event) {
                        warn!(
                            "[node {}] timer {} at {}: {}",
                            self.local,
                            event.kind.name(),
                            event.block_num,
                            e
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("[node {}] timer loop quit", self.local);
                    return;
                }
            }
        }
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Outbound>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                Some(out) = rx.recv() => {
                    let result = match out.to {
                        Some(peer) => self.transport.send_to(peer, out.payload).await,
                        None => self.transport.broadcast(out.payload).await,
                    };
                    if let Err(e) = result {
                        warn!("[node {}] send to {:?} failed: {}", self.local, out.to, e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("[node {}] send loop quit", self.local);
                    return;
                }
            }
        }
    }
}

impl StateHost for ServerCore {
    fn committed_height(&self) -> u32 {
        ServerCore::committed_height(self)
    }

    fn current_block_num(&self) -> u32 {
        ServerCore::current_block_num(self)
    }

    fn chain_config(&self) -> Arc<ChainConfig> {
        ServerCore::chain_config(self)
    }

    fn active_peer_count(&self) -> usize {
        self.peer_pool.active_peer_count()
    }

    fn round_has_consensus_evidence(&self, block_num: u32) -> bool {
        let cfg = ServerCore::chain_config(self);
        let commits = self.msg_pool.get_commit_msgs(block_num);
        let Some(consensus) = get_commit_consensus(
            commits.iter().map(|c| c.as_ref()),
            cfg.c,
            cfg.n,
            |i| cfg.is_member(i),
        ) else {
            return false;
        };
        self.msg_pool
            .get_proposal(block_num, consensus.proposer)
            .is_some()
    }

    fn peer_handshake_timeout(&self) -> Duration {
        self.timer.timing().peer_handshake
    }

    fn request(&self, action: StateAction) {
        let action = match action {
            StateAction::StartNewRound => BftAction::StartNewRound,
            StateAction::FastForward => BftAction::FastForward,
            StateAction::ReBroadcast => BftAction::ReBroadcast {
                block_num: ServerCore::current_block_num(self),
            },
        };
        self.push_action(action);
    }
}

/// Syncer-facing view of the server. Weak so the syncer can be built
/// before the core it reports to.
struct CoreLink(Weak<ServerCore>);

impl CoreLink {
    fn core(&self) -> ConsensusResult<Arc<ServerCore>> {
        self.0
            .upgrade()
            .ok_or(ConsensusError::ChannelClosed("server"))
    }

    async fn send_wait(&self, peer: PeerIndex, msg: ConsensusMsg) -> ConsensusResult<()> {
        let core = self.core()?;
        let payload = encode_msg(&msg)?;
        core.send_tx
            .send(Outbound {
                to: Some(peer),
                payload,
            })
            .await
            .map_err(|_| ConsensusError::ChannelClosed("send queue"))
    }
}

impl ChainHeightSource for CoreLink {
    fn committed_height(&self) -> u32 {
        self.0.upgrade().map(|c| c.committed_height()).unwrap_or(0)
    }

    fn local_block(&self, height: u32) -> Option<Block> {
        self.0
            .upgrade()?
            .block_pool
            .get_sealed_block(height)
            .map(|(b, _)| b)
    }

    fn fault_tolerance(&self) -> u32 {
        self.0.upgrade().map(|c| c.chain_config().c).unwrap_or(0)
    }

    fn peers_reaching(&self, height: u32) -> Vec<PeerIndex> {
        let Some(core) = self.0.upgrade() else {
            return Vec::new();
        };
        core.peer_pool
            .peer_heights()
            .into_iter()
            .filter(|(_, h)| *h >= height)
            .map(|(peer, _)| peer)
            .collect()
    }
}

#[async_trait]
impl BlockFetcher for CoreLink {
    async fn request_block_info(&self, peer: PeerIndex, start: u32) -> ConsensusResult<()> {
        let msg = self.core()?.build_block_info_fetch_msg(start)?;
        self.send_wait(peer, ConsensusMsg::BlockInfoFetch(msg)).await
    }

    async fn request_block(&self, peer: PeerIndex, height: u32) -> ConsensusResult<()> {
        let msg = self.core()?.build_block_fetch_msg(height)?;
        self.send_wait(peer, ConsensusMsg::BlockFetch(msg)).await
    }

    fn cached_proposal(&self, height: u32, proposer: PeerIndex) -> Option<Block> {
        self.0
            .upgrade()?
            .msg_pool
            .get_proposal(height, proposer)
            .map(|p| p.block.clone())
    }

    fn request_timeout(&self) -> Duration {
        let timing = match self.0.upgrade() {
            Some(core) => core.timer.timing(),
            None => Arc::new(TimingConfig::default()),
        };
        timing.propose * 2
    }
}

#[async_trait]
impl SyncedBlockSink for CoreLink {
    async fn fast_forward(&self, block: Block) -> ConsensusResult<()> {
        self.core()?.fast_forward_block(block)
    }
}
