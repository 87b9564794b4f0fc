//! # Block Syncer
//!
//! Catch-up for a node that is behind its peers.
//!
//! A [`BlockSyncReq`] starts one peer syncer task per target peer. Each task
//! fetches block infos, then the block bodies (from the local proposal cache
//! when possible), and hands every block back to the main loop. The main
//! loop advances one height at a time and only when peers agree:
//!
//! ```text
//!   BlockSyncReq ─► Syncer ─┬─► PeerSyncer(p1) ─┐
//!                           ├─► PeerSyncer(p2) ─┼─► blocks by height ─► majority? ─► fast_forward
//!                           └─► PeerSyncer(p3) ─┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{Block, BlockInfo, ConsensusError, ConsensusResult, Hash, PeerIndex};
use crate::ports::{BlockFetcher, ChainHeightSource, SyncedBlockSink};
use crate::state_mgr::{StateEvent, StateHandle};

/// Request to sync `[start_block_num, target_block_num]` from `target_peers`.
/// A zero target cancels the listed peers' syncers. An empty peer list
/// syncs from every connected peer that has reported the target height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSyncReq {
    pub target_peers: Vec<PeerIndex>,
    pub start_block_num: u32,
    pub target_block_num: u32,
}

/// Fetch response routed from the server to a peer syncer
#[derive(Clone, Debug)]
pub enum SyncReply {
    BlockInfos(Vec<BlockInfo>),
    Block(Block),
}

struct BlockFromPeer {
    from: PeerIndex,
    block: Block,
}

struct SyncProgress {
    next: AtomicU32,
    target: AtomicU32,
}

/// Cheap handle to a running [`Syncer`]
#[derive(Clone)]
pub struct SyncerHandle {
    req_tx: mpsc::Sender<BlockSyncReq>,
    msg_tx: mpsc::Sender<(PeerIndex, SyncReply)>,
    progress: Arc<SyncProgress>,
}

impl SyncerHandle {
    /// Syncing is in progress while `next <= target`.
    pub fn is_active(&self) -> bool {
        self.next_block_num() <= self.target_block_num()
    }

    pub fn next_block_num(&self) -> u32 {
        self.progress.next.load(Ordering::Acquire)
    }

    pub fn target_block_num(&self) -> u32 {
        self.progress.target.load(Ordering::Acquire)
    }

    /// Queue a sync request without waiting. Returns false if the queue is full.
    pub fn request(&self, req: BlockSyncReq) -> bool {
        match self.req_tx.try_send(req) {
            Ok(()) => true,
            Err(e) => {
                warn!("[syncer] sync request dropped: {}", e);
                false
            }
        }
    }

    /// Route a fetch response from `peer`.
    pub async fn deliver(&self, peer: PeerIndex, reply: SyncReply) -> ConsensusResult<()> {
        self.msg_tx
            .send((peer, reply))
            .await
            .map_err(|_| ConsensusError::ChannelClosed("sync message"))
    }
}

/// Block agreed by more than `c` peers on both proposer and previous
/// execution root.
pub fn block_consensus_done(blocks: &BTreeMap<PeerIndex, Block>, c: u32) -> Option<&Block> {
    let mut votes: BTreeMap<(PeerIndex, Hash), Vec<&Block>> = BTreeMap::new();
    for block in blocks.values() {
        votes
            .entry((block.proposer(), block.prev_exec_merkle_root))
            .or_default()
            .push(block);
    }
    votes
        .into_values()
        .find(|v| v.len() > c as usize)
        .and_then(|v| v.first().copied())
}

struct PeerSyncerState {
    next: u32,
    target: u32,
    active: bool,
}

struct PeerSyncer {
    state: Arc<Mutex<PeerSyncerState>>,
    tx: mpsc::Sender<SyncReply>,
    task: Option<JoinHandle<()>>,
}

impl PeerSyncer {
    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn stop(&mut self) {
        self.state.lock().active = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Channel sizes for a [`Syncer`]
#[derive(Clone, Copy, Debug)]
pub struct SyncerCapacity {
    pub requests: usize,
    pub messages: usize,
    pub blocks: usize,
    pub per_peer: usize,
}

/// Main syncer loop
pub struct Syncer {
    local: PeerIndex,
    source: Arc<dyn ChainHeightSource>,
    fetcher: Arc<dyn BlockFetcher>,
    sink: Arc<dyn SyncedBlockSink>,
    state: StateHandle,
    progress: Arc<SyncProgress>,
    req_rx: mpsc::Receiver<BlockSyncReq>,
    msg_rx: mpsc::Receiver<(PeerIndex, SyncReply)>,
    block_tx: mpsc::Sender<BlockFromPeer>,
    block_rx: mpsc::Receiver<BlockFromPeer>,
    per_peer_capacity: usize,
    peers: HashMap<PeerIndex, PeerSyncer>,
    pending: BTreeMap<u32, BTreeMap<PeerIndex, Block>>,
}

impl Syncer {
    pub fn new(
        local: PeerIndex,
        source: Arc<dyn ChainHeightSource>,
        fetcher: Arc<dyn BlockFetcher>,
        sink: Arc<dyn SyncedBlockSink>,
        state: StateHandle,
        capacity: SyncerCapacity,
    ) -> (Self, SyncerHandle) {
        let (req_tx, req_rx) = mpsc::channel(capacity.requests);
        let (msg_tx, msg_rx) = mpsc::channel(capacity.messages);
        let (block_tx, block_rx) = mpsc::channel(capacity.blocks);
        let progress = Arc::new(SyncProgress {
            next: AtomicU32::new(1),
            target: AtomicU32::new(0),
        });
        let handle = SyncerHandle {
            req_tx,
            msg_tx,
            progress: progress.clone(),
        };
        (
            Self {
                local,
                source,
                fetcher,
                sink,
                state,
                progress,
                req_rx,
                msg_rx,
                block_tx,
                block_rx,
                per_peer_capacity: capacity.per_peer,
                peers: HashMap::new(),
                pending: BTreeMap::new(),
            },
            handle,
        )
    }

    #[cfg(test)]
    pub(crate) fn into_request_rx(self) -> mpsc::Receiver<BlockSyncReq> {
        self.req_rx
    }

    fn next(&self) -> u32 {
        self.progress.next.load(Ordering::Acquire)
    }

    fn target(&self) -> u32 {
        self.progress.target.load(Ordering::Acquire)
    }

    fn set_bounds(&self, next: u32, target: u32) {
        self.progress.next.store(next, Ordering::Release);
        self.progress.target.store(target, Ordering::Release);
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                Some(req) = self.req_rx.recv() => self.on_sync_req(req),
                Some((peer, reply)) = self.msg_rx.recv() => self.route_reply(peer, reply),
                Some(fetched) = self.block_rx.recv() => self.on_block_from_peer(fetched).await,
                _ = shutdown.changed() => {
                    info!("[node {}] syncer quit", self.local);
                    break;
                }
            }
        }
        for syncer in self.peers.values_mut() {
            syncer.stop();
        }
    }

    fn on_sync_req(&mut self, mut req: BlockSyncReq) {
        if req.target_block_num == 0 {
            for peer in &req.target_peers {
                if let Some(syncer) = self.peers.get_mut(peer) {
                    syncer.stop();
                }
            }
            return;
        }
        info!(
            "[node {}] sync req ({}, {}) from {:?}",
            self.local, req.start_block_num, req.target_block_num, req.target_peers
        );
        let committed = self.source.committed_height();
        if req.start_block_num <= committed {
            req.start_block_num = committed + 1;
        }
        if req.target_block_num <= self.target() {
            return;
        }
        let next = if self.next() == 1 {
            req.start_block_num
        } else {
            self.next()
        };
        self.set_bounds(next, req.target_block_num);

        let peers = if req.target_peers.is_empty() {
            self.source.peers_reaching(req.target_block_num)
        } else {
            req.target_peers
        };
        for peer in peers {
            self.start_peer_syncer(peer);
        }
    }

    fn start_peer_syncer(&mut self, peer: PeerIndex) {
        let target = self.target();
        if let Some(existing) = self.peers.get(&peer) {
            if existing.is_active() {
                let mut st = existing.state.lock();
                st.target = st.target.max(target);
                return;
            }
        }
        let start = self
            .peers
            .get(&peer)
            .map(|p| p.state.lock().next)
            .unwrap_or(0)
            .max(self.next());
        if start > target {
            return;
        }

        let state = Arc::new(Mutex::new(PeerSyncerState {
            next: start,
            target,
            active: true,
        }));
        let (tx, rx) = mpsc::channel(self.per_peer_capacity);
        let task = tokio::spawn(run_peer_syncer(
            self.local,
            peer,
            state.clone(),
            rx,
            self.fetcher.clone(),
            self.block_tx.clone(),
        ));
        self.peers.insert(
            peer,
            PeerSyncer {
                state,
                tx,
                task: Some(task),
            },
        );
    }

    fn route_reply(&mut self, peer: PeerIndex, reply: SyncReply) {
        match self.peers.get(&peer) {
            Some(syncer) if syncer.is_active() => {
                if syncer.tx.try_send(reply).is_err() {
                    debug!("[node {}] peer syncer {} busy, reply dropped", self.local, peer);
                }
            }
            _ => debug!("[node {}] sync reply from idle peer {}", self.local, peer),
        }
    }

    async fn on_block_from_peer(&mut self, fetched: BlockFromPeer) {
        let block_num = fetched.block.block_num();
        if block_num < self.next() {
            return;
        }
        debug!(
            "[node {}] next {}, target {}, from {} block {} proposer {}",
            self.local,
            self.next(),
            self.target(),
            fetched.from,
            block_num,
            fetched.block.proposer()
        );
        self.pending
            .entry(block_num)
            .or_default()
            .insert(fetched.from, fetched.block);
        if block_num != self.next() {
            return;
        }

        let c = self.source.fault_tolerance();
        while self.next() <= self.target() {
            let next = self.next();
            let block = match self.agreed_block(next, c) {
                Ok(Some(b)) => b,
                Ok(None) => break,
                Err(e) => {
                    warn!("[node {}] sync halted at {}: {}", self.local, next, e);
                    break;
                }
            };
            if let Err(e) = self.sink.fast_forward(block).await {
                error!("[node {}] syncer fast-forward of {} failed: {}", self.local, next, e);
                break;
            }
            self.pending.remove(&next);
            self.progress.next.store(next + 1, Ordering::Release);
        }

        if self.next() > self.target() {
            let target = self.target();
            info!("[node {}] sync done at {}", self.local, target);
            if self.state.send(StateEvent::SyncDone(target)).await.is_err() {
                warn!("[node {}] state manager gone", self.local);
            }
            for syncer in self.peers.values_mut() {
                syncer.stop();
            }
            self.pending.clear();
            self.set_bounds(1, 0);
        }
    }

    /// Block to apply at `height`, if peers agree on one.
    fn agreed_block(&self, height: u32, c: u32) -> ConsensusResult<Option<Block>> {
        let from_peers = self.pending.get(&height);
        let majority = from_peers.and_then(|b| block_consensus_done(b, c));

        if height <= self.source.committed_height() {
            if let Some(local) = self.source.local_block(height) {
                if let Some(m) = majority {
                    if m.prev_exec_merkle_root != local.prev_exec_merkle_root {
                        return Err(ConsensusError::SyncMismatch(height));
                    }
                }
                return Ok(Some(local));
            }
        }
        Ok(majority.cloned())
    }
}

async fn wait_reply(
    rx: &mut mpsc::Receiver<SyncReply>,
    fetcher: &dyn BlockFetcher,
) -> ConsensusResult<SyncReply> {
    match tokio::time::timeout(fetcher.request_timeout(), rx.recv()).await {
        Ok(Some(reply)) => Ok(reply),
        Ok(None) => Err(ConsensusError::ChannelClosed("peer syncer")),
        Err(_) => Err(ConsensusError::Transport("sync request timed out".into())),
    }
}

async fn run_peer_syncer(
    local: PeerIndex,
    peer: PeerIndex,
    state: Arc<Mutex<PeerSyncerState>>,
    mut rx: mpsc::Receiver<SyncReply>,
    fetcher: Arc<dyn BlockFetcher>,
    out: mpsc::Sender<BlockFromPeer>,
) {
    info!("[node {}] peer syncer {} started", local, peer);
    if let Err(e) = peer_sync_loop(peer, &state, &mut rx, fetcher.as_ref(), &out).await {
        warn!("[node {}] peer syncer {} quit: {}", local, peer, e);
    }
    state.lock().active = false;
}

async fn peer_sync_loop(
    peer: PeerIndex,
    state: &Mutex<PeerSyncerState>,
    rx: &mut mpsc::Receiver<SyncReply>,
    fetcher: &dyn BlockFetcher,
    out: &mpsc::Sender<BlockFromPeer>,
) -> ConsensusResult<()> {
    let mut proposers: BTreeMap<u32, PeerIndex> = BTreeMap::new();
    loop {
        let (height, target) = {
            let st = state.lock();
            (st.next, st.target)
        };
        if height > target {
            return Ok(());
        }

        if !proposers.contains_key(&height) {
            fetcher.request_block_info(peer, height).await?;
            if let SyncReply::BlockInfos(infos) = wait_reply(rx, fetcher).await? {
                proposers.extend(infos.into_iter().map(|i| (i.block_num, i.proposer)));
            }
        }
        let proposer = *proposers
            .get(&height)
            .ok_or(ConsensusError::BlockNotFound(height))?;

        let block = match fetcher.cached_proposal(height, proposer) {
            Some(b) => b,
            None => {
                fetcher.request_block(peer, height).await?;
                match wait_reply(rx, fetcher).await? {
                    SyncReply::Block(b) if b.block_num() == height => b,
                    _ => return Err(ConsensusError::BlockNotFound(height)),
                }
            }
        };

        out.send(BlockFromPeer { from: peer, block })
            .await
            .map_err(|_| ConsensusError::ChannelClosed("syncer blocks"))?;
        proposers.remove(&height);
        let Some(next) = height.checked_add(1) else {
            return Ok(());
        };
        state.lock().next = next;
    }
}
