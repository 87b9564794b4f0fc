//! # Event Timer
//!
//! One timer per (event kind, block number). Starting a timer for a key that
//! already has one replaces it. Every firing lands on a single bounded queue
//! drained by the server's timer loop.
//!
//! Timeouts come from an immutable [`TimingConfig`] snapshot that is swapped
//! whole on chain config changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::TimingConfig;
use crate::domain::{ConsensusError, ConsensusResult, PeerIndex};

/// Kind of round timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerEventKind {
    ProposeBlockTimeout,
    ProposalBackoff,
    RandomBackoff,
    Propose2ndBlockTimeout,
    EndorseBlockTimeout,
    EndorseEmptyBlockTimeout,
    CommitBlockTimeout,
    PeerHeartbeat,
    TxPool,
    TxBlockTimeout,
}

impl TimerEventKind {
    pub const ALL: [TimerEventKind; 10] = [
        TimerEventKind::ProposeBlockTimeout,
        TimerEventKind::ProposalBackoff,
        TimerEventKind::RandomBackoff,
        TimerEventKind::Propose2ndBlockTimeout,
        TimerEventKind::EndorseBlockTimeout,
        TimerEventKind::EndorseEmptyBlockTimeout,
        TimerEventKind::CommitBlockTimeout,
        TimerEventKind::PeerHeartbeat,
        TimerEventKind::TxPool,
        TimerEventKind::TxBlockTimeout,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TimerEventKind::ProposeBlockTimeout => "propose",
            TimerEventKind::ProposalBackoff => "proposal_backoff",
            TimerEventKind::RandomBackoff => "random_backoff",
            TimerEventKind::Propose2ndBlockTimeout => "propose_2nd",
            TimerEventKind::EndorseBlockTimeout => "endorse",
            TimerEventKind::EndorseEmptyBlockTimeout => "endorse_empty",
            TimerEventKind::CommitBlockTimeout => "commit",
            TimerEventKind::PeerHeartbeat => "peer_heartbeat",
            TimerEventKind::TxPool => "tx_pool",
            TimerEventKind::TxBlockTimeout => "tx_block",
        }
    }
}

/// A fired timer. For `PeerHeartbeat`, `block_num` carries the peer index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: TimerEventKind,
    pub block_num: u32,
}

type TimingCell = Arc<RwLock<Arc<TimingConfig>>>;

/// Per-round timer scheduler
pub struct EventTimer {
    tx: mpsc::Sender<TimerEvent>,
    timing: TimingCell,
    timers: Mutex<HashMap<(TimerEventKind, u32), JoinHandle<()>>>,
    peer_tickers: Mutex<HashMap<PeerIndex, JoinHandle<()>>>,
}

impl EventTimer {
    pub fn new(capacity: usize, timing: Arc<TimingConfig>) -> (Self, mpsc::Receiver<TimerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                timing: Arc::new(RwLock::new(timing)),
                timers: Mutex::new(HashMap::new()),
                peer_tickers: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    pub fn timing(&self) -> Arc<TimingConfig> {
        self.timing.read().clone()
    }

    /// Swap in a new timing snapshot. Running timers keep their deadline.
    pub fn set_timing(&self, timing: Arc<TimingConfig>) {
        *self.timing.write() = timing;
    }

    fn timeout_for(&self, kind: TimerEventKind) -> Duration {
        let t = self.timing();
        match kind {
            TimerEventKind::ProposeBlockTimeout => t.propose,
            TimerEventKind::Propose2ndBlockTimeout => t.second_proposal,
            TimerEventKind::EndorseBlockTimeout => t.endorse,
            TimerEventKind::EndorseEmptyBlockTimeout => t.empty_endorse,
            TimerEventKind::CommitBlockTimeout => t.commit,
            TimerEventKind::PeerHeartbeat => t.peer_handshake,
            TimerEventKind::ProposalBackoff => t.proposal_backoff(None),
            TimerEventKind::RandomBackoff => t.random_backoff(),
            TimerEventKind::TxPool => t.tx_pool,
            TimerEventKind::TxBlockTimeout => t.zero_tx_block,
        }
    }

    /// Start (or restart) the timer for `kind` at `block_num`.
    pub fn start(&self, kind: TimerEventKind, block_num: u32) -> ConsensusResult<()> {
        self.start_after(kind, block_num, self.timeout_for(kind))
    }

    /// Backoff before a ranked proposer takes over.
    pub fn start_proposal_backoff(&self, block_num: u32, rank: Option<usize>) -> ConsensusResult<()> {
        let timeout = self.timing().proposal_backoff(rank);
        self.start_after(TimerEventKind::ProposalBackoff, block_num, timeout)
    }

    pub fn start_after(
        &self,
        kind: TimerEventKind,
        block_num: u32,
        timeout: Duration,
    ) -> ConsensusResult<()> {
        if timeout.is_zero() {
            error!("[timer] invalid timeout for {} at block {}", kind.name(), block_num);
            return Err(ConsensusError::InvalidTimeout(kind.name()));
        }
        let tx = self.tx.clone();
        let deadline = Instant::now() + timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(TimerEvent { kind, block_num }).await;
        });

        let mut timers = self.timers.lock();
        timers.retain(|_, h| !h.is_finished());
        if let Some(old) = timers.insert((kind, block_num), handle) {
            old.abort();
            debug!("[timer] {} for block {} reset", kind.name(), block_num);
        }
        Ok(())
    }

    /// Queue an event now, bypassing any timer. Returns false if the queue is full.
    pub fn fire(&self, kind: TimerEventKind, block_num: u32) -> bool {
        self.tx.try_send(TimerEvent { kind, block_num }).is_ok()
    }

    pub fn cancel(&self, kind: TimerEventKind, block_num: u32) {
        if let Some(h) = self.timers.lock().remove(&(kind, block_num)) {
            h.abort();
        }
    }

    /// Cancel every timer of the sealed round.
    pub fn on_block_sealed(&self, block_num: u32) {
        let mut timers = self.timers.lock();
        for kind in TimerEventKind::ALL {
            if let Some(h) = timers.remove(&(kind, block_num)) {
                h.abort();
            }
        }
    }

    /// Self-rescheduling heartbeat ticker for `peer`. The period follows the
    /// current timing snapshot.
    pub fn start_peer_ticker(&self, peer: PeerIndex) -> ConsensusResult<()> {
        if self.timeout_for(TimerEventKind::PeerHeartbeat).is_zero() {
            return Err(ConsensusError::InvalidTimeout(TimerEventKind::PeerHeartbeat.name()));
        }
        let tx = self.tx.clone();
        let timing = self.timing.clone();
        let handle = tokio::spawn(async move {
            loop {
                let period = timing.read().peer_handshake;
                tokio::time::sleep(period).await;
                let event = TimerEvent {
                    kind: TimerEventKind::PeerHeartbeat,
                    block_num: peer,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.peer_tickers.lock().insert(peer, handle) {
            old.abort();
        }
        Ok(())
    }

    pub fn stop_peer_ticker(&self, peer: PeerIndex) {
        if let Some(h) = self.peer_tickers.lock().remove(&peer) {
            h.abort();
        }
    }

    /// Cancel all round timers and tickers.
    pub fn stop(&self) {
        for (_, h) in self.timers.lock().drain() {
            h.abort();
        }
        for (_, h) in self.peer_tickers.lock().drain() {
            h.abort();
        }
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
