//! Inbound message and timer handling

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::domain::{
    decode_msg, msg_hash, short_hex, vrf_from_proof, vrf_input, BlockCommitMsg, BlockEndorseMsg,
    BlockProposalMsg, ConsensusError, ConsensusMsg,
    ConsensusResult, Hash, PeerHandshakeMsg, PeerHeartbeatMsg, PeerIndex, ProposalFetchMsg,
    NO_PROPOSER,
};
use crate::event_timer::{TimerEvent, TimerEventKind};
use crate::metrics;
use crate::state_mgr::{PeerState, StateEvent};
use crate::syncer::SyncReply;

use super::{BftAction, RoundMsg, ServerCore};

impl ServerCore {
    /// Decode and verify a payload from `peer`, then route it.
    pub(super) async fn on_peer_payload(&self, peer: PeerIndex, payload: Vec<u8>) {
        let msg = match decode_msg(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[node {}] undecodable payload from {}: {}", self.local, peer, e);
                metrics::record_message_rejected("decode");
                return;
            }
        };
        if let Err(e) = self.verify_from(peer, &msg) {
            warn!(
                "[node {}] {:?} from {} rejected: {}",
                self.local,
                msg.msg_type(),
                peer,
                e
            );
            metrics::record_message_rejected("signature");
            return;
        }
        self.on_consensus_msg(peer, msg, msg_hash(&payload)).await;
    }

    /// Proposals are checked against the proposer's key, everything else
    /// against the sender's. Votes must be the sender's own.
    pub(super) fn verify_from(&self, peer: PeerIndex, msg: &ConsensusMsg) -> ConsensusResult<()> {
        let signer_index = match msg {
            ConsensusMsg::Proposal(p) => p.proposer(),
            ConsensusMsg::Endorse(e) if e.endorser != peer => {
                return Err(ConsensusError::InvalidSignature(format!(
                    "endorsement for {} relayed by {}",
                    e.endorser, peer
                )))
            }
            ConsensusMsg::Commit(c) if c.committer != peer => {
                return Err(ConsensusError::InvalidSignature(format!(
                    "commit for {} relayed by {}",
                    c.committer, peer
                )))
            }
            _ => peer,
        };
        let pubkey = self
            .pubkey_of(signer_index)
            .ok_or(ConsensusError::UnknownPeer(signer_index))?;
        msg.verify(|digest, sig| self.signer.verify(&pubkey, digest, sig))
    }

    /// Route a verified message. Round messages are archived in the message
    /// pool; those for the current round are also queued for processing.
    pub(super) async fn on_consensus_msg(&self, peer: PeerIndex, msg: ConsensusMsg, hash: Hash) {
        let block_num = msg.block_num();
        match msg {
            ConsensusMsg::Proposal(m) => {
                let m = Arc::new(m);
                let process = self.archive_round_msg(m.proposer(), block_num, &hash, |current| {
                    self.msg_pool.add_proposal(m.clone(), hash, current)
                });
                if process {
                    self.enqueue_round_msg(RoundMsg::Proposal(m)).await;
                }
            }
            ConsensusMsg::Endorse(m) => {
                let m = Arc::new(m);
                let process = self.archive_round_msg(m.endorser, block_num, &hash, |current| {
                    self.msg_pool.add_endorsement(m.clone(), hash, current)
                });
                if process {
                    self.enqueue_round_msg(RoundMsg::Endorse(m)).await;
                }
            }
            ConsensusMsg::Commit(m) => {
                let m = Arc::new(m);
                let process = self.archive_round_msg(m.committer, block_num, &hash, |current| {
                    self.msg_pool.add_commit(m.clone(), hash, current)
                });
                if process {
                    self.enqueue_round_msg(RoundMsg::Commit(m)).await;
                }
            }
            ConsensusMsg::Heartbeat(m) => self.on_heartbeat(peer, m),
            ConsensusMsg::Handshake(m) => self.on_handshake(peer, m),
            ConsensusMsg::ProposalFetch(m) => self.on_proposal_fetch(peer, m),
            ConsensusMsg::BlockFetch(m) => match self.build_block_fetch_resp_msg(m.block_num) {
                Ok(resp) => self.send_msg(Some(peer), &ConsensusMsg::BlockFetchResp(resp)),
                Err(e) => debug!(
                    "[node {}] block {} requested by {}: {}",
                    self.local, m.block_num, peer, e
                ),
            },
            ConsensusMsg::BlockFetchResp(m) => {
                if m.block.hash() != m.block_hash {
                    warn!("[node {}] block {} from {} hash mismatch", self.local, m.block_number, peer);
                    return;
                }
                if let Err(e) = self.syncer.deliver(peer, SyncReply::Block(m.block)).await {
                    warn!("[node {}] sync reply dropped: {}", self.local, e);
                }
            }
            ConsensusMsg::BlockInfoFetch(m) => match self.build_block_info_resp_msg(m.start_block_num)
            {
                Ok(resp) => {
                    debug!(
                        "[node {}] serving {} block infos from {} to {}",
                        self.local,
                        resp.blocks.len(),
                        m.start_block_num,
                        peer
                    );
                    self.send_msg(Some(peer), &ConsensusMsg::BlockInfoFetchResp(resp));
                }
                Err(e) => warn!("[node {}] block infos for {}: {}", self.local, peer, e),
            },
            ConsensusMsg::BlockInfoFetchResp(m) => {
                if let Err(e) = self.syncer.deliver(peer, SyncReply::BlockInfos(m.blocks)).await {
                    warn!("[node {}] sync reply dropped: {}", self.local, e);
                }
            }
            ConsensusMsg::BlockSubmit(m) => match self.block_pool.get_exec_merkle_root(m.block_num) {
                Ok(root) if root != m.block_state_root => warn!(
                    "[node {}] exec root of block {} differs from peer {}: {} vs {}",
                    self.local,
                    m.block_num,
                    peer,
                    short_hex(&root),
                    short_hex(&m.block_state_root)
                ),
                Ok(_) => {}
                Err(e) => debug!("[node {}] block submit {}: {}", self.local, m.block_num, e),
            },
        }
    }

    /// Archive a round message unless it is a duplicate or behind the
    /// current round. A message far behind the committed height means its
    /// author lags, so it gets our heartbeat. Returns true when the message
    /// is for the current round and the node is ready to process it.
    fn archive_round_msg<F>(&self, author: PeerIndex, block_num: u32, hash: &Hash, add: F) -> bool
    where
        F: FnOnce(u32) -> ConsensusResult<bool>,
    {
        if self.msg_pool.has_msg(block_num, hash) {
            return false;
        }
        let current = self.current_block_num();
        if block_num < current {
            if block_num.saturating_add(self.config.max_syncing_check_blk_num)
                < self.committed_height()
            {
                debug!(
                    "[node {}] stale message for {} from {}, sending heartbeat",
                    self.local, block_num, author
                );
                self.timer.fire(TimerEventKind::PeerHeartbeat, author);
            }
            return false;
        }
        match add(current) {
            Ok(true) => block_num == current && self.is_ready(),
            Ok(false) | Err(ConsensusError::FarFutureMessage { .. }) => false,
            Err(e) => {
                warn!("[node {}] message pool: {}", self.local, e);
                false
            }
        }
    }

    async fn enqueue_round_msg(&self, msg: RoundMsg) {
        if self.msg_tx.send(msg).await.is_err() {
            warn!("[node {}] msg queue closed", self.local);
        }
    }

    fn on_heartbeat(&self, peer: PeerIndex, msg: PeerHeartbeatMsg) {
        let view = msg.chain_config_view;
        let height = msg.committed_block_number;
        if let Err(e) = self.peer_pool.record_heartbeat(peer, msg) {
            warn!("[node {}] heartbeat from {}: {}", self.local, peer, e);
            return;
        }
        debug!(
            "[node {}] heartbeat from {}, view {}, height {}",
            self.local, peer, view, height
        );
        self.state.try_send(StateEvent::UpdatePeerState(PeerState {
            peer_index: peer,
            chain_config_view: view,
            committed_block_num: height,
            connected: true,
        }));
        if height.saturating_add(self.config.max_syncing_check_blk_num) < self.committed_height()
        {
            self.timer.fire(TimerEventKind::PeerHeartbeat, peer);
        }
    }

    fn on_handshake(&self, peer: PeerIndex, msg: PeerHandshakeMsg) {
        let view = msg.chain_config.view;
        let height = msg.committed_block_number;
        if let Err(e) = self.peer_pool.record_handshake(peer, msg) {
            warn!("[node {}] handshake from {}: {}", self.local, peer, e);
            return;
        }
        self.state.try_send(StateEvent::UpdatePeerConfig(PeerState {
            peer_index: peer,
            chain_config_view: view,
            committed_block_num: height,
            connected: true,
        }));
    }

    fn on_proposal_fetch(&self, peer: PeerIndex, msg: ProposalFetchMsg) {
        let mut found = None;
        if msg.proposer_id == self.local || msg.block_num == self.current_block_num() {
            found = self.msg_pool.get_proposal(msg.block_num, msg.proposer_id);
        }
        if found.is_none() && msg.proposer_id == self.local {
            found = self
                .block_pool
                .get_sealed_block(msg.block_num)
                .map(|(block, _)| Arc::new(BlockProposalMsg { block }));
        }
        if let Some(p) = found {
            info!(
                "[node {}] serving proposal {} of {} to {}",
                self.local, msg.block_num, msg.proposer_id, peer
            );
            self.send_msg(Some(peer), &ConsensusMsg::Proposal(p.as_ref().clone()));
        }
    }

    /// Ask every peer for the proposal of `proposer` at `block_num`.
    pub(super) fn fetch_proposal(&self, block_num: u32, proposer: PeerIndex) {
        match self.build_proposal_fetch_msg(block_num, proposer) {
            Ok(msg) => self.send_msg(None, &ConsensusMsg::ProposalFetch(msg)),
            Err(e) => warn!(
                "[node {}] proposal fetch {} of {}: {}",
                self.local, block_num, proposer, e
            ),
        }
    }

    /// Process a round message now if the node is ready.
    pub(super) fn process_consensus_msg(&self, msg: RoundMsg) {
        if !self.is_ready() {
            return;
        }
        if let Err(e) = self.handle_round_msg(msg) {
            warn!("[node {}] round message: {}", self.local, e);
        }
    }

    pub(super) fn handle_round_msg(&self, msg: RoundMsg) -> ConsensusResult<()> {
        match msg {
            RoundMsg::Proposal(p) => self.handle_proposal(p),
            RoundMsg::Endorse(e) => self.handle_endorse(e),
            RoundMsg::Commit(c) => self.handle_commit(c),
        }
    }

    pub(super) fn verify_prev_block_hash(&self, proposal: &BlockProposalMsg) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        let prev_num = block_num
            .checked_sub(1)
            .ok_or(ConsensusError::PrevBlockHashMismatch { block_num })?;
        let (_, prev_hash) = self
            .block_pool
            .get_sealed_block(prev_num)
            .ok_or(ConsensusError::BlockNotFound(prev_num))?;
        if prev_hash != proposal.block.prev_block_hash() {
            debug!(
                "[node {}] prev hash {} vs {} at {}",
                self.local,
                short_hex(&prev_hash),
                short_hex(&proposal.block.prev_block_hash()),
                block_num
            );
            return Err(ConsensusError::PrevBlockHashMismatch { block_num });
        }
        Ok(())
    }

    /// The proof must be the proposer's signature over the VRF input of the
    /// round, and the value its hash.
    fn verify_vrf(&self, proposal: &BlockProposalMsg) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        let prev_num = block_num
            .checked_sub(1)
            .ok_or(ConsensusError::InvalidVrf(block_num))?;
        let (prev, _) = self
            .block_pool
            .get_sealed_block(prev_num)
            .ok_or(ConsensusError::BlockNotFound(prev_num))?;
        let pubkey = self
            .pubkey_of(proposal.proposer())
            .ok_or(ConsensusError::UnknownPeer(proposal.proposer()))?;
        let info = proposal.block.info();
        let input = vrf_input(block_num, &prev.info().vrf_value)?;
        self.signer
            .verify(&pubkey, &input, &info.vrf_proof)
            .map_err(|_| ConsensusError::InvalidVrf(block_num))?;
        if vrf_from_proof(&info.vrf_proof) != info.vrf_value {
            return Err(ConsensusError::InvalidVrf(block_num));
        }
        Ok(())
    }

    pub(super) fn find_block_proposal(
        &self,
        block_num: u32,
        proposer: PeerIndex,
    ) -> Option<Arc<BlockProposalMsg>> {
        self.block_pool
            .get_block_proposals(block_num)
            .into_iter()
            .find(|p| p.proposer() == proposer)
            .or_else(|| self.msg_pool.get_proposal(block_num, proposer))
    }

    fn handle_proposal(&self, proposal: Arc<BlockProposalMsg>) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        if block_num != self.current_block_num() {
            return Ok(());
        }
        if let Err(e) = self.verify_vrf(&proposal) {
            metrics::record_message_rejected("vrf");
            return Err(e);
        }
        self.block_pool.new_block_proposal(proposal.clone())?;

        let proposer = proposal.proposer();
        if self.is_proposer(block_num, proposer) {
            self.verify_prev_block_hash(&proposal)?;
            self.timer.cancel(TimerEventKind::ProposeBlockTimeout, block_num);
            if self.is_endorser(block_num, self.local) {
                self.endorse_block(&proposal, false)?;
            }
        } else if self.is_proposer(block_num, self.local) {
            if let Some(own) = self.msg_pool.get_proposal(block_num, self.local) {
                info!(
                    "[node {}] rebroadcast proposal {} after one from {}",
                    self.local, block_num, proposer
                );
                self.send_msg(None, &ConsensusMsg::Proposal(own.as_ref().clone()));
            }
        }
        Ok(())
    }

    fn handle_endorse(&self, endorse: Arc<BlockEndorseMsg>) -> ConsensusResult<()> {
        let block_num = endorse.block_num;
        if self.block_pool.committed_for_block(block_num) || block_num != self.current_block_num() {
            return Ok(());
        }
        self.block_pool.new_block_endorsement(&endorse)?;
        info!(
            "[node {}] endorse from {} for proposer {} at {}, empty {}",
            self.local, endorse.endorser, endorse.endorsed_proposer, block_num, endorse.endorse_for_empty
        );

        let c = self.chain_config().c;
        if self.is_endorser(block_num, endorse.endorser) {
            if let Some(quorum) = self.block_pool.endorse_done(block_num, c) {
                self.timer.cancel(TimerEventKind::EndorseBlockTimeout, block_num);
                self.timer.cancel(TimerEventKind::EndorseEmptyBlockTimeout, block_num);
                let proposal = quorum
                    .proposal
                    .or_else(|| self.find_block_proposal(block_num, quorum.proposer));
                match proposal {
                    None => info!(
                        "[node {}] endorse {} done, waiting proposal from {}",
                        self.local, block_num, quorum.proposer
                    ),
                    Some(p) if self.is_committer(block_num, self.local) => {
                        self.commit_block(&p, quorum.for_empty)?;
                    }
                    Some(_) => {}
                }
            }
        }
        if self.block_pool.endorse_failed(block_num, c) {
            self.timer.fire(TimerEventKind::EndorseBlockTimeout, block_num);
        }
        Ok(())
    }

    fn handle_commit(&self, commit: Arc<BlockCommitMsg>) -> ConsensusResult<()> {
        let block_num = commit.block_num;
        if block_num != self.current_block_num() {
            return Ok(());
        }
        info!(
            "[node {}] commit from {} for proposer {} at {}, empty {}",
            self.local, commit.committer, commit.block_proposer, block_num, commit.commit_for_empty
        );
        self.block_pool.new_block_commitment(commit)?;
        self.check_commit_done(block_num)
    }

    /// Seal once the round has commit consensus and the proposal is known.
    fn check_commit_done(&self, block_num: u32) -> ConsensusResult<()> {
        let cfg = self.chain_config();
        let Some(consensus) = self
            .block_pool
            .commit_done(block_num, cfg.c, cfg.n, |i| cfg.is_member(i))
        else {
            return Ok(());
        };
        self.block_pool.set_commit_done(block_num);
        match self.find_block_proposal(block_num, consensus.proposer) {
            Some(p) => {
                self.timer.cancel(TimerEventKind::CommitBlockTimeout, block_num);
                self.make_sealed(p, consensus.for_empty)
            }
            None => {
                info!("[node {}] commit {} done, waiting proposal", self.local, block_num);
                Ok(())
            }
        }
    }

    pub(super) fn make_sealed(
        &self,
        proposal: Arc<BlockProposalMsg>,
        for_empty: bool,
    ) -> ConsensusResult<()> {
        if let Err(e) = self.verify_prev_block_hash(&proposal) {
            self.restart_syncing();
            return Err(e);
        }
        info!(
            "[node {}] ready to seal {} from proposer {}, empty {}",
            self.local,
            proposal.block_num(),
            proposal.proposer(),
            for_empty
        );
        self.push_action(BftAction::SealBlock { proposal, for_empty });
        Ok(())
    }

    pub(super) fn process_timer_event(&self, event: TimerEvent) -> ConsensusResult<()> {
        let block_num = event.block_num;
        match event.kind {
            TimerEventKind::ProposalBackoff => {
                if self.block_pool.endorsed_for_block(block_num) || !self.is_ready() {
                    return Ok(());
                }
                if self.block_pool.get_block_proposals(block_num).is_empty()
                    && self.is_2nd_proposer(block_num, self.local)
                {
                    self.make_proposal(block_num, false)?;
                }
                Ok(())
            }
            TimerEventKind::ProposeBlockTimeout
            | TimerEventKind::RandomBackoff
            | TimerEventKind::Propose2ndBlockTimeout => self.handle_proposal_timeout(event),
            TimerEventKind::EndorseBlockTimeout => self.on_endorse_timeout(block_num),
            TimerEventKind::EndorseEmptyBlockTimeout => self.on_empty_endorse_timeout(block_num),
            TimerEventKind::CommitBlockTimeout => self.on_commit_timeout(block_num),
            TimerEventKind::PeerHeartbeat => {
                let msg = ConsensusMsg::Heartbeat(self.build_heartbeat_msg()?);
                let to = (block_num != NO_PROPOSER).then_some(block_num);
                self.send_msg(to, &msg);
                Ok(())
            }
            TimerEventKind::TxPool => {
                if block_num < self.current_block_num() {
                    return Ok(());
                }
                let current = self.current_block_num();
                if self.committed_height() + 1 == current
                    && !self.tx_pool.pending_transactions(1).is_empty()
                {
                    self.timer.cancel(TimerEventKind::TxBlockTimeout, current);
                    self.start_new_proposal(current)
                } else {
                    self.timer.start(TimerEventKind::TxPool, current)
                }
            }
            TimerEventKind::TxBlockTimeout => {
                if block_num < self.current_block_num() {
                    return Ok(());
                }
                self.timer.cancel(TimerEventKind::TxPool, block_num);
                self.start_new_proposal(block_num)
            }
        }
    }

    fn handle_proposal_timeout(&self, event: TimerEvent) -> ConsensusResult<()> {
        let block_num = event.block_num;
        if self.block_pool.endorsed_for_block(block_num) || !self.is_ready() {
            return Ok(());
        }
        let proposals = self.block_pool.get_block_proposals(block_num);
        info!(
            "[node {}] {} timeout at {}, {} proposals",
            self.local,
            event.kind.name(),
            block_num,
            proposals.len()
        );

        if proposals.is_empty() {
            return match event.kind {
                TimerEventKind::ProposeBlockTimeout => {
                    self.timer.start(TimerEventKind::RandomBackoff, block_num)
                }
                TimerEventKind::RandomBackoff => {
                    self.make_proposal(block_num, true)?;
                    self.timer.start(TimerEventKind::Propose2ndBlockTimeout, block_num)
                }
                _ => {
                    error!("[node {}] no proposal for {} after backoff", self.local, block_num);
                    self.restart_syncing();
                    Ok(())
                }
            };
        }
        if event.kind == TimerEventKind::RandomBackoff {
            return Ok(());
        }

        let proposal = match self.get_highest_rank_proposal(block_num, &proposals) {
            Ok(p) => p,
            Err(e) => {
                error!("[node {}] {}", self.local, e);
                return Ok(());
            }
        };
        // the leader's proposal is endorsed when it arrives
        if self.is_proposer(block_num, proposal.proposer()) {
            return Ok(());
        }
        self.push_action(BftAction::EndorseBlock {
            proposal,
            for_empty: false,
        });
        Ok(())
    }

    fn on_endorse_timeout(&self, block_num: u32) -> ConsensusResult<()> {
        if self.block_pool.committed_for_block(block_num) || !self.is_ready() {
            return Ok(());
        }
        let c = self.chain_config().c;
        if let Some(quorum) = self.block_pool.endorse_done(block_num, c) {
            let proposal = quorum
                .proposal
                .or_else(|| self.find_block_proposal(block_num, quorum.proposer));
            let Some(proposal) = proposal else {
                self.fetch_proposal(block_num, quorum.proposer);
                self.timer.start(TimerEventKind::EndorseBlockTimeout, block_num)?;
                return Err(ConsensusError::ProposalNotFound {
                    block_num,
                    proposer: quorum.proposer,
                });
            };
            if let Err(e) = self.verify_prev_block_hash(&proposal) {
                self.timer.start(TimerEventKind::EndorseBlockTimeout, block_num)?;
                return Err(e);
            }
            return self.commit_block(&proposal, quorum.for_empty);
        }
        if !self.is_active() || self.block_pool.endorsed_for_empty_block(block_num) {
            return Ok(());
        }
        let proposals = self.block_pool.get_block_proposals(block_num);
        if proposals.is_empty() {
            error!("[node {}] endorse timeout at {} without proposals", self.local, block_num);
            self.restart_syncing();
            return Ok(());
        }
        let proposal = self.get_highest_rank_proposal(block_num, &proposals)?;
        self.endorse_block(&proposal, true)
    }

    fn on_empty_endorse_timeout(&self, block_num: u32) -> ConsensusResult<()> {
        if self.block_pool.committed_for_block(block_num) || !self.is_ready() {
            return Ok(());
        }
        let c = self.chain_config().c;
        if let Some(quorum) = self.block_pool.endorse_done(block_num, c) {
            let proposal = quorum
                .proposal
                .or_else(|| self.find_block_proposal(block_num, quorum.proposer));
            return match proposal {
                Some(p) => self.commit_block(&p, quorum.for_empty),
                None => {
                    self.fetch_proposal(block_num, quorum.proposer);
                    self.timer.start(TimerEventKind::EndorseEmptyBlockTimeout, block_num)
                }
            };
        }
        warn!("[node {}] empty endorse timeout at {} without quorum", self.local, block_num);
        if self.is_active() {
            return self.timer.start(TimerEventKind::EndorseEmptyBlockTimeout, block_num);
        }
        let proposals = self.block_pool.get_block_proposals(block_num);
        if proposals.is_empty() {
            return Ok(());
        }
        let proposal = self.get_highest_rank_proposal(block_num, &proposals)?;
        self.endorse_block(&proposal, true)
    }

    fn on_commit_timeout(&self, block_num: u32) -> ConsensusResult<()> {
        if self.block_pool.get_sealed_block(block_num).is_some() || !self.is_ready() {
            return Ok(());
        }
        if self.block_pool.is_commit_had_done(block_num) {
            return Ok(());
        }
        let cfg = self.chain_config();
        match self
            .block_pool
            .commit_done(block_num, cfg.c, cfg.n, |i| cfg.is_member(i))
        {
            Some(consensus) => {
                self.block_pool.set_commit_done(block_num);
                match self.find_block_proposal(block_num, consensus.proposer) {
                    Some(p) => self.make_sealed(p, consensus.for_empty),
                    None => {
                        self.restart_syncing();
                        Err(ConsensusError::ProposalNotFound {
                            block_num,
                            proposer: consensus.proposer,
                        })
                    }
                }
            }
            None => {
                error!("[node {}] commit timeout at {} without consensus", self.local, block_num);
                self.restart_syncing();
                Ok(())
            }
        }
    }
}
