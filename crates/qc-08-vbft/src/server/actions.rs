//! Protocol actions: propose, endorse, commit, seal, fast-forward and
//! re-broadcast, plus the round bootstrap.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::domain::{
    get_commit_consensus, short_hex, Block, BlockProposalMsg, ChainConfig, ConsensusError,
    ConsensusMsg, ConsensusResult, PeerIndex,
};
use crate::event_timer::TimerEventKind;
use crate::metrics;

use super::{BftAction, RoundMsg, ServerCore};

impl ServerCore {
    pub(super) fn process_action(&self, action: BftAction) {
        let result = match action {
            BftAction::MakeProposal {
                block_num,
                for_empty,
            } => {
                let current = self.current_block_num();
                if current > block_num
                    || self.msg_pool.get_proposal(current, self.local).is_some()
                {
                    return;
                }
                self.make_proposal(current, for_empty)
            }
            BftAction::EndorseBlock {
                proposal,
                for_empty,
            } => self.endorse_block(&proposal, for_empty),
            BftAction::CommitBlock {
                proposal,
                for_empty,
            } => self.commit_block(&proposal, for_empty),
            BftAction::SealBlock {
                proposal,
                for_empty,
            } => {
                if proposal.block_num() < self.current_block_num() {
                    return;
                }
                self.seal_proposal(&proposal, for_empty)
            }
            BftAction::FastForward => {
                self.fast_forward();
                Ok(())
            }
            BftAction::ReBroadcast { block_num } => {
                if self.current_block_num() > block_num {
                    return;
                }
                self.rebroadcast();
                Ok(())
            }
            BftAction::StartNewRound => self.start_new_round(),
        };
        if let Err(e) = result {
            warn!("[node {}] action failed: {}", self.local, e);
        }
    }

    /// Propose for `block_num`, process the proposal locally and broadcast it.
    pub(super) fn make_proposal(&self, block_num: u32, for_empty: bool) -> ConsensusResult<()> {
        if block_num < self.current_block_num() {
            return Err(ConsensusError::OutOfOrderSeal {
                block_num,
                current: self.current_block_num(),
            });
        }
        let proposal = Arc::new(self.build_proposal_msg(block_num, for_empty)?);
        let msg = ConsensusMsg::Proposal(proposal.as_ref().clone());
        let (payload, hash) = Self::encode_with_hash(&msg)?;
        self.msg_pool
            .add_proposal(proposal.clone(), hash, self.current_block_num())?;
        info!(
            "[node {}] proposing {} with {} txs, empty {}",
            self.local,
            block_num,
            proposal.block.block.transactions.len(),
            for_empty
        );
        metrics::record_proposal_made();
        self.process_consensus_msg(RoundMsg::Proposal(proposal));
        self.send_payload(None, payload);
        Ok(())
    }

    /// Endorse `proposal` (or its empty variant). Endorsers broadcast the
    /// vote; other nodes only record it and wait for the endorse timeout.
    pub(super) fn endorse_block(
        &self,
        proposal: &Arc<BlockProposalMsg>,
        mut for_empty: bool,
    ) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        if (!for_empty && self.block_pool.endorsed_for_block(block_num))
            || (for_empty && self.block_pool.endorsed_for_empty_block(block_num))
        {
            return Ok(());
        }
        if !for_empty && self.block_pool.endorse_failed(block_num, self.chain_config().c) {
            for_empty = true;
        }

        let endorse = Arc::new(self.build_endorse_msg(proposal, for_empty)?);
        self.block_pool
            .set_proposal_endorsed(proposal.clone(), for_empty)?;

        if for_empty || self.is_endorser(block_num, self.local) {
            let msg = ConsensusMsg::Endorse(endorse.as_ref().clone());
            let (payload, hash) = Self::encode_with_hash(&msg)?;
            self.msg_pool
                .add_endorsement(endorse.clone(), hash, self.current_block_num())?;
            info!(
                "[node {}] endorsing {} from proposer {}, empty {}",
                self.local,
                block_num,
                proposal.proposer(),
                for_empty
            );
            self.process_consensus_msg(RoundMsg::Endorse(endorse));
            self.send_payload(None, payload);
        } else {
            self.process_consensus_msg(RoundMsg::Endorse(endorse));
            let kind = if for_empty {
                TimerEventKind::EndorseEmptyBlockTimeout
            } else {
                TimerEventKind::EndorseBlockTimeout
            };
            self.timer.start(kind, block_num)?;
        }
        Ok(())
    }

    /// Commit to `proposal` (or its empty variant).
    pub(super) fn commit_block(
        &self,
        proposal: &Arc<BlockProposalMsg>,
        for_empty: bool,
    ) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        if self.block_pool.committed_for_block(block_num) {
            return Ok(());
        }
        let commit = Arc::new(self.build_commit_msg(proposal, for_empty)?);
        self.block_pool
            .set_proposal_committed(proposal.clone(), for_empty)?;

        if for_empty || self.is_committer(block_num, self.local) {
            let msg = ConsensusMsg::Commit(commit.as_ref().clone());
            let (payload, hash) = Self::encode_with_hash(&msg)?;
            self.msg_pool
                .add_commit(commit.clone(), hash, self.current_block_num())?;
            info!(
                "[node {}] committing {} from proposer {}, empty {}, {} endorsements",
                self.local,
                block_num,
                proposal.proposer(),
                for_empty,
                commit.endorsers_sig.len()
            );
            self.process_consensus_msg(RoundMsg::Commit(commit));
            self.send_payload(None, payload);
        } else {
            self.process_consensus_msg(RoundMsg::Commit(commit));
            self.timer.start(TimerEventKind::CommitBlockTimeout, block_num)?;
        }
        Ok(())
    }

    fn seal_proposal(&self, proposal: &BlockProposalMsg, for_empty: bool) -> ConsensusResult<()> {
        self.seal_block(&proposal.block, for_empty, true)?;
        if self.has_block_consensused() {
            self.push_action(BftAction::FastForward);
            Ok(())
        } else {
            self.start_new_round()
        }
    }

    /// More than `C` commits in the message pool already agree on a proposer
    /// (or on the empty block) for the new current round.
    fn has_block_consensused(&self) -> bool {
        let c = self.chain_config().c as usize;
        let mut per_proposer: BTreeMap<PeerIndex, usize> = BTreeMap::new();
        let mut empty = 0usize;
        for commit in self.msg_pool.get_commit_msgs(self.current_block_num()) {
            if commit.commit_for_empty {
                empty += 1;
            }
            *per_proposer.entry(commit.block_proposer).or_default() += 1;
        }
        empty > c || per_proposer.values().any(|n| *n > c)
    }

    /// Seal `block` as the current round's block. A round already behind us
    /// is a no-op; one ahead of us forces a sync.
    pub(super) fn seal_block(&self, block: &Block, for_empty: bool, add_sigs: bool) -> ConsensusResult<()> {
        let block_num = block.block_num();
        let current = self.current_block_num();
        if block_num < current {
            debug!("[node {}] late seal of {} (current {})", self.local, block_num, current);
            return Ok(());
        }
        if block_num > current {
            self.restart_syncing();
            return Err(ConsensusError::OutOfOrderSeal { block_num, current });
        }

        let sealed = self
            .block_pool
            .set_block_sealed(block, for_empty, add_sigs, |i| self.pubkey_of(i))?;

        self.timer.on_block_sealed(block_num);
        self.msg_pool.on_block_sealed(block_num);
        self.block_pool.on_block_sealed(block_num);
        self.tx_pool.on_block_sealed(&sealed);
        metrics::record_block_sealed(block_num, for_empty);

        if let Some(cfg) = sealed.info().new_chain_config.clone() {
            self.apply_chain_config(cfg);
        }
        {
            let mut meta = self.meta.write();
            if meta.current_block_num <= block_num {
                meta.current_block_num = block_num + 1;
            }
        }
        info!(
            "[node {}] sealed block {} ({}) proposer {}, empty {}, {} txs",
            self.local,
            block_num,
            short_hex(&sealed.hash()),
            sealed.proposer(),
            for_empty,
            sealed.block.transactions.len()
        );

        if add_sigs {
            match self.build_block_submit_msg(block_num) {
                Ok(submit) => self.send_msg(None, &ConsensusMsg::BlockSubmit(submit)),
                Err(e) => debug!("[node {}] no block submit for {}: {}", self.local, block_num, e),
            }
        }
        Ok(())
    }

    /// Switch to a chain config carried by a sealed block.
    fn apply_chain_config(&self, cfg: ChainConfig) {
        if cfg.view <= self.chain_config().view {
            return;
        }
        if let Err(e) = cfg.validate() {
            error!("[node {}] sealed chain config rejected: {}", self.local, e);
            return;
        }
        for peer in &cfg.peers {
            if let Err(e) = self.peer_pool.add_peer(peer) {
                warn!("[node {}] failed to add peer {}: {}", self.local, peer.index, e);
            }
        }
        self.peer_pool.set_handshake_timeout(cfg.peer_handshake_timeout);
        self.timer
            .set_timing(Arc::new(TimingConfig::from_chain_config(&cfg)));
        info!(
            "[node {}] chain config view {} in force, n {} c {}",
            self.local, cfg.view, cfg.n, cfg.c
        );
        let mut meta = self.meta.write();
        if meta
            .pending_chain_config
            .as_ref()
            .map(|p| p.view <= cfg.view)
            .unwrap_or(false)
        {
            meta.pending_chain_config = None;
        }
        meta.chain_config = Arc::new(cfg);
    }

    /// Block handed over by the syncer. Refused while the node takes part in
    /// rounds.
    pub(super) fn fast_forward_block(&self, block: Block) -> ConsensusResult<()> {
        if self.is_active() {
            return Err(ConsensusError::InvalidState(format!(
                "fast-forward of {} while active",
                block.block_num()
            )));
        }
        let block_num = block.block_num();
        let current = self.current_block_num();
        if block_num < current {
            return Ok(());
        }
        if block_num > current {
            return Err(ConsensusError::OutOfOrderSeal { block_num, current });
        }
        self.seal_block(&block, false, false)?;
        metrics::record_fast_forward();
        Ok(())
    }

    /// Seal every round the message pool already holds commit consensus for,
    /// then resume normal rounds.
    fn fast_forward(&self) {
        let cfg = self.chain_config();
        loop {
            let block_num = self.current_block_num();
            if let Err(e) = self.update_participant_config() {
                error!("[node {}] participants in fast-forward: {}", self.local, e);
            }

            let proposals = self.msg_pool.get_proposal_msgs(block_num);
            for p in &proposals {
                if let Err(e) = self.block_pool.new_block_proposal(p.clone()) {
                    debug!("[node {}] fast-forward proposal: {}", self.local, e);
                }
            }
            let commits: Vec<_> = self
                .msg_pool
                .get_commit_msgs(block_num)
                .into_iter()
                .filter(|c| match self.block_pool.new_block_commitment(c.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("[node {}] fast-forward commit: {}", self.local, e);
                        false
                    }
                })
                .collect();

            info!(
                "[node {}] fast-forwarding from {} ({} commits, {} proposals)",
                self.local,
                block_num,
                commits.len(),
                proposals.len()
            );
            if proposals.is_empty() && commits.is_empty() {
                if let Err(e) = self.start_new_round() {
                    warn!("[node {}] new round after fast-forward: {}", self.local, e);
                }
                return;
            }

            let Some(consensus) = get_commit_consensus(
                commits.iter().map(|c| c.as_ref()),
                cfg.c,
                cfg.n,
                |i| cfg.is_member(i),
            ) else {
                if let Err(e) = self.catch_consensus(block_num) {
                    info!("[node {}] catch consensus at {}: {}", self.local, block_num, e);
                }
                return;
            };

            let Some(proposal) = proposals
                .iter()
                .find(|p| p.proposer() == consensus.proposer)
            else {
                info!(
                    "[node {}] fast-forward stopped at {}, no proposal from {}",
                    self.local, block_num, consensus.proposer
                );
                self.fetch_proposal(block_num, consensus.proposer);
                if let Err(e) = self.timer.start(TimerEventKind::CommitBlockTimeout, block_num) {
                    warn!("[node {}] {}", self.local, e);
                }
                return;
            };

            if let Err(e) = self.seal_block(&proposal.block, consensus.for_empty, true) {
                error!("[node {}] fast-forward seal of {} failed: {}", self.local, block_num, e);
                return;
            }
        }
    }

    /// Join a round already in progress from the votes in the message pool.
    fn catch_consensus(&self, block_num: u32) -> ConsensusResult<()> {
        let endorser = self.is_endorser(block_num, self.local);
        let committer = self.is_committer(block_num, self.local);
        if !endorser && !committer {
            return Ok(());
        }
        let c = self.chain_config().c as usize;
        let proposals: BTreeMap<PeerIndex, Arc<BlockProposalMsg>> = self
            .msg_pool
            .get_proposal_msgs(block_num)
            .into_iter()
            .map(|p| (p.proposer(), p))
            .collect();

        let endorsements = self.msg_pool.get_endorsements_msgs(block_num);
        let mut proposal = None;
        let mut endorse_done = false;
        let mut endorse_empty = false;
        if endorsements.len() > c {
            let mut counts: BTreeMap<PeerIndex, usize> = BTreeMap::new();
            let mut empty = 0;
            for e in &endorsements {
                if e.endorse_for_empty {
                    empty += 1;
                }
                *counts.entry(e.endorsed_proposer).or_default() += 1;
            }
            if let Some((top, count)) = counts.iter().max_by_key(|(_, n)| **n) {
                proposal = proposals.get(top).cloned();
                endorse_done = *count > c;
            }
            if empty > c {
                endorse_done = true;
                endorse_empty = true;
            }
        }

        if let Some(p) = &proposal {
            if self.is_proposer(block_num, p.proposer()) {
                self.process_consensus_msg(RoundMsg::Proposal(p.clone()));
            }
        }
        if endorser && !endorse_done {
            if let Some(p) = &proposal {
                return self.endorse_block(p, endorse_empty);
            }
        }
        if !endorse_done {
            return Err(ConsensusError::NoCandidate(block_num));
        }
        if !committer {
            return Ok(());
        }

        let commits = self.msg_pool.get_commit_msgs(block_num);
        let mut counts: BTreeMap<PeerIndex, usize> = BTreeMap::new();
        let mut empty = 0;
        for commit in &commits {
            if commit.commit_for_empty {
                empty += 1;
            }
            *counts.entry(commit.block_proposer).or_default() += 1;
        }
        let target = counts
            .iter()
            .max_by_key(|(_, n)| **n)
            .and_then(|(proposer, _)| proposals.get(proposer).cloned())
            .or(proposal);
        match target {
            Some(p) => self.commit_block(&p, endorse_empty || empty > 0),
            None => Ok(()),
        }
    }

    /// Re-send our own votes for the current round after a stall, and cast
    /// any vote we still owe.
    fn rebroadcast(&self) {
        let block_num = self.current_block_num();
        let c = self.chain_config().c;
        let proposals = self.msg_pool.get_proposal_msgs(block_num);
        for p in proposals.iter().filter(|p| p.proposer() == self.local) {
            info!("[node {}] rebroadcast proposal {}", self.local, block_num);
            self.send_msg(None, &ConsensusMsg::Proposal(p.as_ref().clone()));
        }

        if self.is_endorser(block_num, self.local) {
            let endorse_failed = self.block_pool.endorse_failed(block_num, c);
            let own: Vec<_> = self
                .msg_pool
                .get_endorsements_msgs(block_num)
                .into_iter()
                .filter(|e| e.endorser == self.local && e.endorse_for_empty == endorse_failed)
                .collect();
            for e in &own {
                self.send_msg(None, &ConsensusMsg::Endorse(e.as_ref().clone()));
            }
            if own.is_empty() {
                match self.get_highest_rank_proposal(block_num, &proposals) {
                    Ok(p) => {
                        if let Err(e) = self.endorse_block(&p, false) {
                            error!("[node {}] rebroadcast endorse of {}: {}", self.local, block_num, e);
                        }
                    }
                    Err(e) => error!("[node {}] rebroadcast endorse of {}: {}", self.local, block_num, e),
                }
            }
        } else if let Some((p, for_empty)) = self.block_pool.get_endorsed_proposal(block_num) {
            match self.build_endorse_msg(&p, for_empty) {
                Ok(e) => self.send_msg(None, &ConsensusMsg::Endorse(e)),
                Err(e) => warn!("[node {}] {}", self.local, e),
            }
        }

        if !self.is_committer(block_num, self.local) {
            return;
        }
        let own: Vec<_> = self
            .msg_pool
            .get_commit_msgs(block_num)
            .into_iter()
            .filter(|m| m.committer == self.local)
            .collect();
        for m in &own {
            self.send_msg(None, &ConsensusMsg::Commit(m.as_ref().clone()));
        }
        if !own.is_empty() {
            return;
        }
        if let Some(quorum) = self.block_pool.endorse_done(block_num, c) {
            let proposal = quorum
                .proposal
                .or_else(|| self.find_block_proposal(block_num, quorum.proposer));
            match proposal {
                Some(p) => {
                    if let Err(e) = self.commit_block(&p, quorum.for_empty) {
                        error!("[node {}] rebroadcast commit of {}: {}", self.local, block_num, e);
                    }
                }
                None => {
                    self.fetch_proposal(block_num, quorum.proposer);
                    if let Err(e) = self.timer.start(TimerEventKind::EndorseBlockTimeout, block_num) {
                        warn!("[node {}] {}", self.local, e);
                    }
                }
            }
        } else if self.block_pool.endorse_failed(block_num, c) {
            self.timer.fire(TimerEventKind::EndorseBlockTimeout, block_num);
        }
    }

    /// Set up the current round: refresh participants, replay what the
    /// message pool already holds, then propose or wait for transactions.
    pub(super) fn start_new_round(&self) -> ConsensusResult<()> {
        let block_num = self.current_block_num();
        self.update_participant_config()?;
        let cfg = self.chain_config();
        debug!("[node {}] starting round {}", self.local, block_num);

        let mut leader_proposal = None;
        for p in self.msg_pool.get_proposal_msgs(block_num) {
            if self.is_proposer(block_num, p.proposer()) {
                leader_proposal = Some(p);
            } else if let Err(e) = self.block_pool.new_block_proposal(p) {
                debug!("[node {}] replay proposal: {}", self.local, e);
            }
        }
        let endorsements = self.msg_pool.get_endorsements_msgs(block_num);
        for e in &endorsements {
            if let Err(err) = self.block_pool.new_block_endorsement(e) {
                debug!("[node {}] replay endorsement: {}", self.local, err);
            }
        }
        let commits = self.msg_pool.get_commit_msgs(block_num);
        for m in &commits {
            if let Err(err) = self.block_pool.new_block_commitment(m.clone()) {
                debug!("[node {}] replay commit: {}", self.local, err);
            }
        }

        if let Some(first) = commits.first() {
            if self
                .block_pool
                .commit_done(block_num, cfg.c, cfg.n, |i| cfg.is_member(i))
                .is_some()
            {
                self.process_consensus_msg(RoundMsg::Commit(first.clone()));
                return Ok(());
            }
        }
        if let Some(first) = endorsements.first() {
            if self.block_pool.endorse_done(block_num, cfg.c).is_some() {
                self.process_consensus_msg(RoundMsg::Endorse(first.clone()));
                return Ok(());
            }
        }
        if let Some(p) = leader_proposal {
            self.process_consensus_msg(RoundMsg::Proposal(p));
            return Ok(());
        }

        if self.committed_height() + 1 == block_num
            && !self.tx_pool.pending_transactions(1).is_empty()
        {
            info!("[node {}] round {} starts with pending txs", self.local, block_num);
            self.start_new_proposal(block_num)
        } else {
            self.timer.start(TimerEventKind::TxPool, block_num)?;
            self.timer.start(TimerEventKind::TxBlockTimeout, block_num)
        }
    }

    /// The leader proposes; ranked backups arm their backoff. Everyone arms
    /// the proposal timeout.
    pub(super) fn start_new_proposal(&self, block_num: u32) -> ConsensusResult<()> {
        if self.is_proposer(block_num, self.local) {
            self.push_action(BftAction::MakeProposal {
                block_num,
                for_empty: false,
            });
        } else if self.is_2nd_proposer(block_num, self.local) {
            let rank = self.proposer_rank(block_num, self.local);
            self.timer.start_proposal_backoff(block_num, rank)?;
        }
        self.timer.start(TimerEventKind::ProposeBlockTimeout, block_num)
    }
}
