//! Round roles of a peer, from the participant config and peer liveness

use std::sync::Arc;

use crate::domain::{BlockParticipantConfig, BlockProposalMsg, ConsensusError, ConsensusResult, PeerIndex};

use super::ServerCore;

impl ServerCore {
    fn round_participants(&self, block_num: u32) -> Option<Arc<BlockParticipantConfig>> {
        self.participants().filter(|p| p.block_num == block_num)
    }

    /// The first live proposer of the round leads it. The local node never
    /// leads before it is active.
    pub(crate) fn is_proposer(&self, block_num: u32, peer: PeerIndex) -> bool {
        if peer == self.local && !self.is_active() {
            return false;
        }
        let Some(participants) = self.round_participants(block_num) else {
            return false;
        };
        participants
            .proposers
            .iter()
            .find(|id| self.peer_pool.is_peer_alive(**id))
            .map(|id| *id == peer)
            .unwrap_or(false)
    }

    pub(crate) fn proposer_rank(&self, block_num: u32, peer: PeerIndex) -> Option<usize> {
        self.round_participants(block_num)?.proposer_rank(peer)
    }

    /// Ranked 1..=C: may take over with a backoff.
    pub(crate) fn is_2nd_proposer(&self, block_num: u32, peer: PeerIndex) -> bool {
        let c = self.chain_config().c as usize;
        matches!(self.proposer_rank(block_num, peer), Some(rank) if (1..=c).contains(&rank))
    }

    /// Listed before more than `2C` active endorsers have been passed.
    pub(crate) fn is_endorser(&self, block_num: u32, peer: PeerIndex) -> bool {
        match self.round_participants(block_num) {
            Some(p) => self.within_active_quorum(&p.endorsers, peer),
            None => false,
        }
    }

    pub(crate) fn is_committer(&self, block_num: u32, peer: PeerIndex) -> bool {
        match self.round_participants(block_num) {
            Some(p) => self.within_active_quorum(&p.committers, peer),
            None => false,
        }
    }

    fn within_active_quorum(&self, list: &[PeerIndex], peer: PeerIndex) -> bool {
        let limit = 2 * self.chain_config().c as usize;
        let height = self.committed_height();
        let mut active = 0;
        for id in list {
            if *id == peer {
                return true;
            }
            if self.peer_pool.is_peer_active(*id, height) {
                active += 1;
                if active > limit {
                    break;
                }
            }
        }
        false
    }

    /// Proposal of the best-ranked proposer. Unranked proposers rank last.
    ///
    /// Fails with `InvariantViolation` when proposals exist but none is for
    /// `block_num`.
    pub(crate) fn get_highest_rank_proposal(
        &self,
        block_num: u32,
        proposals: &[Arc<BlockProposalMsg>],
    ) -> ConsensusResult<Arc<BlockProposalMsg>> {
        if proposals.is_empty() {
            return Err(ConsensusError::NoCandidate(block_num));
        }
        let unranked = self
            .round_participants(block_num)
            .map(|p| p.proposers.len())
            .unwrap_or(usize::MAX);
        proposals
            .iter()
            .filter(|p| p.block_num() == block_num)
            .min_by_key(|p| {
                self.proposer_rank(block_num, p.proposer())
                    .unwrap_or(unranked)
            })
            .cloned()
            .ok_or_else(|| {
                ConsensusError::InvariantViolation(format!(
                    "{} proposals held for block {} but none belongs to it",
                    proposals.len(),
                    block_num
                ))
            })
    }
}
