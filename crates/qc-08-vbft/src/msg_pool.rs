//! # Message Pool
//!
//! Per-round archive of raw proposal, endorsement and commit messages,
//! deduplicated by message hash. Serves replay on round start, evidence for
//! fast-forward and re-broadcast after a stall.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::{
    BlockCommitMsg, BlockEndorseMsg, BlockProposalMsg, ConsensusError, ConsensusResult, Hash,
    PeerIndex,
};

#[derive(Default)]
struct RoundMsgs {
    hashes: HashSet<Hash>,
    proposals: Vec<Arc<BlockProposalMsg>>,
    endorsements: Vec<Arc<BlockEndorseMsg>>,
    commits: Vec<Arc<BlockCommitMsg>>,
}

/// Deduplicated message archive, one entry per round
pub struct MsgPool {
    history_len: u32,
    rounds: RwLock<BTreeMap<u32, RoundMsgs>>,
}

impl MsgPool {
    pub fn new(history_len: u32) -> Self {
        Self {
            history_len,
            rounds: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert<F>(&self, block_num: u32, hash: Hash, current: u32, push: F) -> ConsensusResult<bool>
    where
        F: FnOnce(&mut RoundMsgs),
    {
        if block_num > current.saturating_add(self.history_len) {
            return Err(ConsensusError::FarFutureMessage { block_num, current });
        }
        let mut rounds = self.rounds.write();
        let round = rounds.entry(block_num).or_default();
        if !round.hashes.insert(hash) {
            return Ok(false);
        }
        push(round);
        Ok(true)
    }

    /// Archive a proposal. Returns false if it was already present.
    pub fn add_proposal(
        &self,
        msg: Arc<BlockProposalMsg>,
        hash: Hash,
        current: u32,
    ) -> ConsensusResult<bool> {
        self.insert(msg.block_num(), hash, current, |r| r.proposals.push(msg))
    }

    pub fn add_endorsement(
        &self,
        msg: Arc<BlockEndorseMsg>,
        hash: Hash,
        current: u32,
    ) -> ConsensusResult<bool> {
        self.insert(msg.block_num, hash, current, |r| r.endorsements.push(msg))
    }

    pub fn add_commit(
        &self,
        msg: Arc<BlockCommitMsg>,
        hash: Hash,
        current: u32,
    ) -> ConsensusResult<bool> {
        self.insert(msg.block_num, hash, current, |r| r.commits.push(msg))
    }

    pub fn has_msg(&self, block_num: u32, hash: &Hash) -> bool {
        self.rounds
            .read()
            .get(&block_num)
            .map(|r| r.hashes.contains(hash))
            .unwrap_or(false)
    }

    pub fn get_proposal_msgs(&self, block_num: u32) -> Vec<Arc<BlockProposalMsg>> {
        self.rounds
            .read()
            .get(&block_num)
            .map(|r| r.proposals.clone())
            .unwrap_or_default()
    }

    pub fn get_proposal(&self, block_num: u32, proposer: PeerIndex) -> Option<Arc<BlockProposalMsg>> {
        self.rounds
            .read()
            .get(&block_num)?
            .proposals
            .iter()
            .find(|p| p.proposer() == proposer)
            .cloned()
    }

    pub fn get_endorsements_msgs(&self, block_num: u32) -> Vec<Arc<BlockEndorseMsg>> {
        self.rounds
            .read()
            .get(&block_num)
            .map(|r| r.endorsements.clone())
            .unwrap_or_default()
    }

    pub fn get_commit_msgs(&self, block_num: u32) -> Vec<Arc<BlockCommitMsg>> {
        self.rounds
            .read()
            .get(&block_num)
            .map(|r| r.commits.clone())
            .unwrap_or_default()
    }

    /// Drop rounds older than `block_num - history_len`.
    pub fn on_block_sealed(&self, block_num: u32) {
        if block_num <= self.history_len {
            return;
        }
        let cutoff = block_num - self.history_len;
        let mut rounds = self.rounds.write();
        *rounds = rounds.split_off(&cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endorse(block_num: u32, endorser: PeerIndex) -> Arc<BlockEndorseMsg> {
        Arc::new(BlockEndorseMsg {
            endorser,
            endorsed_proposer: 1,
            block_num,
            endorsed_block_hash: [0u8; 32],
            endorse_for_empty: false,
            proposer_sig: vec![],
            endorser_sig: vec![endorser as u8],
        })
    }

    #[test]
    fn test_dedup_by_hash() {
        let pool = MsgPool::new(8);
        assert!(pool.add_endorsement(endorse(3, 1), [1u8; 32], 3).unwrap());
        assert!(!pool.add_endorsement(endorse(3, 1), [1u8; 32], 3).unwrap());
        assert!(pool.add_endorsement(endorse(3, 2), [2u8; 32], 3).unwrap());
        assert_eq!(pool.get_endorsements_msgs(3).len(), 2);
        assert!(pool.has_msg(3, &[1u8; 32]));
        assert!(!pool.has_msg(4, &[1u8; 32]));
    }

    #[test]
    fn test_far_future_rejected() {
        let pool = MsgPool::new(8);
        assert!(pool.add_endorsement(endorse(11, 1), [1u8; 32], 3).is_ok());
        assert!(matches!(
            pool.add_endorsement(endorse(12, 1), [2u8; 32], 3),
            Err(ConsensusError::FarFutureMessage { block_num: 12, current: 3 })
        ));
    }

    #[test]
    fn test_eviction_window() {
        let pool = MsgPool::new(4);
        for n in 1..=10u32 {
            pool.add_endorsement(endorse(n, 1), [n as u8; 32], n).unwrap();
        }
        pool.on_block_sealed(9);
        assert_eq!(pool.rounds.read().len(), 6);
        assert!(pool.get_endorsements_msgs(4).is_empty());
        assert_eq!(pool.get_endorsements_msgs(5).len(), 1);
    }
}
