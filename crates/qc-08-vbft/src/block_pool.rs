//! # Block Pool
//!
//! Per-round accumulator of proposals, endorsements and commits, and the
//! quorum detector for each phase. A [`CandidateInfo`] is created lazily on
//! first reference to a block number and evicted once it falls more than
//! `history_len` rounds behind the last sealed block.
//!
//! Sealed blocks are cached here and persisted through the [`BlockStore`]
//! while the pool lock is held, which serializes concurrent seal attempts
//! for the same height.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::domain::{
    commit_quorum, get_commit_consensus, Block, BlockCommitMsg, BlockEndorseMsg,
    BlockProposalMsg, CommitConsensus, ConsensusError, ConsensusResult, Hash, PeerIndex,
    PublicKey, Signature,
};
use crate::ports::BlockStore;

/// One endorsement signature recorded for an endorser
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndorseSig {
    pub endorsed_proposer: PeerIndex,
    pub signature: Signature,
    pub for_empty: bool,
    /// Recorded on behalf of a proposer by its own proposal
    pub implicit: bool,
}

/// Endorsement quorum for a round
#[derive(Clone, Debug)]
pub struct EndorseQuorum {
    pub proposer: PeerIndex,
    pub for_empty: bool,
    /// `None` while the endorsed proposal has not arrived yet
    pub proposal: Option<Arc<BlockProposalMsg>>,
}

/// Round state owned by the pool
#[derive(Default)]
pub struct CandidateInfo {
    pub endorsed_proposal: Option<Arc<BlockProposalMsg>>,
    pub endorsed_empty_proposal: Option<Arc<BlockProposalMsg>>,

    // at most one of these is set
    pub committed_proposal: Option<Arc<BlockProposalMsg>>,
    pub committed_empty_proposal: Option<Arc<BlockProposalMsg>>,

    commit_result: Option<CommitConsensus>,
    commit_done: bool,

    pub sealed_block: Option<Block>,

    pub proposals: Vec<Arc<BlockProposalMsg>>,
    pub commit_msgs: Vec<Arc<BlockCommitMsg>>,

    /// Indexed by endorser
    pub endorse_sigs: BTreeMap<PeerIndex, Vec<EndorseSig>>,
}

impl CandidateInfo {
    fn sealed(block: Block) -> Self {
        Self {
            sealed_block: Some(block),
            ..Self::default()
        }
    }

    fn add_endorsement(
        &mut self,
        block_num: u32,
        endorser: PeerIndex,
        sig: EndorseSig,
        commitment: bool,
    ) -> ConsensusResult<()> {
        let existing = self.endorse_sigs.entry(endorser).or_default();
        if existing.is_empty() || commitment {
            *existing = vec![sig];
            return Ok(());
        }

        if let Some(empty) = existing.iter().find(|s| s.for_empty) {
            if sig.for_empty && empty.endorsed_proposer == sig.endorsed_proposer {
                return Ok(());
            }
            if !sig.for_empty {
                return Err(ConsensusError::EmptyEndorsementLocked { block_num, endorser });
            }
        }
        if sig.for_empty {
            *existing = vec![sig];
            return Ok(());
        }

        if existing
            .iter()
            .any(|s| s.endorsed_proposer == sig.endorsed_proposer)
        {
            return Ok(());
        }
        if existing.iter().all(|s| s.implicit) {
            *existing = vec![sig];
            return Ok(());
        }
        Err(ConsensusError::DuplicateEndorsement { block_num, endorser })
    }

    fn endorse_counts(&self) -> (BTreeMap<PeerIndex, usize>, BTreeMap<PeerIndex, usize>) {
        let mut counts: BTreeMap<PeerIndex, usize> = BTreeMap::new();
        let mut empty: BTreeMap<PeerIndex, usize> = BTreeMap::new();
        for sig in self.endorse_sigs.values().flatten() {
            let target = if sig.for_empty { &mut empty } else { &mut counts };
            *target.entry(sig.endorsed_proposer).or_default() += 1;
        }
        (counts, empty)
    }

    fn proposal_of(&self, proposer: PeerIndex) -> Option<Arc<BlockProposalMsg>> {
        self.proposals
            .iter()
            .find(|p| p.proposer() == proposer)
            .cloned()
    }
}

/// Authoritative per-round state and quorum detection.
pub struct BlockPool {
    history_len: u32,
    store: Arc<dyn BlockStore>,
    candidates: RwLock<BTreeMap<u32, CandidateInfo>>,
}

impl BlockPool {
    /// Create the pool, loading the last `history_len` sealed blocks.
    pub fn new(history_len: u32, store: Arc<dyn BlockStore>) -> ConsensusResult<Self> {
        let chained = store.chained_height();
        let mut candidates = BTreeMap::new();
        for height in chained.saturating_sub(history_len)..=chained {
            let block = store.get_block(height)?;
            candidates.insert(height, CandidateInfo::sealed(block));
        }
        Ok(Self {
            history_len,
            store,
            candidates: RwLock::new(candidates),
        })
    }

    pub fn chained_height(&self) -> u32 {
        self.store.chained_height()
    }

    /// Record a proposal together with the proposer's own endorsement.
    pub fn new_block_proposal(&self, msg: Arc<BlockProposalMsg>) -> ConsensusResult<()> {
        let block_num = msg.block_num();
        let proposer = msg.proposer();
        let mut candidates = self.candidates.write();
        let c = candidates.entry(block_num).or_default();

        if let Some(p) = c.proposals.iter().find(|p| p.proposer() == proposer) {
            if p.block.proposer_sig() == msg.block.proposer_sig() {
                return Ok(());
            }
            return Err(ConsensusError::DuplicateProposal { block_num, proposer });
        }

        let sig = EndorseSig {
            endorsed_proposer: proposer,
            signature: msg.block.proposer_sig().cloned().unwrap_or_default(),
            for_empty: false,
            implicit: true,
        };
        c.proposals.push(msg);
        if let Err(e) = c.add_endorsement(block_num, proposer, sig, false) {
            debug!("proposer endorsement of block {} not recorded: {}", block_num, e);
        }
        Ok(())
    }

    pub fn get_block_proposals(&self, block_num: u32) -> Vec<Arc<BlockProposalMsg>> {
        self.candidates
            .read()
            .get(&block_num)
            .map(|c| c.proposals.clone())
            .unwrap_or_default()
    }

    /// Record an endorsement.
    pub fn new_block_endorsement(&self, msg: &BlockEndorseMsg) -> ConsensusResult<()> {
        let sig = EndorseSig {
            endorsed_proposer: msg.endorsed_proposer,
            signature: msg.endorser_sig.clone(),
            for_empty: msg.endorse_for_empty,
            implicit: false,
        };
        let mut candidates = self.candidates.write();
        candidates
            .entry(msg.block_num)
            .or_default()
            .add_endorsement(msg.block_num, msg.endorser, sig, false)
    }

    /// Endorsement quorum, once some proposer has more than `c` endorsements
    /// or more than `c` endorsers asked for the empty block.
    pub fn endorse_done(&self, block_num: u32, c: u32) -> Option<EndorseQuorum> {
        let candidates = self.candidates.read();
        let cand = candidates.get(&block_num)?;
        if cand.endorse_sigs.len() < c as usize + 1 {
            return None;
        }

        let (counts, empty) = cand.endorse_counts();
        if let Some((proposer, _)) = counts.iter().find(|(_, n)| **n > c as usize) {
            return Some(EndorseQuorum {
                proposer: *proposer,
                for_empty: false,
                proposal: cand.proposal_of(*proposer),
            });
        }

        let empty_total: usize = empty.values().sum();
        if empty_total > c as usize {
            let (proposer, _) = empty
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))?;
            return Some(EndorseQuorum {
                proposer: *proposer,
                for_empty: true,
                proposal: cand.proposal_of(*proposer),
            });
        }
        None
    }

    /// True once no proposer can still collect `c + 1` endorsements.
    pub fn endorse_failed(&self, block_num: u32, c: u32) -> bool {
        let candidates = self.candidates.read();
        let Some(cand) = candidates.get(&block_num) else {
            return false;
        };
        let endorsers = cand.endorse_sigs.len() as u32;
        if endorsers < c + 1 {
            return false;
        }

        let (counts, empty) = cand.endorse_counts();
        if counts.values().any(|n| *n as u32 > c + 1) {
            return false;
        }
        if counts.len() as u32 > c + 1 {
            return true;
        }
        let empty_total: usize = empty.values().sum();
        if empty_total as u32 > c {
            return true;
        }

        let remaining = (2 * c + 1).saturating_sub(endorsers);
        !counts.values().any(|n| *n as u32 + remaining > c)
    }

    pub fn endorsed_for_block(&self, block_num: u32) -> bool {
        if self.store.chained_height() >= block_num {
            return true;
        }
        self.candidates
            .read()
            .get(&block_num)
            .map(|c| c.endorsed_proposal.is_some() || c.endorsed_empty_proposal.is_some())
            .unwrap_or(false)
    }

    pub fn endorsed_for_empty_block(&self, block_num: u32) -> bool {
        self.candidates
            .read()
            .get(&block_num)
            .map(|c| c.endorsed_empty_proposal.is_some())
            .unwrap_or(false)
    }

    /// The proposal this node endorsed, and whether for the empty block.
    pub fn get_endorsed_proposal(&self, block_num: u32) -> Option<(Arc<BlockProposalMsg>, bool)> {
        let candidates = self.candidates.read();
        let c = candidates.get(&block_num)?;
        if let Some(p) = &c.endorsed_empty_proposal {
            return Some((p.clone(), true));
        }
        c.endorsed_proposal.clone().map(|p| (p, false))
    }

    pub fn set_proposal_endorsed(
        &self,
        proposal: Arc<BlockProposalMsg>,
        for_empty: bool,
    ) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        let mut candidates = self.candidates.write();
        let c = candidates
            .get_mut(&block_num)
            .ok_or(ConsensusError::NoCandidate(block_num))?;

        let slot = if for_empty {
            &mut c.endorsed_empty_proposal
        } else {
            &mut c.endorsed_proposal
        };
        if let Some(existing) = slot.as_ref() {
            if existing.proposer() == proposal.proposer() {
                return Ok(());
            }
            return Err(ConsensusError::EndorseConflict {
                block_num,
                existing: existing.proposer(),
                requested: proposal.proposer(),
            });
        }
        *slot = Some(proposal);
        Ok(())
    }

    pub fn committed_for_block(&self, block_num: u32) -> bool {
        if self.store.chained_height() >= block_num {
            return true;
        }
        self.candidates
            .read()
            .get(&block_num)
            .map(|c| c.committed_proposal.is_some() || c.committed_empty_proposal.is_some())
            .unwrap_or(false)
    }

    /// Record this node's commit decision. Non-empty and empty outcomes are
    /// mutually exclusive.
    pub fn set_proposal_committed(
        &self,
        proposal: Arc<BlockProposalMsg>,
        for_empty: bool,
    ) -> ConsensusResult<()> {
        let block_num = proposal.block_num();
        let mut candidates = self.candidates.write();
        let c = candidates
            .get_mut(&block_num)
            .ok_or(ConsensusError::NoCandidate(block_num))?;

        let existing = c
            .committed_proposal
            .as_ref()
            .map(|p| (p.proposer(), false))
            .or_else(|| c.committed_empty_proposal.as_ref().map(|p| (p.proposer(), true)));
        if let Some((proposer, empty)) = existing {
            if proposer == proposal.proposer() && empty == for_empty {
                return Ok(());
            }
            return Err(ConsensusError::CommitConflict {
                block_num,
                existing: proposer,
                requested: proposal.proposer(),
            });
        }

        if for_empty {
            c.committed_empty_proposal = Some(proposal);
        } else {
            c.committed_proposal = Some(proposal);
        }
        Ok(())
    }

    /// Record a commit with the endorsements it carries.
    pub fn new_block_commitment(&self, msg: Arc<BlockCommitMsg>) -> ConsensusResult<()> {
        let block_num = msg.block_num;
        let mut candidates = self.candidates.write();
        let c = candidates.entry(block_num).or_default();

        if let Some(prev) = c.commit_msgs.iter().find(|m| m.committer == msg.committer) {
            if prev.commit_block_hash == msg.commit_block_hash {
                return Ok(());
            }
            return Err(ConsensusError::DuplicateCommit {
                block_num,
                committer: msg.committer,
            });
        }

        for (endorser, sig) in &msg.endorsers_sig {
            let esig = EndorseSig {
                endorsed_proposer: msg.block_proposer,
                signature: sig.clone(),
                for_empty: msg.commit_for_empty,
                implicit: false,
            };
            if let Err(e) = c.add_endorsement(block_num, *endorser, esig, false) {
                debug!("embedded endorsement skipped: {}", e);
            }
        }
        let own = EndorseSig {
            endorsed_proposer: msg.block_proposer,
            signature: msg.committer_sig.clone(),
            for_empty: msg.commit_for_empty,
            implicit: false,
        };
        c.add_endorsement(block_num, msg.committer, own, true)?;
        c.commit_msgs.push(msg);
        Ok(())
    }

    /// Commit consensus for the round. The first result found is kept, so
    /// later calls return the same outcome.
    ///
    /// Falls back to counting endorsement signatures against the same
    /// quorum when the commit messages alone are not conclusive.
    pub fn commit_done<F>(&self, block_num: u32, c: u32, n: u32, is_member: F) -> Option<CommitConsensus>
    where
        F: Fn(PeerIndex) -> bool,
    {
        let mut candidates = self.candidates.write();
        let cand = candidates.get_mut(&block_num)?;
        if let Some(done) = cand.commit_result {
            return Some(done);
        }

        let result = get_commit_consensus(
            cand.commit_msgs.iter().map(|m| m.as_ref()),
            c,
            n,
            &is_member,
        )
        .or_else(|| {
            let quorum = commit_quorum(n);
            let mut signers: BTreeMap<PeerIndex, BTreeSet<PeerIndex>> = BTreeMap::new();
            let mut empty = 0;
            for (endorser, sigs) in &cand.endorse_sigs {
                if !is_member(*endorser) {
                    continue;
                }
                for sig in sigs {
                    if sig.for_empty {
                        empty += 1;
                    } else {
                        signers.entry(sig.endorsed_proposer).or_default().insert(*endorser);
                    }
                }
            }
            signers
                .into_iter()
                .find(|(_, set)| set.len() >= quorum)
                .map(|(proposer, _)| CommitConsensus {
                    proposer,
                    for_empty: empty >= quorum,
                })
        });

        cand.commit_result = result;
        result
    }

    /// Mark the round's commit as acted upon.
    pub fn set_commit_done(&self, block_num: u32) {
        if let Some(c) = self.candidates.write().get_mut(&block_num) {
            c.commit_done = true;
        }
    }

    pub fn is_commit_had_done(&self, block_num: u32) -> bool {
        self.candidates
            .read()
            .get(&block_num)
            .map(|c| c.commit_done)
            .unwrap_or(false)
    }

    /// Seal a block for its round and persist it.
    ///
    /// Re-sealing with the same proposer returns the sealed block; a
    /// different proposer is a double seal. With `add_sigs` the collected
    /// endorsement signatures replace the block's signature list.
    pub fn set_block_sealed<F>(
        &self,
        block: &Block,
        for_empty: bool,
        add_sigs: bool,
        pubkey_of: F,
    ) -> ConsensusResult<Block>
    where
        F: Fn(PeerIndex) -> Option<PublicKey>,
    {
        let block_num = block.block_num();
        let proposer = block.proposer();
        let mut candidates = self.candidates.write();
        let c = candidates.entry(block_num).or_default();

        if let Some(sealed) = &c.sealed_block {
            if sealed.proposer() == proposer {
                return Ok(sealed.clone());
            }
            return Err(ConsensusError::DoubleSeal {
                block_num,
                sealed: sealed.proposer(),
                proposer,
            });
        }

        let mut sealed = block.sealed_variant(for_empty)?;
        if add_sigs {
            let proposer_sig = if for_empty {
                block.empty_proposer_sig().or(block.proposer_sig())
            } else {
                block.proposer_sig()
            }
            .cloned()
            .ok_or_else(|| ConsensusError::InvalidSignature("unsigned proposal".into()))?;

            let mut bookkeepers = Vec::new();
            let mut sig_data = vec![proposer_sig];
            if let Some(pk) = pubkey_of(proposer) {
                bookkeepers.push(pk);
            }
            for (endorser, sigs) in &c.endorse_sigs {
                if *endorser == proposer {
                    continue;
                }
                let Some(sig) = sigs
                    .iter()
                    .find(|s| s.endorsed_proposer == proposer && s.for_empty == for_empty)
                else {
                    continue;
                };
                if let Some(pk) = pubkey_of(*endorser) {
                    bookkeepers.push(pk);
                    sig_data.push(sig.signature.clone());
                }
            }
            sealed.block.bookkeepers = bookkeepers;
            sealed.block.sig_data = sig_data;
        }

        self.store.add_block(sealed.clone())?;
        c.sealed_block = Some(sealed.clone());
        Ok(sealed)
    }

    /// Sealed block and its hash, from the cache or the store.
    pub fn get_sealed_block(&self, block_num: u32) -> Option<(Block, Hash)> {
        if let Some(block) = self
            .candidates
            .read()
            .get(&block_num)
            .and_then(|c| c.sealed_block.clone())
        {
            let hash = block.hash();
            return Some((block, hash));
        }
        match self.store.get_block(block_num) {
            Ok(block) => {
                let hash = block.hash();
                Some((block, hash))
            }
            Err(e) => {
                debug!("sealed block {} unavailable: {}", block_num, e);
                None
            }
        }
    }

    pub fn get_exec_merkle_root(&self, block_num: u32) -> ConsensusResult<Hash> {
        self.store.exec_merkle_root(block_num)
    }

    /// Drop rounds older than `block_num - history_len`.
    pub fn on_block_sealed(&self, block_num: u32) {
        if block_num <= self.history_len {
            return;
        }
        let cutoff = block_num - self.history_len;
        let mut candidates = self.candidates.write();
        let kept = candidates.split_off(&cutoff);
        let dropped = candidates.len();
        *candidates = kept;
        if dropped > 0 {
            debug!("block pool evicted {} rounds below {}", dropped, cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBlockStore;
    use crate::domain::{BlockParams, ChainConfig, Transaction, VbftBlockInfo};

    /// Endorsement signatures collected for `proposer`, keyed by endorser.
    fn endorse_sigs_for(
        pool: &BlockPool,
        block_num: u32,
        proposer: PeerIndex,
        for_empty: bool,
    ) -> BTreeMap<PeerIndex, Signature> {
        let candidates = pool.candidates.read();
        let Some(c) = candidates.get(&block_num) else {
            return BTreeMap::new();
        };
        c.endorse_sigs
            .iter()
            .filter_map(|(endorser, sigs)| {
                sigs.iter()
                    .find(|s| s.endorsed_proposer == proposer && s.for_empty == for_empty)
                    .map(|s| (*endorser, s.signature.clone()))
            })
            .collect()
    }

    fn genesis() -> Block {
        Block::genesis(
            ChainConfig {
                version: 1,
                view: 1,
                n: 7,
                c: 2,
                block_msg_delay: Default::default(),
                hash_msg_delay: Default::default(),
                peer_handshake_timeout: Default::default(),
                max_block_change_view: 0,
                peers: vec![],
                pos_table: vec![],
            },
            0,
        )
    }

    fn pool() -> (BlockPool, Arc<InMemoryBlockStore>) {
        let store = Arc::new(InMemoryBlockStore::with_genesis(genesis()));
        let pool = BlockPool::new(4, store.clone()).unwrap();
        (pool, store)
    }

    fn proposal(parent: &Block, height: u32, proposer: PeerIndex, sig: u8) -> Arc<BlockProposalMsg> {
        let mut block = Block::build(BlockParams {
            height,
            prev_block_hash: parent.hash(),
            prev_block_root: parent.block_root(),
            timestamp: height as u64,
            transactions: vec![Transaction(vec![proposer as u8])],
            info: VbftBlockInfo {
                proposer,
                vrf_value: [0u8; 64],
                vrf_proof: vec![],
                last_config_block_num: 0,
                new_chain_config: None,
            },
            prev_exec_merkle_root: [0u8; 32],
        });
        block.block.sig_data = vec![vec![sig]];
        if let Some(e) = block.empty_block.as_mut() {
            e.sig_data = vec![vec![sig, 0xee]];
        }
        Arc::new(BlockProposalMsg { block })
    }

    fn endorse(endorser: PeerIndex, proposer: PeerIndex, for_empty: bool) -> BlockEndorseMsg {
        BlockEndorseMsg {
            endorser,
            endorsed_proposer: proposer,
            block_num: 1,
            endorsed_block_hash: [proposer as u8; 32],
            endorse_for_empty: for_empty,
            proposer_sig: vec![],
            endorser_sig: vec![endorser as u8],
        }
    }

    fn commit(committer: PeerIndex, proposer: PeerIndex, hash: u8) -> Arc<BlockCommitMsg> {
        Arc::new(BlockCommitMsg {
            committer,
            block_proposer: proposer,
            block_num: 1,
            commit_block_hash: [hash; 32],
            commit_for_empty: false,
            proposer_sig: vec![],
            endorsers_sig: BTreeMap::new(),
            committer_sig: vec![committer as u8],
        })
    }

    fn member(p: PeerIndex) -> bool {
        (1..=7).contains(&p)
    }

    #[test]
    fn test_duplicate_proposal() {
        let (pool, _) = pool();
        let g = genesis();
        pool.new_block_proposal(proposal(&g, 1, 3, 1)).unwrap();
        // identical re-submission is a no-op
        pool.new_block_proposal(proposal(&g, 1, 3, 1)).unwrap();
        assert_eq!(pool.get_block_proposals(1).len(), 1);
        assert_eq!(
            pool.new_block_proposal(proposal(&g, 1, 3, 2)),
            Err(ConsensusError::DuplicateProposal {
                block_num: 1,
                proposer: 3
            })
        );
    }

    #[test]
    fn test_empty_endorsement_locks_endorser() {
        let (pool, _) = pool();
        pool.new_block_endorsement(&endorse(4, 1, true)).unwrap();
        assert!(matches!(
            pool.new_block_endorsement(&endorse(4, 1, false)),
            Err(ConsensusError::EmptyEndorsementLocked { endorser: 4, .. })
        ));
    }

    #[test]
    fn test_endorsement_switch_to_empty_replaces() {
        let (pool, _) = pool();
        pool.new_block_endorsement(&endorse(4, 1, false)).unwrap();
        pool.new_block_endorsement(&endorse(4, 1, false)).unwrap();
        pool.new_block_endorsement(&endorse(4, 1, true)).unwrap();
        let sigs = endorse_sigs_for(&pool, 1, 1, false);
        assert!(sigs.is_empty());
        assert_eq!(endorse_sigs_for(&pool, 1, 1, true).len(), 1);
        assert!(matches!(
            pool.new_block_endorsement(&endorse(5, 1, false)).and(pool.new_block_endorsement(&endorse(5, 2, false))),
            Err(ConsensusError::DuplicateEndorsement { endorser: 5, .. })
        ));
    }

    #[test]
    fn test_endorse_quorum_c2() {
        let (pool, _) = pool();
        pool.new_block_endorsement(&endorse(4, 1, false)).unwrap();
        pool.new_block_endorsement(&endorse(5, 1, false)).unwrap();
        assert!(pool.endorse_done(1, 2).is_none());

        pool.new_block_endorsement(&endorse(6, 1, false)).unwrap();
        let q = pool.endorse_done(1, 2).unwrap();
        assert_eq!(q.proposer, 1);
        assert!(!q.for_empty);
        assert!(q.proposal.is_none());

        pool.new_block_proposal(proposal(&genesis(), 1, 1, 9)).unwrap();
        let q = pool.endorse_done(1, 2).unwrap();
        assert_eq!(q.proposal.unwrap().proposer(), 1);
        // repeated calls agree
        assert_eq!(pool.endorse_done(1, 2).unwrap().proposer, 1);
    }

    #[test]
    fn test_proposer_may_endorse_other_proposal() {
        let (pool, _) = pool();
        let g = genesis();
        pool.new_block_proposal(proposal(&g, 1, 2, 2)).unwrap();
        pool.new_block_endorsement(&endorse(2, 1, false)).unwrap();
        assert_eq!(endorse_sigs_for(&pool, 1, 1, false).len(), 1);
        assert!(endorse_sigs_for(&pool, 1, 2, false).is_empty());
    }

    #[test]
    fn test_empty_endorse_quorum() {
        let (pool, _) = pool();
        for e in [3, 4, 5] {
            pool.new_block_endorsement(&endorse(e, 1, true)).unwrap();
        }
        let q = pool.endorse_done(1, 2).unwrap();
        assert!(q.for_empty);
        assert_eq!(q.proposer, 1);
    }

    #[test]
    fn test_endorse_failed() {
        let (pool, _) = pool();
        // three endorsers split over three proposers, c=1: nobody can reach 2
        pool.new_block_endorsement(&endorse(4, 1, false)).unwrap();
        pool.new_block_endorsement(&endorse(5, 2, false)).unwrap();
        assert!(!pool.endorse_failed(1, 1));
        pool.new_block_endorsement(&endorse(6, 3, false)).unwrap();
        assert!(pool.endorse_failed(1, 1));
    }

    #[test]
    fn test_commit_rules_and_quorum() {
        let (pool, _) = pool();
        pool.new_block_commitment(commit(1, 2, 7)).unwrap();
        pool.new_block_commitment(commit(1, 2, 7)).unwrap();
        assert_eq!(
            pool.new_block_commitment(commit(1, 2, 8)),
            Err(ConsensusError::DuplicateCommit {
                block_num: 1,
                committer: 1
            })
        );
        for c in 2..=4 {
            pool.new_block_commitment(commit(c, 2, 7)).unwrap();
        }
        assert!(pool.commit_done(1, 2, 7, member).is_none());
        pool.new_block_commitment(commit(5, 2, 7)).unwrap();
        let done = pool.commit_done(1, 2, 7, member).unwrap();
        assert_eq!(done.proposer, 2);

        assert!(!pool.is_commit_had_done(1));
        pool.set_commit_done(1);
        assert!(pool.is_commit_had_done(1));
        assert_eq!(pool.commit_done(1, 2, 7, member), Some(done));
    }

    #[test]
    fn test_endorse_sigs_fallback_commit() {
        let (pool, _) = pool();
        for e in 1..=5 {
            pool.new_block_endorsement(&endorse(e, 3, false)).unwrap();
        }
        assert_eq!(pool.commit_done(1, 2, 7, member).map(|c| c.proposer), Some(3));
    }

    #[test]
    fn test_endorsed_and_committed_conflicts() {
        let (pool, _) = pool();
        let g = genesis();
        let p1 = proposal(&g, 1, 1, 1);
        let p2 = proposal(&g, 1, 2, 2);
        assert!(matches!(
            pool.set_proposal_endorsed(p1.clone(), false),
            Err(ConsensusError::NoCandidate(1))
        ));
        pool.new_block_proposal(p1.clone()).unwrap();
        pool.new_block_proposal(p2.clone()).unwrap();

        pool.set_proposal_endorsed(p1.clone(), false).unwrap();
        pool.set_proposal_endorsed(p1.clone(), false).unwrap();
        assert!(pool.set_proposal_endorsed(p2.clone(), false).is_err());
        assert!(pool.endorsed_for_block(1));
        assert_eq!(pool.get_endorsed_proposal(1).map(|(p, e)| (p.proposer(), e)), Some((1, false)));

        pool.set_proposal_committed(p1.clone(), false).unwrap();
        assert!(pool.committed_for_block(1));
        assert!(matches!(
            pool.set_proposal_committed(p2, false),
            Err(ConsensusError::CommitConflict { existing: 1, requested: 2, .. })
        ));
        assert!(pool.set_proposal_committed(p1, true).is_err());
    }

    #[test]
    fn test_seal_and_double_seal() {
        let (pool, store) = pool();
        let g = genesis();
        let p1 = proposal(&g, 1, 1, 1);
        let p2 = proposal(&g, 1, 2, 2);
        pool.new_block_proposal(p1.clone()).unwrap();
        pool.new_block_endorsement(&endorse(4, 1, false)).unwrap();

        let pk = |i: PeerIndex| Some(PublicKey(vec![i as u8]));
        let sealed = pool.set_block_sealed(&p1.block, false, true, pk).unwrap();
        assert_eq!(sealed.block.sig_data.len(), 2);
        assert_eq!(store.chained_height(), 1);
        assert!(pool.set_block_sealed(&p1.block, false, true, pk).is_ok());
        assert!(matches!(
            pool.set_block_sealed(&p2.block, false, true, pk),
            Err(ConsensusError::DoubleSeal { sealed: 1, proposer: 2, .. })
        ));
        let (cached, hash) = pool.get_sealed_block(1).unwrap();
        assert_eq!(hash, cached.hash());
        assert!(pool.get_exec_merkle_root(1).is_ok());
    }

    #[test]
    fn test_seal_empty_strips_transactions() {
        let (pool, _) = pool();
        let p1 = proposal(&genesis(), 1, 1, 1);
        pool.new_block_proposal(p1.clone()).unwrap();
        let sealed = pool
            .set_block_sealed(&p1.block, true, true, |_| None)
            .unwrap();
        assert!(sealed.block.transactions.is_empty());
        assert_eq!(sealed.block.sig_data, vec![vec![1, 0xee]]);
    }

    #[test]
    fn test_eviction_window() {
        let (pool, _) = pool();
        for n in 1..=12 {
            pool.new_block_endorsement(&BlockEndorseMsg {
                block_num: n,
                ..endorse(1, 1, false)
            })
            .unwrap();
        }
        pool.on_block_sealed(10);
        for n in 0..6 {
            assert!(!pool.candidates.read().contains_key(&n), "round {} should be evicted", n);
        }
        for n in 6..=12 {
            assert!(pool.candidates.read().contains_key(&n), "round {} should be kept", n);
        }
    }
}
