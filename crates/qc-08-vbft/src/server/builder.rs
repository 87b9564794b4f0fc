//! Message construction

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::{
    vrf_from_proof, vrf_input, Block, BlockCommitMsg, BlockEndorseMsg, BlockFetchMsg,
    BlockFetchRespMsg, BlockInfo, BlockInfoFetchMsg, BlockInfoFetchRespMsg, BlockParams,
    BlockProposalMsg, BlockSubmitMsg, ConsensusError, ConsensusResult, Hash, PeerHandshakeMsg,
    PeerHeartbeatMsg, PeerIndex, PeerSigned, ProposalFetchMsg, Signature, VbftBlockInfo,
};

use super::ServerCore;

/// Hash a vote on `proposal` signs and the proposer signature over it.
pub(crate) fn proposal_target(
    proposal: &BlockProposalMsg,
    for_empty: bool,
) -> ConsensusResult<(Hash, Signature)> {
    let sealed = proposal.block.sealed_variant(for_empty)?;
    let sig = sealed
        .proposer_sig()
        .cloned()
        .ok_or_else(|| ConsensusError::InvalidSignature("unsigned proposal".into()))?;
    Ok((sealed.hash(), sig))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Timestamp of a block on top of one stamped `prev`: wall clock, but
/// strictly after the parent while the parent leaves room.
fn next_timestamp(now: u64, prev: u64) -> u64 {
    now.max(prev.saturating_add(1))
}

impl ServerCore {
    /// Signed proposal for `block_num` on top of the sealed previous block.
    pub(crate) fn build_proposal_msg(
        &self,
        block_num: u32,
        for_empty: bool,
    ) -> ConsensusResult<BlockProposalMsg> {
        let prev_num = block_num
            .checked_sub(1)
            .ok_or(ConsensusError::BlockNotFound(0))?;
        let (prev, prev_hash) = self
            .block_pool
            .get_sealed_block(prev_num)
            .ok_or(ConsensusError::BlockNotFound(prev_num))?;

        let vrf_proof = self
            .signer
            .sign(&vrf_input(block_num, &prev.info().vrf_value)?)?;
        let vrf_value = vrf_from_proof(&vrf_proof);

        let current_view = self.chain_config().view;
        let new_chain_config = self
            .meta
            .read()
            .pending_chain_config
            .clone()
            .filter(|c| c.view > current_view);

        let transactions = if for_empty {
            Vec::new()
        } else {
            self.tx_pool.pending_transactions(self.config.max_block_txs)
        };

        let mut block = Block::build(BlockParams {
            height: block_num,
            prev_block_hash: prev_hash,
            prev_block_root: prev.block_root(),
            timestamp: next_timestamp(unix_now(), prev.block.header.timestamp),
            transactions,
            info: VbftBlockInfo {
                proposer: self.local,
                vrf_value,
                vrf_proof,
                last_config_block_num: prev.config_block_for_next(),
                new_chain_config,
            },
            prev_exec_merkle_root: self.block_pool.get_exec_merkle_root(prev_num)?,
        });

        block.block.sig_data = vec![self.signer.sign(&block.hash())?];
        if let Some(empty) = block.empty_block.as_mut() {
            empty.sig_data = vec![self.signer.sign(&empty.hash())?];
        }
        Ok(BlockProposalMsg { block })
    }

    pub(crate) fn build_endorse_msg(
        &self,
        proposal: &BlockProposalMsg,
        for_empty: bool,
    ) -> ConsensusResult<BlockEndorseMsg> {
        let (hash, proposer_sig) = proposal_target(proposal, for_empty)?;
        Ok(BlockEndorseMsg {
            endorser: self.local,
            endorsed_proposer: proposal.proposer(),
            block_num: proposal.block_num(),
            endorsed_block_hash: hash,
            endorse_for_empty: for_empty,
            proposer_sig,
            endorser_sig: self.signer.sign(&hash)?,
        })
    }

    /// Commit carrying every matching endorsement seen in the message pool.
    pub(crate) fn build_commit_msg(
        &self,
        proposal: &BlockProposalMsg,
        for_empty: bool,
    ) -> ConsensusResult<BlockCommitMsg> {
        let block_num = proposal.block_num();
        let (hash, proposer_sig) = proposal_target(proposal, for_empty)?;
        let endorsers_sig: BTreeMap<_, _> = self
            .msg_pool
            .get_endorsements_msgs(block_num)
            .iter()
            .filter(|e| e.endorsed_block_hash == hash && e.endorse_for_empty == for_empty)
            .map(|e| (e.endorser, e.endorser_sig.clone()))
            .collect();
        Ok(BlockCommitMsg {
            committer: self.local,
            block_proposer: proposal.proposer(),
            block_num,
            commit_block_hash: hash,
            commit_for_empty: for_empty,
            proposer_sig,
            endorsers_sig,
            committer_sig: self.signer.sign(&hash)?,
        })
    }

    fn committed_block(&self) -> ConsensusResult<(Block, Hash)> {
        let committed = self.current_block_num().saturating_sub(1);
        self.block_pool
            .get_sealed_block(committed)
            .ok_or(ConsensusError::BlockNotFound(committed))
    }

    fn sign_peer_msg<M: PeerSigned>(&self, mut msg: M) -> ConsensusResult<M> {
        let sig = self.signer.sign(&msg.signing_hash()?)?;
        msg.set_sig(sig);
        Ok(msg)
    }

    pub(crate) fn build_handshake_msg(&self) -> ConsensusResult<PeerHandshakeMsg> {
        let (block, hash) = self.committed_block()?;
        self.sign_peer_msg(PeerHandshakeMsg {
            committed_block_number: block.block_num(),
            committed_block_hash: hash,
            committed_block_leader: block.proposer(),
            chain_config: self.chain_config().as_ref().clone(),
            sig: Vec::new(),
        })
    }

    pub(crate) fn build_heartbeat_msg(&self) -> ConsensusResult<PeerHeartbeatMsg> {
        let (block, hash) = self.committed_block()?;
        let (endorsers, endorsers_sig) =
            if block.block.bookkeepers.len() == block.block.sig_data.len() {
                (block.block.bookkeepers.clone(), block.block.sig_data.clone())
            } else {
                (Vec::new(), Vec::new())
            };
        self.sign_peer_msg(PeerHeartbeatMsg {
            committed_block_number: block.block_num(),
            committed_block_hash: hash,
            committed_block_leader: block.proposer(),
            endorsers,
            endorsers_sig,
            chain_config_view: self.chain_config().view,
            sig: Vec::new(),
        })
    }

    pub(crate) fn build_proposal_fetch_msg(
        &self,
        block_num: u32,
        proposer: PeerIndex,
    ) -> ConsensusResult<ProposalFetchMsg> {
        self.sign_peer_msg(ProposalFetchMsg {
            proposer_id: proposer,
            block_num,
            sig: Vec::new(),
        })
    }

    pub(crate) fn build_block_fetch_msg(&self, block_num: u32) -> ConsensusResult<BlockFetchMsg> {
        self.sign_peer_msg(BlockFetchMsg {
            block_num,
            sig: Vec::new(),
        })
    }

    pub(crate) fn build_block_info_fetch_msg(
        &self,
        start: u32,
    ) -> ConsensusResult<BlockInfoFetchMsg> {
        self.sign_peer_msg(BlockInfoFetchMsg {
            start_block_num: start,
            sig: Vec::new(),
        })
    }

    /// Sealed block `block_num`, or `BlockNotFound` when it is not sealed here.
    pub(crate) fn build_block_fetch_resp_msg(
        &self,
        block_num: u32,
    ) -> ConsensusResult<BlockFetchRespMsg> {
        let (block, block_hash) = self
            .block_pool
            .get_sealed_block(block_num)
            .ok_or(ConsensusError::BlockNotFound(block_num))?;
        self.sign_peer_msg(BlockFetchRespMsg {
            block_number: block_num,
            block_hash,
            block,
            sig: Vec::new(),
        })
    }

    pub(crate) fn build_block_info_resp_msg(
        &self,
        start: u32,
    ) -> ConsensusResult<BlockInfoFetchRespMsg> {
        self.sign_peer_msg(BlockInfoFetchRespMsg {
            blocks: self.build_block_infos(start),
            sig: Vec::new(),
        })
    }

    /// Sealed-block summaries from `start` up to the committed height.
    pub(crate) fn build_block_infos(&self, start: u32) -> Vec<BlockInfo> {
        let committed = self.committed_height();
        let cfg = self.chain_config();
        (start.max(1)..=committed)
            .take(self.config.max_block_info_response)
            .map_while(|n| self.block_pool.get_sealed_block(n))
            .map(|(block, _)| {
                let signatures = block
                    .block
                    .bookkeepers
                    .iter()
                    .zip(block.block.sig_data.iter())
                    .filter_map(|(pk, sig)| cfg.index_of(pk).map(|i| (i, sig.clone())))
                    .collect();
                BlockInfo {
                    block_num: block.block_num(),
                    proposer: block.proposer(),
                    signatures,
                }
            })
            .collect()
    }

    pub(crate) fn build_block_submit_msg(&self, block_num: u32) -> ConsensusResult<BlockSubmitMsg> {
        let root = self.block_pool.get_exec_merkle_root(block_num)?;
        Ok(BlockSubmitMsg {
            block_state_root: root,
            block_num,
            submit_msg_sig: self.signer.sign(&root)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_follows_parent() {
        assert_eq!(next_timestamp(100, 20), 100);
        assert_eq!(next_timestamp(100, 100), 101);
        assert_eq!(next_timestamp(0, u64::MAX), u64::MAX);
        assert_eq!(next_timestamp(5, u64::MAX - 1), u64::MAX);
    }
}
