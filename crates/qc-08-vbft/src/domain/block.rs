//! Block model
//!
//! A [`Block`] wraps the raw chain block together with its empty variant and
//! the execution root of the previous round. The VBFT metadata lives inside
//! the header so that the header hash covers it.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use super::{
    hash_data, ChainConfig, ConsensusError, ConsensusResult, Hash, PeerIndex, PublicKey,
    Signature, NO_PROPOSER, ZERO_HASH,
};

/// 64-byte VRF output
pub type VrfValue = [u8; 64];

/// Opaque transaction payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

impl Transaction {
    pub fn hash(&self) -> Hash {
        hash_data(&self.0)
    }
}

/// Binary merkle root over transaction hashes. The last node is paired with
/// itself on odd levels.
pub fn merkle_root(txs: &[Transaction]) -> Hash {
    if txs.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(right);
                hash_data(&buf)
            })
            .collect();
    }
    level[0]
}

/// Chained block-root accumulator.
pub fn next_block_root(prev_root: &Hash, tx_root: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(prev_root);
    buf[32..].copy_from_slice(tx_root);
    hash_data(&buf)
}

/// Consensus metadata carried in every block header
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbftBlockInfo {
    pub proposer: PeerIndex,
    #[serde_as(as = "Bytes")]
    pub vrf_value: VrfValue,
    pub vrf_proof: Vec<u8>,
    pub last_config_block_num: u32,
    pub new_chain_config: Option<ChainConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash,
    pub transactions_root: Hash,
    pub block_root: Hash,
    pub timestamp: u64,
    pub height: u32,
    pub info: VbftBlockInfo,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        // Serializing plain structs into a Vec cannot fail.
        let bytes = bincode::serialize(self).unwrap_or_default();
        hash_data(&bytes)
    }
}

/// Raw chain block: header, body and the signatures collected on it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub bookkeepers: Vec<PublicKey>,
    pub sig_data: Vec<Signature>,
}

impl ChainBlock {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Same header with the transaction payload stripped.
    pub fn empty_variant(&self) -> ChainBlock {
        let mut header = self.header.clone();
        header.transactions_root = ZERO_HASH;
        ChainBlock {
            header,
            transactions: Vec::new(),
            bookkeepers: Vec::new(),
            sig_data: Vec::new(),
        }
    }
}

/// Inputs for a fresh, unsigned proposal block
#[derive(Clone, Debug)]
pub struct BlockParams {
    pub height: u32,
    pub prev_block_hash: Hash,
    pub prev_block_root: Hash,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub info: VbftBlockInfo,
    pub prev_exec_merkle_root: Hash,
}

/// VBFT block: the proposal, its empty variant and the previous exec root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block: ChainBlock,
    pub empty_block: Option<ChainBlock>,
    pub prev_exec_merkle_root: Hash,
}

impl Block {
    /// Build an unsigned block plus its empty variant.
    pub fn build(params: BlockParams) -> Block {
        let transactions_root = merkle_root(&params.transactions);
        let header = BlockHeader {
            version: 0,
            prev_block_hash: params.prev_block_hash,
            transactions_root,
            block_root: next_block_root(&params.prev_block_root, &transactions_root),
            timestamp: params.timestamp,
            height: params.height,
            info: params.info,
        };
        let block = ChainBlock {
            header,
            transactions: params.transactions,
            bookkeepers: Vec::new(),
            sig_data: Vec::new(),
        };
        let empty_block = if block.transactions.is_empty() {
            None
        } else {
            Some(block.empty_variant())
        };
        Block {
            block,
            empty_block,
            prev_exec_merkle_root: params.prev_exec_merkle_root,
        }
    }

    /// Genesis block carrying the initial chain config.
    pub fn genesis(config: ChainConfig, timestamp: u64) -> Block {
        let info = VbftBlockInfo {
            proposer: NO_PROPOSER,
            vrf_value: [0u8; 64],
            vrf_proof: Vec::new(),
            last_config_block_num: 0,
            new_chain_config: Some(config),
        };
        Block::build(BlockParams {
            height: 0,
            prev_block_hash: ZERO_HASH,
            prev_block_root: ZERO_HASH,
            timestamp,
            transactions: Vec::new(),
            info,
            prev_exec_merkle_root: ZERO_HASH,
        })
    }

    pub fn block_num(&self) -> u32 {
        self.block.header.height
    }

    pub fn proposer(&self) -> PeerIndex {
        self.block.header.info.proposer
    }

    pub fn info(&self) -> &VbftBlockInfo {
        &self.block.header.info
    }

    pub fn hash(&self) -> Hash {
        self.block.hash()
    }

    pub fn prev_block_hash(&self) -> Hash {
        self.block.header.prev_block_hash
    }

    pub fn block_root(&self) -> Hash {
        self.block.header.block_root
    }

    pub fn proposer_sig(&self) -> Option<&Signature> {
        self.block.sig_data.first()
    }

    pub fn empty_proposer_sig(&self) -> Option<&Signature> {
        self.empty_block.as_ref().and_then(|b| b.sig_data.first())
    }

    /// Config block that governs the block after this one.
    pub fn config_block_for_next(&self) -> u32 {
        if self.info().new_chain_config.is_some() {
            self.block_num()
        } else {
            self.info().last_config_block_num
        }
    }

    /// The block to persist for a seal decision. Sealing the empty variant
    /// drops the transaction payload.
    pub fn sealed_variant(&self, for_empty: bool) -> ConsensusResult<Block> {
        if !for_empty {
            return Ok(self.clone());
        }
        let empty = match &self.empty_block {
            Some(b) => b.clone(),
            // no transactions: the block is its own empty variant
            None if self.block.transactions.is_empty() => self.block.clone(),
            None => {
                return Err(ConsensusError::NoEmptyBlock {
                    block_num: self.block_num(),
                    proposer: self.proposer(),
                })
            }
        };
        Ok(Block {
            block: empty,
            empty_block: None,
            prev_exec_merkle_root: self.prev_exec_merkle_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(proposer: PeerIndex) -> VbftBlockInfo {
        VbftBlockInfo {
            proposer,
            vrf_value: [7u8; 64],
            vrf_proof: vec![1, 2, 3],
            last_config_block_num: 0,
            new_chain_config: None,
        }
    }

    fn params(txs: Vec<Transaction>) -> BlockParams {
        BlockParams {
            height: 3,
            prev_block_hash: [9u8; 32],
            prev_block_root: [8u8; 32],
            timestamp: 1000,
            transactions: txs,
            info: info(2),
            prev_exec_merkle_root: [5u8; 32],
        }
    }

    #[test]
    fn test_merkle_root() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
        let one = vec![Transaction(vec![1])];
        assert_eq!(merkle_root(&one), one[0].hash());
        let three = vec![Transaction(vec![1]), Transaction(vec![2]), Transaction(vec![3])];
        assert_ne!(merkle_root(&three), merkle_root(&three[..2]));
    }

    #[test]
    fn test_empty_variant_strips_transactions() {
        let blk = Block::build(params(vec![Transaction(vec![1, 2])]));
        let empty = blk.empty_block.as_ref().unwrap();
        assert!(empty.transactions.is_empty());
        assert_eq!(empty.header.transactions_root, ZERO_HASH);
        assert_ne!(blk.hash(), empty.hash());
        assert_eq!(empty.header.info, blk.block.header.info);

        let sealed = blk.sealed_variant(true).unwrap();
        assert_eq!(sealed.hash(), empty.hash());
        assert!(sealed.empty_block.is_none());
    }

    #[test]
    fn test_block_without_txs_is_its_own_empty_variant() {
        let blk = Block::build(params(vec![]));
        assert!(blk.empty_block.is_none());
        assert_eq!(blk.sealed_variant(true).unwrap().hash(), blk.hash());
    }

    #[test]
    fn test_header_hash_covers_info() {
        let a = Block::build(params(vec![]));
        let mut p = params(vec![]);
        p.info = info(3);
        let b = Block::build(p);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.proposer(), 2);
        assert_eq!(a.block_num(), 3);
    }
}
