//! In-memory transaction pool

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::domain::{Block, Transaction};
use crate::ports::TransactionPool;

/// FIFO pool; sealed blocks remove the transactions they include.
#[derive(Default)]
pub struct InMemoryTxPool {
    txs: Mutex<VecDeque<Transaction>>,
}

impl InMemoryTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, tx: Transaction) {
        self.txs.lock().push_back(tx);
    }

    pub fn len(&self) -> usize {
        self.txs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionPool for InMemoryTxPool {
    fn pending_transactions(&self, max: usize) -> Vec<Transaction> {
        self.txs.lock().iter().take(max).cloned().collect()
    }

    fn on_block_sealed(&self, block: &Block) {
        let included = &block.block.transactions;
        if included.is_empty() {
            return;
        }
        self.txs.lock().retain(|tx| !included.contains(tx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockParams, VbftBlockInfo};

    #[test]
    fn test_sealed_block_removes_included() {
        let pool = InMemoryTxPool::new();
        pool.submit(Transaction(vec![1]));
        pool.submit(Transaction(vec![2]));
        let picked = pool.pending_transactions(1);
        assert_eq!(picked, vec![Transaction(vec![1])]);

        let block = Block::build(BlockParams {
            height: 1,
            prev_block_hash: [0u8; 32],
            prev_block_root: [0u8; 32],
            timestamp: 0,
            transactions: picked,
            info: VbftBlockInfo {
                proposer: 1,
                vrf_value: [0u8; 64],
                vrf_proof: vec![],
                last_config_block_num: 0,
                new_chain_config: None,
            },
            prev_exec_merkle_root: [0u8; 32],
        });
        pool.on_block_sealed(&block);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.pending_transactions(10), vec![Transaction(vec![2])]);
    }
}
