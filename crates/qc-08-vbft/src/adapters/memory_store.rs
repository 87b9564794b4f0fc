//! In-memory block store
//!
//! Applies blocks strictly in height order. A block handed over ahead of the
//! chained height waits in a pending buffer until its predecessors arrive.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::domain::{hash_data, Block, ConsensusError, ConsensusResult, Hash};
use crate::ports::BlockStore;

#[derive(Default)]
struct StoreState {
    blocks: BTreeMap<u32, Block>,
    exec_roots: BTreeMap<u32, Hash>,
    pending: BTreeMap<u32, Block>,
}

impl StoreState {
    fn chained_height(&self) -> u32 {
        self.blocks.keys().next_back().copied().unwrap_or(0)
    }

    fn apply(&mut self, block: Block) {
        let height = block.block_num();
        let prev_root = height
            .checked_sub(1)
            .and_then(|h| self.exec_roots.get(&h))
            .copied()
            .unwrap_or_default();
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&prev_root);
        buf.extend_from_slice(&block.hash());
        self.exec_roots.insert(height, hash_data(&buf));
        self.blocks.insert(height, block);
    }

    fn drain_pending(&mut self) {
        loop {
            let next = self.chained_height() + 1;
            match self.pending.remove(&next) {
                Some(block) => self.apply(block),
                None => break,
            }
        }
    }
}

/// Block store kept in memory
pub struct InMemoryBlockStore {
    state: RwLock<StoreState>,
}

impl InMemoryBlockStore {
    /// Store holding only the genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        let mut state = StoreState::default();
        state.apply(genesis);
        Self {
            state: RwLock::new(state),
        }
    }
}

impl BlockStore for InMemoryBlockStore {
    fn get_block(&self, height: u32) -> ConsensusResult<Block> {
        self.state
            .read()
            .blocks
            .get(&height)
            .cloned()
            .ok_or(ConsensusError::BlockNotFound(height))
    }

    fn add_block(&self, block: Block) -> ConsensusResult<()> {
        let mut state = self.state.write();
        let height = block.block_num();
        let chained = state.chained_height();

        if let Some(existing) = state.blocks.get(&height) {
            if existing.hash() == block.hash() {
                return Ok(());
            }
            return Err(ConsensusError::Store(format!(
                "conflicting block at height {}",
                height
            )));
        }
        if height > chained + 1 {
            debug!("store: buffering block {} (chained {})", height, chained);
            state.pending.insert(height, block);
            return Ok(());
        }
        let prev_hash = state.blocks.get(&chained).map(Block::hash);
        if prev_hash != Some(block.prev_block_hash()) {
            warn!("store: block {} does not extend chained head", height);
            return Err(ConsensusError::PrevBlockHashMismatch { block_num: height });
        }
        state.apply(block);
        state.drain_pending();
        Ok(())
    }

    fn chained_height(&self) -> u32 {
        self.state.read().chained_height()
    }

    fn exec_merkle_root(&self, height: u32) -> ConsensusResult<Hash> {
        self.state
            .read()
            .exec_roots
            .get(&height)
            .copied()
            .ok_or(ConsensusError::BlockNotFound(height))
    }
}
