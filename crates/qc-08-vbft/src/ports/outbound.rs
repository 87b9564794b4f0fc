//! Driven ports (Outbound dependencies)

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Block, ConsensusResult, Hash, PeerIndex, PublicKey, Signature, Transaction};

/// Append-only block store / ledger
///
/// Called while the block pool lock is held, so implementations must not
/// call back into the engine.
pub trait BlockStore: Send + Sync {
    /// Sealed block at `height`, or `ConsensusError::BlockNotFound`.
    fn get_block(&self, height: u32) -> ConsensusResult<Block>;

    /// Persist a sealed block. Blocks ahead of the chained height may be
    /// buffered until the gap is filled.
    fn add_block(&self, block: Block) -> ConsensusResult<()>;

    /// Height of the last block applied to the ledger.
    fn chained_height(&self) -> u32;

    /// Execution merkle root after applying block `height`.
    fn exec_merkle_root(&self, height: u32) -> ConsensusResult<Hash>;
}

/// Node key holder and signature service
pub trait Signer: Send + Sync {
    /// Public identity of the local key.
    fn public_key(&self) -> PublicKey;

    /// Sign with the local key.
    fn sign(&self, data: &[u8]) -> ConsensusResult<Signature>;

    /// Verify `sig` over `data` for `pubkey`.
    fn verify(&self, pubkey: &PublicKey, data: &[u8], sig: &[u8]) -> ConsensusResult<()>;
}

/// Peer transport carrying opaque encoded envelopes
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, peer: PeerIndex, payload: Vec<u8>) -> ConsensusResult<()>;

    async fn broadcast(&self, payload: Vec<u8>) -> ConsensusResult<()>;
}

/// Source of transactions for block proposals
pub trait TransactionPool: Send + Sync {
    /// Up to `max` transactions ready for inclusion.
    fn pending_transactions(&self, max: usize) -> Vec<Transaction>;

    /// Drop transactions included in a sealed block.
    fn on_block_sealed(&self, block: &Block);
}

/// Local chain view used by the syncer
pub trait ChainHeightSource: Send + Sync {
    fn committed_height(&self) -> u32;

    fn local_block(&self, height: u32) -> Option<Block>;

    /// `C` of the current chain config.
    fn fault_tolerance(&self) -> u32;

    /// Connected peers that reported a committed height of at least `height`.
    fn peers_reaching(&self, height: u32) -> Vec<PeerIndex>;
}

/// Network fetches used by the syncer. Responses come back through the
/// syncer's message queue.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn request_block_info(&self, peer: PeerIndex, start: u32) -> ConsensusResult<()>;

    async fn request_block(&self, peer: PeerIndex, height: u32) -> ConsensusResult<()>;

    /// Proposal already received for `height` from `proposer`.
    fn cached_proposal(&self, height: u32, proposer: PeerIndex) -> Option<Block>;

    /// How long a peer syncer waits for one response.
    fn request_timeout(&self) -> Duration;
}

/// Where the syncer hands agreed blocks
#[async_trait]
pub trait SyncedBlockSink: Send + Sync {
    async fn fast_forward(&self, block: Block) -> ConsensusResult<()>;
}
