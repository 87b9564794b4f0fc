//! # qc-08-vbft
//!
//! VBFT consensus engine for Quantum-Chain.
//!
//! ## Architecture
//!
//! Every round a verifiable random value drawn from the previous block picks
//! the proposers, endorsers and committers out of a stake-weighted position
//! table. A block is sealed once a commit quorum agrees on one proposal, or
//! on its empty variant when the proposal could not gather endorsements.
//!
//! ```text
//!   proposer ──Proposal──► endorsers ──Endorse──► committers ──Commit──► seal
//!       ▲                                                                 │
//!       └────────────── VRF of the sealed block picks the next round ◄────┘
//! ```
//!
//! Nodes that fall behind leave the round loop and catch up through the
//! [`syncer`], which fetches blocks from peers in order and hands them back
//! for fast-forward sealing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use qc_08_vbft::{ServerPorts, VbftConfig, VbftServer};
//! use qc_08_vbft::ports::VbftApi;
//!
//! let server = VbftServer::start(
//!     VbftConfig::default(),
//!     ServerPorts { signer, store, transport, tx_pool },
//! )?;
//! server.spawn_inbound(inbox);
//! server.peer_connected(peer, peer_pubkey);
//!
//! // later
//! server.stop().await;
//! ```

pub mod adapters;
pub mod block_pool;
pub mod config;
pub mod domain;
pub mod event_timer;
pub mod metrics;
pub mod msg_pool;
pub mod peer_pool;
pub mod ports;
pub mod server;
pub mod state_mgr;
pub mod syncer;

// Re-export main types
pub use adapters::{InMemoryBlockStore, InMemoryNetwork, InMemoryTxPool, K256Signer};
pub use config::{TimingConfig, VbftConfig};
pub use domain::{
    Block, ChainConfig, ConsensusError, ConsensusMsg, ConsensusResult, GenesisSettings, PeerIndex,
    PosTableBuilder, PublicKey, Transaction,
};
pub use ports::{BlockStore, Signer, TransactionPool, Transport, VbftApi};
pub use server::{ServerPorts, VbftServer};
pub use state_mgr::ServerState;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vbft_config_default() {
        let config = VbftConfig::default();
        assert!(config.history_len > 0);
        assert!(config.max_block_txs > 0);
        assert!(config.active_window() > config.max_syncing_check_blk_num);
    }
}
