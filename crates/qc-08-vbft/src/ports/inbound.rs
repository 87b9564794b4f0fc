//! Driving ports (Inbound API)

use async_trait::async_trait;

use crate::domain::{ChainConfig, ConsensusResult, PeerIndex, PublicKey};
use crate::state_mgr::ServerState;

/// API a hosting node drives the engine through
#[async_trait]
pub trait VbftApi: Send + Sync {
    /// Hand an encoded payload received from `peer` to its receive queue.
    async fn deliver(&self, peer: PeerIndex, payload: Vec<u8>) -> ConsensusResult<()>;

    fn peer_connected(&self, peer: PeerIndex, pubkey: PublicKey);

    fn peer_disconnected(&self, peer: PeerIndex);

    /// Round currently being decided.
    fn current_block_num(&self) -> u32;

    fn committed_height(&self) -> u32;

    fn state(&self) -> ServerState;

    /// Schedule a chain config change. The next local proposal carries it
    /// and it takes effect once that block is sealed.
    fn update_chain_config(&self, config: ChainConfig) -> ConsensusResult<()>;
}
