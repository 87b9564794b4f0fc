//! # VBFT Configuration
//!
//! Node-level knobs ([`VbftConfig`]) and round timeouts derived from the
//! chain config ([`TimingConfig`]).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::ChainConfig;

/// Node-level configuration of the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VbftConfig {
    /// Rounds kept behind the last sealed block.
    pub history_len: u32,

    /// Typed-message queue feeding the protocol loop.
    pub msg_channel_capacity: usize,

    /// Protocol-action queue.
    pub action_channel_capacity: usize,

    /// Outbound send queue.
    pub send_channel_capacity: usize,

    /// Per-peer receive queue of raw payloads.
    pub peer_recv_capacity: usize,

    pub timer_channel_capacity: usize,
    pub state_channel_capacity: usize,
    pub sync_req_capacity: usize,
    pub sync_msg_capacity: usize,
    pub blocks_from_peer_capacity: usize,
    pub peer_syncer_capacity: usize,

    /// Entries per block-info fetch response.
    pub max_block_info_response: usize,

    /// Time spent in SyncReady before forcing Synced.
    pub sync_ready_timeout: Duration,

    /// Peers further ahead than this trigger a sync check.
    pub max_syncing_check_blk_num: u32,

    pub max_peer_connections: usize,

    /// Transactions pulled per proposal.
    pub max_block_txs: usize,
}

impl Default for VbftConfig {
    fn default() -> Self {
        Self {
            history_len: 64,
            msg_channel_capacity: 64,
            action_channel_capacity: 8,
            send_channel_capacity: 16,
            peer_recv_capacity: 1024,
            timer_channel_capacity: 64,
            state_channel_capacity: 16,
            sync_req_capacity: 16,
            sync_msg_capacity: 256,
            blocks_from_peer_capacity: 64,
            peer_syncer_capacity: 4,
            max_block_info_response: 64,
            sync_ready_timeout: Duration::from_secs(10),
            max_syncing_check_blk_num: 10,
            max_peer_connections: 100,
            max_block_txs: 1000,
        }
    }
}

impl VbftConfig {
    /// Create a config for testing (shorter timeouts, smaller window).
    pub fn for_testing() -> Self {
        Self {
            history_len: 16,
            sync_ready_timeout: Duration::from_millis(500),
            max_block_txs: 16,
            ..Self::default()
        }
    }

    /// Distance within which a peer still counts as active.
    pub fn active_window(&self) -> u32 {
        self.max_syncing_check_blk_num * 4
    }
}

/// Round timeouts. Rebuilt whole whenever the chain config changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub propose: Duration,
    pub second_proposal: Duration,
    pub endorse: Duration,
    pub empty_endorse: Duration,
    pub commit: Duration,
    pub peer_handshake: Duration,
    pub tx_pool: Duration,
    pub zero_tx_block: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            propose: Duration::from_millis(300),
            second_proposal: Duration::from_millis(300),
            endorse: Duration::from_millis(100),
            empty_endorse: Duration::from_millis(100),
            commit: Duration::from_millis(200),
            peer_handshake: Duration::from_secs(10),
            tx_pool: Duration::from_secs(1),
            zero_tx_block: Duration::from_secs(10),
        }
    }
}

/// Backoff for a node that is not a proposer of the round.
pub const NO_RANK_BACKOFF: Duration = Duration::from_secs(100);

impl TimingConfig {
    pub fn from_chain_config(cfg: &ChainConfig) -> Self {
        let endorse = cfg.hash_msg_delay * 2;
        Self {
            propose: cfg.block_msg_delay * 2,
            second_proposal: cfg.block_msg_delay,
            endorse,
            empty_endorse: endorse,
            commit: cfg.hash_msg_delay * 3,
            peer_handshake: cfg.peer_handshake_timeout,
            tx_pool: Duration::from_secs(1),
            zero_tx_block: cfg.block_msg_delay * 3,
        }
    }

    /// Wait before a ranked proposer takes over the round.
    pub fn proposal_backoff(&self, rank: Option<usize>) -> Duration {
        match rank {
            Some(r) => self.second_proposal * (r as u32 + 1) / 3,
            None => NO_RANK_BACKOFF,
        }
    }

    /// Jittered wait used to desynchronise empty-block endorsements.
    pub fn random_backoff(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0..100u32) + 50;
        self.endorse * factor / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain_config::tests::settings;
    use crate::domain::PosTableBuilder;

    #[test]
    fn test_default_config() {
        let config = VbftConfig::default();
        assert_eq!(config.history_len, 64);
        assert_eq!(config.active_window(), 40);
        assert_eq!(config.max_block_info_response, 64);
    }

    #[test]
    fn test_timing_from_chain_config() {
        let cfg = PosTableBuilder::new(settings(4, 1), [0u8; 32], 0).build(1).unwrap();
        let t = TimingConfig::from_chain_config(&cfg);
        assert_eq!(t.propose, Duration::from_millis(200));
        assert_eq!(t.second_proposal, Duration::from_millis(100));
        assert_eq!(t.endorse, Duration::from_millis(100));
        assert_eq!(t.commit, Duration::from_millis(150));
        assert_eq!(t.zero_tx_block, Duration::from_millis(300));
        assert_eq!(t.peer_handshake, Duration::from_secs(2));
    }

    #[test]
    fn test_backoffs() {
        let t = TimingConfig::default();
        assert_eq!(t.proposal_backoff(Some(2)), Duration::from_millis(300));
        assert_eq!(t.proposal_backoff(None), NO_RANK_BACKOFF);
        for _ in 0..20 {
            let b = t.random_backoff();
            assert!(b >= Duration::from_millis(500) && b < Duration::from_millis(1500));
        }
    }
}
