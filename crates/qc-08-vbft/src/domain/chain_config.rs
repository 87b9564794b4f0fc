//! Committee configuration and position-table generation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{hash_data, ConsensusError, ConsensusResult, Hash, PeerIndex, PublicKey};

/// A committee member as recorded in the chain config
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub index: PeerIndex,
    pub id: PublicKey,
}

/// Committee configuration for one view
///
/// Immutable once loaded; a config block produces a new value with a
/// higher `view`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub version: u32,
    pub view: u32,
    /// Committee size
    pub n: u32,
    /// Fault tolerance
    pub c: u32,
    pub block_msg_delay: Duration,
    pub hash_msg_delay: Duration,
    pub peer_handshake_timeout: Duration,
    pub max_block_change_view: u32,
    pub peers: Vec<PeerConfig>,
    /// Stake-weighted, shuffled peer indices
    pub pos_table: Vec<PeerIndex>,
}

impl ChainConfig {
    /// Reject configs the engine cannot run with. A zero view is fatal.
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.view == 0 {
            return Err(ConsensusError::InvalidChainConfig("view is zero".into()));
        }
        if self.peers.is_empty() || self.pos_table.is_empty() {
            return Err(ConsensusError::InvalidChainConfig(
                "empty committee or position table".into(),
            ));
        }
        if self.n as usize != self.peers.len() {
            return Err(ConsensusError::InvalidChainConfig(format!(
                "n={} but {} peers",
                self.n,
                self.peers.len()
            )));
        }
        if 2 * self.c + 1 > self.n {
            return Err(ConsensusError::InvalidChainConfig(format!(
                "c={} too large for n={}",
                self.c, self.n
            )));
        }
        if let Some(bad) = self.pos_table.iter().find(|idx| !self.is_member(**idx)) {
            return Err(ConsensusError::InvalidChainConfig(format!(
                "position table references unknown peer {}",
                bad
            )));
        }
        Ok(())
    }

    pub fn is_member(&self, index: PeerIndex) -> bool {
        self.peers.iter().any(|p| p.index == index)
    }

    pub fn peer_id(&self, index: PeerIndex) -> Option<&PublicKey> {
        self.peers.iter().find(|p| p.index == index).map(|p| &p.id)
    }

    pub fn index_of(&self, id: &PublicKey) -> Option<PeerIndex> {
        self.peers.iter().find(|p| &p.id == id).map(|p| p.index)
    }
}

/// A candidate validator with its initial stake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStake {
    pub index: PeerIndex,
    pub id: PublicKey,
    pub stake: u64,
}

/// Input to [`PosTableBuilder::build`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisSettings {
    /// Committee size
    pub k: u32,
    pub c: u32,
    /// Position table length
    pub l: u32,
    pub block_msg_delay: Duration,
    pub hash_msg_delay: Duration,
    pub peer_handshake_timeout: Duration,
    pub max_block_change_view: u32,
    pub peers: Vec<PeerStake>,
}

#[derive(Serialize)]
struct ShuffleInput<'a> {
    tx_hash: &'a Hash,
    timestamp: u32,
    node_id: &'a PublicKey,
    position: u32,
}

/// Builds the stake-weighted position table and the chain config for a view.
pub struct PosTableBuilder {
    settings: GenesisSettings,
    tx_hash: Hash,
    timestamp: u32,
}

impl PosTableBuilder {
    pub fn new(settings: GenesisSettings, tx_hash: Hash, timestamp: u32) -> Self {
        Self {
            settings,
            tx_hash,
            timestamp,
        }
    }

    fn check(&self) -> ConsensusResult<()> {
        let s = &self.settings;
        let fail = |msg: String| Err(ConsensusError::InvalidChainConfig(msg));
        if s.k as usize > s.peers.len() {
            return fail(format!("k={} exceeds {} peers", s.k, s.peers.len()));
        }
        if s.k < 2 * s.c + 1 {
            return fail(format!("k={} below 2c+1 for c={}", s.k, s.c));
        }
        if s.k == 0 || s.l % s.k != 0 {
            return fail(format!("l={} not a multiple of k={}", s.l, s.k));
        }
        if s.l < 2 * s.k {
            return fail(format!("l={} below 2k", s.l));
        }
        if s.peers.iter().any(|p| p.stake == 0) {
            return fail("zero-stake peer".into());
        }
        Ok(())
    }

    fn shuffle_hash(&self, node_id: &PublicKey, position: usize) -> ConsensusResult<u64> {
        let input = ShuffleInput {
            tx_hash: &self.tx_hash,
            timestamp: self.timestamp,
            node_id,
            position: position as u32,
        };
        let bytes = bincode::serialize(&input).map_err(|e| ConsensusError::Encode(e.to_string()))?;
        let h = hash_data(&bytes);
        let mut word = [0u8; 8];
        word.copy_from_slice(&h[..8]);
        Ok(u64::from_le_bytes(word))
    }

    /// Generate the chain config for `view`.
    pub fn build(&self, view: u32) -> ConsensusResult<ChainConfig> {
        self.check()?;
        let s = &self.settings;

        let mut ranked = s.peers.clone();
        ranked.sort_by(|a, b| b.stake.cmp(&a.stake).then(a.index.cmp(&b.index)));
        ranked.truncate(s.k as usize);

        let sum: u128 = ranked.iter().map(|p| p.stake as u128).sum();
        let scale = (s.l / s.k - 1) as u128;

        let mut pos_table = Vec::with_capacity(s.l as usize);
        for peer in &ranked {
            let num = peer.stake as u128 * scale * s.k as u128;
            let count = num.div_ceil(sum);
            pos_table.extend(std::iter::repeat(peer.index).take(count as usize));
        }

        for i in (1..pos_table.len()).rev() {
            let owner = pos_table[i];
            let id = ranked
                .iter()
                .find(|p| p.index == owner)
                .map(|p| p.id.clone())
                .ok_or(ConsensusError::UnknownPeer(owner))?;
            let j = (self.shuffle_hash(&id, i)? % i as u64) as usize;
            pos_table.swap(i, j);
        }

        let mut peers: Vec<PeerConfig> = ranked
            .iter()
            .map(|p| PeerConfig {
                index: p.index,
                id: p.id.clone(),
            })
            .collect();
        peers.sort_by_key(|p| p.index);

        let cfg = ChainConfig {
            version: 1,
            view,
            n: s.k,
            c: s.c,
            block_msg_delay: s.block_msg_delay,
            hash_msg_delay: s.hash_msg_delay,
            peer_handshake_timeout: s.peer_handshake_timeout,
            max_block_change_view: s.max_block_change_view,
            peers,
            pos_table,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
