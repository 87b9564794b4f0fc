//! Per-block participant selection
//!
//! ## Algorithm
//!
//! The seed of block `h` is derived from block `h-1`. Draw `k` reads a
//! window of the seed bits, which indexes the position table. Draws continue
//! in order until enough distinct peers are found, then the ordered draw is
//! split into proposers, endorsers and committers:
//!
//! ```text
//!  draw order:  d0 d1 d2 | d3 d4 d5 d6 ...
//!               proposers| endorsers   | committers
//! ```
//!
//! Short endorser lists are backfilled from the committers' tail, then the
//! proposers' head. Short committer lists are backfilled from the endorsers'
//! tail, then the proposers' head.

use std::sync::Arc;

use serde::Serialize;
use serde_with::{serde_as, Bytes};

use super::{
    hash_data_512, Block, ChainConfig, ConsensusError, ConsensusResult, PeerIndex, VrfValue,
};

/// Bit windows beyond this index run off the VRF output.
pub const MAX_PARTICIPANT_DRAWS: u32 = 512;

/// Map draw `k` of the VRF value to a position-table entry.
pub fn calc_participant(vrf: &VrfValue, pos_table: &[PeerIndex], k: u32) -> Option<PeerIndex> {
    if k >= MAX_PARTICIPANT_DRAWS || pos_table.is_empty() {
        return None;
    }
    let b_idx = (k / 8) as usize;
    let bits1 = k % 8;
    let bits2 = 8 + bits1;

    let v1 = (vrf[b_idx] >> bits1) as u64;
    let mut v2 = if b_idx + 1 < vrf.len() {
        vrf[b_idx + 1] as u64
    } else {
        vrf[0] as u64
    };
    v2 &= (1u64 << bits2) - 1;
    let v = (v2 << (8 - bits1)) + v1;
    Some(pos_table[(v % pos_table.len() as u64) as usize])
}

/// Ordered role lists for one block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticipantPeers {
    pub proposers: Vec<PeerIndex>,
    pub endorsers: Vec<PeerIndex>,
    pub committers: Vec<PeerIndex>,
}

fn backfill(target: &mut Vec<PeerIndex>, want: usize, candidates: impl IntoIterator<Item = PeerIndex>) {
    for p in candidates {
        if target.len() >= want {
            return;
        }
        if !target.contains(&p) {
            target.push(p);
        }
    }
}

/// Draw the proposer/endorser/committer partition for a VRF value.
pub fn calc_participant_peers(vrf: &VrfValue, config: &ChainConfig) -> ParticipantPeers {
    let c = config.c as usize;
    let n = config.n as usize;
    let want_proposers = c + 1;
    let want_others = 2 * c + 1;
    let total = n.min(want_proposers + 2 * want_others);

    let mut drawn: Vec<PeerIndex> = Vec::with_capacity(total);
    let mut k = 0;
    while drawn.len() < total {
        match calc_participant(vrf, &config.pos_table, k) {
            Some(p) if !drawn.contains(&p) => drawn.push(p),
            Some(_) => {}
            None => break,
        }
        k += 1;
    }

    let split_p = drawn.len().min(want_proposers);
    let split_e = drawn.len().min(split_p + want_others);
    let proposers = drawn[..split_p].to_vec();
    let mut endorsers = drawn[split_p..split_e].to_vec();
    let mut committers = drawn[split_e..].to_vec();

    if endorsers.len() < want_others {
        let candidates = committers.iter().rev().chain(proposers.iter()).copied();
        backfill(&mut endorsers, want_others, candidates);
    }
    if committers.len() < want_others {
        let candidates = endorsers.iter().rev().chain(proposers.iter()).copied();
        backfill(&mut committers, want_others, candidates);
    }

    ParticipantPeers {
        proposers,
        endorsers,
        committers,
    }
}

#[serde_as]
#[derive(Serialize)]
struct SeedData {
    block_num: u32,
    prev_proposer: PeerIndex,
    block_root: [u8; 32],
    #[serde_as(as = "Bytes")]
    vrf_value: VrfValue,
}

/// Selection seed for the block after `prev`.
pub fn participant_seed(prev: &Block) -> ConsensusResult<VrfValue> {
    let data = SeedData {
        block_num: prev.block_num() + 1,
        prev_proposer: prev.proposer(),
        block_root: prev.block_root(),
        vrf_value: prev.info().vrf_value,
    };
    let bytes = bincode::serialize(&data).map_err(|e| ConsensusError::Encode(e.to_string()))?;
    Ok(hash_data_512(&bytes))
}

#[serde_as]
#[derive(Serialize)]
struct VrfInput {
    block_num: u32,
    #[serde_as(as = "Bytes")]
    prev_vrf: VrfValue,
}

/// Bytes a proposer signs to produce its VRF proof.
pub fn vrf_input(block_num: u32, prev_vrf: &VrfValue) -> ConsensusResult<Vec<u8>> {
    bincode::serialize(&VrfInput {
        block_num,
        prev_vrf: *prev_vrf,
    })
    .map_err(|e| ConsensusError::Encode(e.to_string()))
}

/// VRF output for a proof.
pub fn vrf_from_proof(proof: &[u8]) -> VrfValue {
    hash_data_512(proof)
}

/// Participants of one block, derived once from the seed and chain config
#[derive(Clone, Debug)]
pub struct BlockParticipantConfig {
    pub block_num: u32,
    pub vrf: VrfValue,
    pub chain_config: Arc<ChainConfig>,
    pub proposers: Vec<PeerIndex>,
    pub endorsers: Vec<PeerIndex>,
    pub committers: Vec<PeerIndex>,
}

impl BlockParticipantConfig {
    pub fn build(
        block_num: u32,
        vrf: VrfValue,
        chain_config: Arc<ChainConfig>,
    ) -> ConsensusResult<Self> {
        if block_num == 0 {
            return Err(ConsensusError::InvalidParticipants {
                block_num,
                reason: "genesis has no participants".into(),
            });
        }
        let peers = calc_participant_peers(&vrf, &chain_config);
        let need = 2 * chain_config.c as usize + 1;
        if peers.proposers.is_empty()
            || peers.endorsers.len() < need
            || peers.committers.len() < need
        {
            return Err(ConsensusError::InvalidParticipants {
                block_num,
                reason: format!(
                    "proposers={} endorsers={} committers={}, need {}",
                    peers.proposers.len(),
                    peers.endorsers.len(),
                    peers.committers.len(),
                    need
                ),
            });
        }
        Ok(Self {
            block_num,
            vrf,
            chain_config,
            proposers: peers.proposers,
            endorsers: peers.endorsers,
            committers: peers.committers,
        })
    }

    /// Position of `peer` in the proposer list.
    pub fn proposer_rank(&self, peer: PeerIndex) -> Option<usize> {
        self.proposers.iter().position(|p| *p == peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain_config::tests::settings;
    use crate::domain::PosTableBuilder;
    use proptest::prelude::*;

    fn config(n: u32, c: u32) -> ChainConfig {
        PosTableBuilder::new(settings(n, c), [3u8; 32], 7)
            .build(1)
            .unwrap()
    }

    /// Position table listing every peer once.
    fn identity_config(n: u32, c: u32) -> ChainConfig {
        let mut cfg = config(n, c);
        cfg.pos_table = (1..=n).collect();
        cfg
    }

    #[test]
    fn test_calc_participant_bounds() {
        let vrf = [0xffu8; 64];
        assert_eq!(calc_participant(&vrf, &[1, 2, 3], 512), None);
        assert_eq!(calc_participant(&vrf, &[], 0), None);
        assert!(calc_participant(&vrf, &[1, 2, 3], 511).is_some());
    }

    #[test]
    fn test_calc_participant_bit_window() {
        let mut vrf = [0u8; 64];
        vrf[0] = 5;
        let table: Vec<PeerIndex> = (0..1000).collect();
        // k=0 reads vrf[0] plus the masked next byte
        assert_eq!(calc_participant(&vrf, &table, 0), Some(5));
        vrf[1] = 1;
        assert_eq!(calc_participant(&vrf, &table, 0), Some(256 + 5));
    }

    #[test]
    fn test_partition_with_backfill() {
        let cfg = config(7, 2);
        let peers = calc_participant_peers(&hash_data_512(b"round"), &cfg);
        assert_eq!(peers.proposers.len(), 3);
        assert_eq!(peers.endorsers.len(), 5);
        assert_eq!(peers.committers.len(), 5);

        let d = &peers.proposers;
        let e = &peers.endorsers;
        // 7 drawn: endorsers take d3..d6 and borrow the first proposer
        assert_eq!(e[4], d[0]);
        // committers take the endorsers in reverse
        let expected: Vec<PeerIndex> = e.iter().rev().copied().collect();
        assert_eq!(peers.committers, expected);
    }

    #[test]
    fn test_partition_large_committee_is_disjoint() {
        let cfg = config(16, 2);
        let peers = calc_participant_peers(&hash_data_512(b"large"), &cfg);
        assert_eq!(peers.proposers.len(), 3);
        assert_eq!(peers.endorsers.len(), 5);
        assert_eq!(peers.committers.len(), 5);
        for p in &peers.proposers {
            assert!(!peers.endorsers.contains(p));
            assert!(!peers.committers.contains(p));
        }
    }

    #[test]
    fn test_participant_config_rejects_genesis() {
        let cfg = Arc::new(identity_config(4, 1));
        assert!(BlockParticipantConfig::build(0, [1u8; 64], cfg.clone()).is_err());
        let pc = BlockParticipantConfig::build(1, [1u8; 64], cfg).unwrap();
        assert_eq!(pc.proposer_rank(pc.proposers[1]), Some(1));
    }

    #[test]
    fn test_seed_changes_with_block() {
        let cfg = identity_config(4, 1);
        let genesis = Block::genesis(cfg, 0);
        let s1 = participant_seed(&genesis).unwrap();
        let mut other = genesis.clone();
        other.block.header.height = 1;
        assert_ne!(s1, participant_seed(&other).unwrap());
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 64)) {
            let mut vrf = [0u8; 64];
            vrf.copy_from_slice(&bytes);
            let cfg = config(7, 2);
            let a = calc_participant_peers(&vrf, &cfg);
            let b = calc_participant_peers(&vrf, &cfg);
            prop_assert_eq!(&a, &b);
            for list in [&a.proposers, &a.endorsers, &a.committers] {
                let mut sorted = list.clone();
                sorted.sort();
                sorted.dedup();
                prop_assert_eq!(sorted.len(), list.len());
            }
        }
    }
}
