//! Commit quorum arithmetic

use std::collections::{BTreeMap, BTreeSet};

use super::{BlockCommitMsg, PeerIndex};

/// Outcome of a commit round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitConsensus {
    pub proposer: PeerIndex,
    pub for_empty: bool,
}

/// Distinct signers needed for commit consensus in a committee of `n`:
/// strictly more than `n - ceil(n/3)`.
pub fn commit_quorum(n: u32) -> usize {
    (n - n.saturating_sub(1) / 3) as usize
}

/// Find the proposer with commit consensus.
///
/// Committers and the endorsers embedded in their commits count as signers.
/// Only committee members count, each at most once per proposer. The result
/// is for the empty block once more than `c` commits ask for it.
pub fn get_commit_consensus<'a, I, F>(
    commits: I,
    c: u32,
    n: u32,
    is_member: F,
) -> Option<CommitConsensus>
where
    I: IntoIterator<Item = &'a BlockCommitMsg>,
    F: Fn(PeerIndex) -> bool,
{
    let mut signers: BTreeMap<PeerIndex, BTreeSet<PeerIndex>> = BTreeMap::new();
    let mut empty_commits: BTreeMap<PeerIndex, usize> = BTreeMap::new();

    for msg in commits {
        let set = signers.entry(msg.block_proposer).or_default();
        if is_member(msg.committer) {
            set.insert(msg.committer);
        }
        set.extend(msg.endorsers_sig.keys().copied().filter(|e| is_member(*e)));
        if msg.commit_for_empty {
            *empty_commits.entry(msg.block_proposer).or_default() += 1;
        }
    }

    let quorum = commit_quorum(n);
    signers
        .into_iter()
        .find(|(_, set)| set.len() >= quorum)
        .map(|(proposer, _)| CommitConsensus {
            proposer,
            for_empty: empty_commits.get(&proposer).copied().unwrap_or(0) > c as usize,
        })
}
