//! Error types for the VBFT engine

use super::PeerIndex;

/// Consensus error types
///
/// Duplicate and conflict errors are rejections of a single message or
/// action; the round state is left unchanged. Missing-data errors mean
/// "not ready yet" and are retried via fetch or timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("Duplicate proposal from peer {proposer} for block {block_num}")]
    DuplicateProposal { block_num: u32, proposer: PeerIndex },

    #[error("Duplicate endorsement from peer {endorser} for block {block_num}")]
    DuplicateEndorsement { block_num: u32, endorser: PeerIndex },

    #[error("Peer {endorser} already endorsed the empty block {block_num}")]
    EmptyEndorsementLocked { block_num: u32, endorser: PeerIndex },

    #[error("Duplicate commit from peer {committer} for block {block_num}")]
    DuplicateCommit { block_num: u32, committer: PeerIndex },

    #[error("Block {block_num} already endorsed proposer {existing}, rejecting {requested}")]
    EndorseConflict {
        block_num: u32,
        existing: PeerIndex,
        requested: PeerIndex,
    },

    #[error("Block {block_num} already committed proposer {existing}, rejecting {requested}")]
    CommitConflict {
        block_num: u32,
        existing: PeerIndex,
        requested: PeerIndex,
    },

    #[error("Double seal of block {block_num}: sealed by {sealed}, got {proposer}")]
    DoubleSeal {
        block_num: u32,
        sealed: PeerIndex,
        proposer: PeerIndex,
    },

    #[error("No candidate for block {0}")]
    NoCandidate(u32),

    #[error("Proposal from {proposer} for block {block_num} not available")]
    ProposalNotFound { block_num: u32, proposer: PeerIndex },

    #[error("Block {block_num} from {proposer} has no empty variant")]
    NoEmptyBlock { block_num: u32, proposer: PeerIndex },

    #[error("Block {0} not found")]
    BlockNotFound(u32),

    #[error("Block {block_num} parent hash mismatch")]
    PrevBlockHashMismatch { block_num: u32 },

    #[error("Message for block {block_num} too far ahead of current {current}")]
    FarFutureMessage { block_num: u32, current: u32 },

    #[error("Seal of block {block_num} out of order, current block is {current}")]
    OutOfOrderSeal { block_num: u32, current: u32 },

    #[error("Sync mismatch at block {0}")]
    SyncMismatch(u32),

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid VRF for block {0}")]
    InvalidVrf(u32),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerIndex),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Payload length mismatch: declared {declared}, actual {actual}")]
    PayloadLength { declared: u32, actual: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid timeout for {0}")]
    InvalidTimeout(&'static str),

    #[error("Invalid chain config: {0}")]
    InvalidChainConfig(String),

    #[error("Invalid participant config for block {block_num}: {reason}")]
    InvalidParticipants { block_num: u32, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Result alias for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConsensusError::DoubleSeal {
            block_num: 7,
            sealed: 1,
            proposer: 2,
        };
        assert_eq!(
            err.to_string(),
            "Double seal of block 7: sealed by 1, got 2"
        );
    }
}
