//! Consensus messages and their wire envelope
//!
//! Every payload on the wire is a bincode-encoded envelope
//! `{msg_type, len, payload}`. Decoding reads the tag first and parses the
//! matching variant; unknown tags are rejected.
//!
//! Round messages carry the signatures of the protocol itself. Peer-level
//! messages carry one signature of their sender over the remaining fields.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    hash_data, Block, ChainConfig, ConsensusError, ConsensusResult, Hash, PeerIndex, PublicKey,
    Signature,
};

/// Wire tag of each message kind
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgType {
    BlockProposal = 0,
    BlockEndorse = 1,
    BlockCommit = 2,
    PeerHandshake = 3,
    PeerHeartbeat = 4,
    BlockInfoFetch = 5,
    BlockInfoFetchResp = 6,
    ProposalFetch = 7,
    BlockFetch = 8,
    BlockFetchResp = 9,
    BlockSubmit = 10,
}

impl TryFrom<u8> for MsgType {
    type Error = ConsensusError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MsgType::BlockProposal,
            1 => MsgType::BlockEndorse,
            2 => MsgType::BlockCommit,
            3 => MsgType::PeerHandshake,
            4 => MsgType::PeerHeartbeat,
            5 => MsgType::BlockInfoFetch,
            6 => MsgType::BlockInfoFetchResp,
            7 => MsgType::ProposalFetch,
            8 => MsgType::BlockFetch,
            9 => MsgType::BlockFetchResp,
            10 => MsgType::BlockSubmit,
            other => return Err(ConsensusError::UnknownMessageType(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProposalMsg {
    pub block: Block,
}

impl BlockProposalMsg {
    pub fn block_num(&self) -> u32 {
        self.block.block_num()
    }

    pub fn proposer(&self) -> PeerIndex {
        self.block.proposer()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEndorseMsg {
    pub endorser: PeerIndex,
    pub endorsed_proposer: PeerIndex,
    pub block_num: u32,
    pub endorsed_block_hash: Hash,
    pub endorse_for_empty: bool,
    pub proposer_sig: Signature,
    pub endorser_sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCommitMsg {
    pub committer: PeerIndex,
    pub block_proposer: PeerIndex,
    pub block_num: u32,
    pub commit_block_hash: Hash,
    pub commit_for_empty: bool,
    pub proposer_sig: Signature,
    /// Endorsement signatures this committer observed
    pub endorsers_sig: BTreeMap<PeerIndex, Signature>,
    pub committer_sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHandshakeMsg {
    pub committed_block_number: u32,
    pub committed_block_hash: Hash,
    pub committed_block_leader: PeerIndex,
    pub chain_config: ChainConfig,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHeartbeatMsg {
    pub committed_block_number: u32,
    pub committed_block_hash: Hash,
    pub committed_block_leader: PeerIndex,
    pub endorsers: Vec<PublicKey>,
    pub endorsers_sig: Vec<Signature>,
    pub chain_config_view: u32,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfoFetchMsg {
    pub start_block_num: u32,
    pub sig: Signature,
}

/// Summary of a sealed block served to syncing peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_num: u32,
    pub proposer: PeerIndex,
    pub signatures: BTreeMap<PeerIndex, Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfoFetchRespMsg {
    pub blocks: Vec<BlockInfo>,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFetchMsg {
    pub proposer_id: PeerIndex,
    pub block_num: u32,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFetchMsg {
    pub block_num: u32,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFetchRespMsg {
    pub block_number: u32,
    pub block_hash: Hash,
    pub block: Block,
    pub sig: Signature,
}

/// Peer-level message signed by its sender over every other field.
pub trait PeerSigned {
    /// Digest of the message without its signature.
    fn signing_hash(&self) -> ConsensusResult<Hash>;

    fn sig(&self) -> &Signature;

    fn set_sig(&mut self, sig: Signature);
}

macro_rules! peer_signed {
    ($msg:ident { $($field:ident),+ }) => {
        impl PeerSigned for $msg {
            fn signing_hash(&self) -> ConsensusResult<Hash> {
                let bytes = bincode::serialize(&($(&self.$field,)+))
                    .map_err(|e| ConsensusError::Encode(e.to_string()))?;
                Ok(hash_data(&bytes))
            }

            fn sig(&self) -> &Signature {
                &self.sig
            }

            fn set_sig(&mut self, sig: Signature) {
                self.sig = sig;
            }
        }
    };
}

peer_signed!(PeerHandshakeMsg {
    committed_block_number,
    committed_block_hash,
    committed_block_leader,
    chain_config
});
peer_signed!(PeerHeartbeatMsg {
    committed_block_number,
    committed_block_hash,
    committed_block_leader,
    endorsers,
    endorsers_sig,
    chain_config_view
});
peer_signed!(BlockInfoFetchMsg { start_block_num });
peer_signed!(BlockInfoFetchRespMsg { blocks });
peer_signed!(ProposalFetchMsg { proposer_id, block_num });
peer_signed!(BlockFetchMsg { block_num });
peer_signed!(BlockFetchRespMsg { block_number, block_hash, block });

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSubmitMsg {
    pub block_state_root: Hash,
    pub block_num: u32,
    pub submit_msg_sig: Signature,
}

/// Closed set of consensus messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMsg {
    Proposal(BlockProposalMsg),
    Endorse(BlockEndorseMsg),
    Commit(BlockCommitMsg),
    Handshake(PeerHandshakeMsg),
    Heartbeat(PeerHeartbeatMsg),
    BlockInfoFetch(BlockInfoFetchMsg),
    BlockInfoFetchResp(BlockInfoFetchRespMsg),
    ProposalFetch(ProposalFetchMsg),
    BlockFetch(BlockFetchMsg),
    BlockFetchResp(BlockFetchRespMsg),
    BlockSubmit(BlockSubmitMsg),
}

fn require_sig<'a>(sig: Option<&'a Signature>, what: &str) -> ConsensusResult<&'a Signature> {
    match sig {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ConsensusError::InvalidSignature(format!("missing {}", what))),
    }
}

fn check_peer_signed<M, F>(msg: &M, what: &str, check: F) -> ConsensusResult<()>
where
    M: PeerSigned,
    F: Fn(&Hash, &Signature) -> ConsensusResult<()>,
{
    let sig = require_sig(Some(msg.sig()), what)?;
    check(&msg.signing_hash()?, sig)
}

impl ConsensusMsg {
    pub fn msg_type(&self) -> MsgType {
        match self {
            ConsensusMsg::Proposal(_) => MsgType::BlockProposal,
            ConsensusMsg::Endorse(_) => MsgType::BlockEndorse,
            ConsensusMsg::Commit(_) => MsgType::BlockCommit,
            ConsensusMsg::Handshake(_) => MsgType::PeerHandshake,
            ConsensusMsg::Heartbeat(_) => MsgType::PeerHeartbeat,
            ConsensusMsg::BlockInfoFetch(_) => MsgType::BlockInfoFetch,
            ConsensusMsg::BlockInfoFetchResp(_) => MsgType::BlockInfoFetchResp,
            ConsensusMsg::ProposalFetch(_) => MsgType::ProposalFetch,
            ConsensusMsg::BlockFetch(_) => MsgType::BlockFetch,
            ConsensusMsg::BlockFetchResp(_) => MsgType::BlockFetchResp,
            ConsensusMsg::BlockSubmit(_) => MsgType::BlockSubmit,
        }
    }

    /// Round of the message; zero for peer-level messages.
    pub fn block_num(&self) -> u32 {
        match self {
            ConsensusMsg::Proposal(m) => m.block_num(),
            ConsensusMsg::Endorse(m) => m.block_num,
            ConsensusMsg::Commit(m) => m.block_num,
            ConsensusMsg::BlockFetchResp(m) => m.block_number,
            ConsensusMsg::BlockSubmit(m) => m.block_num,
            _ => 0,
        }
    }

    /// Check each signature the message carries. `check` verifies one
    /// signature over a digest against the sender's key.
    pub fn verify<F>(&self, check: F) -> ConsensusResult<()>
    where
        F: Fn(&Hash, &Signature) -> ConsensusResult<()>,
    {
        match self {
            ConsensusMsg::Proposal(m) => {
                let sig = require_sig(m.block.proposer_sig(), "proposer signature")?;
                check(&m.block.hash(), sig)?;
                if let Some(empty) = &m.block.empty_block {
                    let sig = require_sig(empty.sig_data.first(), "empty block signature")?;
                    check(&empty.hash(), sig)?;
                }
                Ok(())
            }
            ConsensusMsg::Endorse(m) => check(
                &m.endorsed_block_hash,
                require_sig(Some(&m.endorser_sig), "endorser signature")?,
            ),
            ConsensusMsg::Commit(m) => check(
                &m.commit_block_hash,
                require_sig(Some(&m.committer_sig), "committer signature")?,
            ),
            ConsensusMsg::BlockSubmit(m) => check(
                &m.block_state_root,
                require_sig(Some(&m.submit_msg_sig), "submit signature")?,
            ),
            ConsensusMsg::Handshake(m) => check_peer_signed(m, "handshake signature", check),
            ConsensusMsg::Heartbeat(m) => check_peer_signed(m, "heartbeat signature", check),
            ConsensusMsg::BlockInfoFetch(m) => {
                check_peer_signed(m, "block info fetch signature", check)
            }
            ConsensusMsg::BlockInfoFetchResp(m) => {
                check_peer_signed(m, "block info response signature", check)
            }
            ConsensusMsg::ProposalFetch(m) => {
                check_peer_signed(m, "proposal fetch signature", check)
            }
            ConsensusMsg::BlockFetch(m) => check_peer_signed(m, "block fetch signature", check),
            ConsensusMsg::BlockFetchResp(m) => {
                check_peer_signed(m, "block response signature", check)
            }
        }
    }

    fn payload(&self) -> bincode::Result<Vec<u8>> {
        match self {
            ConsensusMsg::Proposal(m) => bincode::serialize(m),
            ConsensusMsg::Endorse(m) => bincode::serialize(m),
            ConsensusMsg::Commit(m) => bincode::serialize(m),
            ConsensusMsg::Handshake(m) => bincode::serialize(m),
            ConsensusMsg::Heartbeat(m) => bincode::serialize(m),
            ConsensusMsg::BlockInfoFetch(m) => bincode::serialize(m),
            ConsensusMsg::BlockInfoFetchResp(m) => bincode::serialize(m),
            ConsensusMsg::ProposalFetch(m) => bincode::serialize(m),
            ConsensusMsg::BlockFetch(m) => bincode::serialize(m),
            ConsensusMsg::BlockFetchResp(m) => bincode::serialize(m),
            ConsensusMsg::BlockSubmit(m) => bincode::serialize(m),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MsgEnvelope {
    msg_type: u8,
    len: u32,
    payload: Vec<u8>,
}

/// Encode a message into its wire envelope.
pub fn encode_msg(msg: &ConsensusMsg) -> ConsensusResult<Vec<u8>> {
    let payload = msg
        .payload()
        .map_err(|e| ConsensusError::Encode(e.to_string()))?;
    let envelope = MsgEnvelope {
        msg_type: msg.msg_type() as u8,
        len: payload.len() as u32,
        payload,
    };
    bincode::serialize(&envelope).map_err(|e| ConsensusError::Encode(e.to_string()))
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> ConsensusResult<T> {
    Ok(bincode::deserialize(payload)?)
}

/// Decode a wire envelope. The declared length must match the payload and
/// the tag is checked before the body is parsed.
pub fn decode_msg(bytes: &[u8]) -> ConsensusResult<ConsensusMsg> {
    let envelope: MsgEnvelope = bincode::deserialize(bytes)?;
    if envelope.len as usize != envelope.payload.len() {
        return Err(ConsensusError::PayloadLength {
            declared: envelope.len,
            actual: envelope.payload.len(),
        });
    }
    let p = &envelope.payload;
    Ok(match MsgType::try_from(envelope.msg_type)? {
        MsgType::BlockProposal => ConsensusMsg::Proposal(parse(p)?),
        MsgType::BlockEndorse => ConsensusMsg::Endorse(parse(p)?),
        MsgType::BlockCommit => ConsensusMsg::Commit(parse(p)?),
        MsgType::PeerHandshake => ConsensusMsg::Handshake(parse(p)?),
        MsgType::PeerHeartbeat => ConsensusMsg::Heartbeat(parse(p)?),
        MsgType::BlockInfoFetch => ConsensusMsg::BlockInfoFetch(parse(p)?),
        MsgType::BlockInfoFetchResp => ConsensusMsg::BlockInfoFetchResp(parse(p)?),
        MsgType::ProposalFetch => ConsensusMsg::ProposalFetch(parse(p)?),
        MsgType::BlockFetch => ConsensusMsg::BlockFetch(parse(p)?),
        MsgType::BlockFetchResp => ConsensusMsg::BlockFetchResp(parse(p)?),
        MsgType::BlockSubmit => ConsensusMsg::BlockSubmit(parse(p)?),
    })
}

/// Deduplication key of an encoded message.
pub fn msg_hash(bytes: &[u8]) -> Hash {
    hash_data(bytes)
}
