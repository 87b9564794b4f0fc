//! Primitive identifiers and hashing

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// 32-byte hash (double SHA-256)
pub type Hash = [u8; 32];

/// Index of a committee member in the chain config
pub type PeerIndex = u32;

/// Raw signature bytes as produced by the signer port
pub type Signature = Vec<u8>;

/// All-zero hash, used as the transactions root of empty blocks
pub const ZERO_HASH: Hash = [0u8; 32];

/// Sentinel proposer index for the genesis block
pub const NO_PROPOSER: PeerIndex = u32::MAX;

/// Serialized public key of a committee member
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Double SHA-256 over arbitrary bytes.
pub fn hash_data(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double SHA-512 over arbitrary bytes.
pub fn hash_data_512(data: &[u8]) -> [u8; 64] {
    let first = Sha512::digest(data);
    let second = Sha512::digest(first);
    let mut out = [0u8; 64];
    out.copy_from_slice(&second);
    out
}

/// Short hex form for log lines.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_data_is_double_sha256() {
        let once = Sha256::digest(b"vbft");
        let twice = Sha256::digest(once);
        assert_eq!(hash_data(b"vbft").as_slice(), twice.as_slice());
        assert_ne!(hash_data(b"vbft"), hash_data(b"vbfT"));
    }

    #[test]
    fn test_short_hex() {
        let mut h = ZERO_HASH;
        h[0] = 0xab;
        assert_eq!(short_hex(&h), "ab000000");
    }
}
