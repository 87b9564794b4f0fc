//! secp256k1 ECDSA signer (RFC 6979 deterministic nonces)

use k256::ecdsa::{
    signature::{Signer as _, Verifier as _},
    Signature as EcdsaSignature, SigningKey, VerifyingKey,
};

use crate::domain::{hash_data, ConsensusError, ConsensusResult, PublicKey, Signature};
use crate::ports::Signer;

/// Signer backed by a secp256k1 key.
pub struct K256Signer {
    signing_key: SigningKey,
}

impl K256Signer {
    pub fn random() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Create from secret key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> ConsensusResult<Self> {
        let signing_key = SigningKey::from_bytes((&bytes).into())
            .map_err(|e| ConsensusError::Signer(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Deterministic key for tests and local committees.
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = hash_data(&seed.to_le_bytes());
        loop {
            if let Ok(signer) = Self::from_bytes(bytes) {
                return signer;
            }
            bytes = hash_data(&bytes);
        }
    }
}

impl Signer for K256Signer {
    fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_sec1_bytes().to_vec())
    }

    fn sign(&self, data: &[u8]) -> ConsensusResult<Signature> {
        let sig: EcdsaSignature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| ConsensusError::Signer(e.to_string()))?;
        Ok(sig.to_bytes().to_vec())
    }

    fn verify(&self, pubkey: &PublicKey, data: &[u8], sig: &[u8]) -> ConsensusResult<()> {
        let key = VerifyingKey::from_sec1_bytes(pubkey.as_bytes())
            .map_err(|_| ConsensusError::InvalidSignature("bad public key".into()))?;
        let sig = EcdsaSignature::from_slice(sig)
            .map_err(|_| ConsensusError::InvalidSignature("malformed signature".into()))?;
        key.verify(data, &sig)
            .map_err(|_| ConsensusError::InvalidSignature(format!("rejected for {}", pubkey.to_hex())))
    }
}
