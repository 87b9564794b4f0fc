//! Adapters layer (Hexagonal Architecture)
//!
//! In-memory implementations of the outbound ports, used by tests and by
//! single-process deployments, plus the secp256k1 signer.

mod k256_signer;
mod memory_network;
pub(crate) mod memory_store;
mod memory_tx_pool;

pub use k256_signer::*;
pub use memory_network::*;
pub use memory_store::*;
pub use memory_tx_pool::*;
