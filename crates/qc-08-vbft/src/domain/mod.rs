//! Domain layer for the VBFT engine
//!
//! Pure types and functions: blocks, chain config, participant selection,
//! the message set and quorum arithmetic. Nothing here performs I/O.

mod block;
pub(crate) mod chain_config;
mod error;
mod hash;
mod messages;
mod participants;
mod quorum;

pub use block::*;
pub use chain_config::*;
pub use error::*;
pub use hash::*;
pub use messages::*;
pub use participants::*;
pub use quorum::*;
