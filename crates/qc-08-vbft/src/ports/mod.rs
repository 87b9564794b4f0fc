//! Ports layer (Hexagonal Architecture)
//!
//! Outbound ports are the collaborators the engine drives: block store,
//! signer, transport and transaction pool, plus the narrow capabilities the
//! syncer needs. The inbound port is what a hosting node calls.

mod inbound;
mod outbound;

pub use inbound::*;
pub use outbound::*;
