//! # VBFT Metrics
//!
//! Prometheus metrics for monitoring round progress.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! qc-08-vbft = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `vbft_blocks_sealed_total` - Blocks sealed, labeled by `empty`
//! - `vbft_proposals_made_total` - Proposals made by this node
//! - `vbft_messages_rejected_total` - Inbound messages rejected (by reason)
//! - `vbft_blocks_fast_forwarded_total` - Blocks applied without running a round
//! - `vbft_block_height` - Last sealed height
//! - `vbft_node_state` - Lifecycle state as its ordinal

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref BLOCKS_SEALED: IntCounterVec = register_int_counter_vec!(
        "vbft_blocks_sealed_total",
        "Total number of blocks sealed",
        &["empty"]
    )
    .expect("Failed to create BLOCKS_SEALED metric");

    pub static ref PROPOSALS_MADE: IntCounter = register_int_counter!(
        "vbft_proposals_made_total",
        "Total number of proposals made by this node"
    )
    .expect("Failed to create PROPOSALS_MADE metric");

    pub static ref MESSAGES_REJECTED: IntCounterVec = register_int_counter_vec!(
        "vbft_messages_rejected_total",
        "Total number of inbound messages rejected",
        &["reason"]
    )
    .expect("Failed to create MESSAGES_REJECTED metric");

    pub static ref BLOCKS_FAST_FORWARDED: IntCounter = register_int_counter!(
        "vbft_blocks_fast_forwarded_total",
        "Total number of blocks applied without running a round"
    )
    .expect("Failed to create BLOCKS_FAST_FORWARDED metric");

    pub static ref BLOCK_HEIGHT: IntGauge =
        register_int_gauge!("vbft_block_height", "Last sealed block height")
            .expect("Failed to create BLOCK_HEIGHT metric");

    pub static ref NODE_STATE: IntGauge =
        register_int_gauge!("vbft_node_state", "Node lifecycle state")
            .expect("Failed to create NODE_STATE metric");
}

#[cfg(feature = "metrics")]
pub fn record_block_sealed(height: u32, empty: bool) {
    BLOCKS_SEALED
        .with_label_values(&[if empty { "true" } else { "false" }])
        .inc();
    BLOCK_HEIGHT.set(height as i64);
}

#[cfg(feature = "metrics")]
pub fn record_proposal_made() {
    PROPOSALS_MADE.inc();
}

#[cfg(feature = "metrics")]
pub fn record_message_rejected(reason: &str) {
    MESSAGES_REJECTED.with_label_values(&[reason]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_fast_forward() {
    BLOCKS_FAST_FORWARDED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_state(state: u8) {
    NODE_STATE.set(state as i64);
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub fn record_block_sealed(_height: u32, _empty: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_proposal_made() {}

#[cfg(not(feature = "metrics"))]
pub fn record_message_rejected(_reason: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_fast_forward() {}

#[cfg(not(feature = "metrics"))]
pub fn record_state(_state: u8) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_noop_when_disabled() {
        record_block_sealed(3, true);
        record_proposal_made();
        record_message_rejected("decode");
        record_fast_forward();
        record_state(6);
    }
}
