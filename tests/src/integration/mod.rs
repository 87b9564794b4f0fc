//! Integration flows across whole committees

pub mod vbft_flows;
