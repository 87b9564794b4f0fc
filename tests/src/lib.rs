//! # Quantum-Chain Test Suite
//!
//! Multi-node tests for the VBFT engine. Every node runs in-process and
//! talks over the in-memory network.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/      # Committees sealing, syncing and recovering
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p qc-tests integration::
//!
//! # with engine logs
//! RUST_LOG=qc_08_vbft=debug cargo test -p qc-tests -- --nocapture
//! ```

#![allow(dead_code)]

pub mod integration;
