//! Linkage decisions across reset boundaries
//!
//! - **accumulator**: log-odds evidence combination and verdict thresholds
//! - **engine**: per-pair state machine writing every transition to the ledger

pub mod accumulator;
pub mod engine;

pub use accumulator::DecisionPolicy;
pub use engine::DecisionEngine;
