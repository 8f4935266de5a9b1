//! Similarity scoring for candidate pairs
//!
//! - **decay**: time-decay multiplier and the pairing horizon
//! - **similarity**: weighted per-feature similarity across a reset boundary

pub mod decay;
pub mod similarity;

pub use decay::TimeDecay;
pub use similarity::{feature_similarity, SimilarityScorer};
