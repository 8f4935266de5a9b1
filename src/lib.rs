//! Relink - Reset Linkage Measurement
//!
//! Measures whether a user-initiated identifier reset actually breaks
//! tracking continuity, or whether a tracker can still re-link the post-reset
//! entity to its pre-reset identity from auxiliary signals.
//!
//! # Architecture
//!
//! - **Normalizer**: raw collector payloads into typed, epoch-tagged signals
//! - **Ingest**: bounded queue, lateness reordering and epoch-crossing pairing
//! - **Scoring**: weighted per-feature similarity with time decay
//! - **Linkage**: per-pair evidence accumulation into Linked / Unlinked / Ambiguous
//! - **Ledger**: append-only, hash-chained evidence log
//! - **Reporter**: pure statistics over a ledger snapshot
//!
//! # Example
//!
//! ```ignore
//! use relink_core::{LinkageService, RelinkConfig, ReportFilter};
//!
//! #[tokio::main]
//! async fn main() -> relink_core::Result<()> {
//!     let service = LinkageService::new(RelinkConfig::default()).await?;
//!
//!     service.submit_signal_json(r#"{"source": "dev-1", "epoch": 0,
//!         "collected_at": "2024-05-01T10:00:00Z", "features": {"screen_w": 1080}}"#).await?;
//!     service.submit_reset_event(0, 1, "2024-05-01T12:00:00Z".parse()?).await?;
//!     service.submit_signal_json(r#"{"source": "dev-1b", "epoch": 1,
//!         "collected_at": "2024-05-01T12:05:00Z", "features": {"screen_w": 1080}}"#).await?;
//!
//!     service.flush().await?;
//!     service.finalize_all().await?;
//!
//!     let report = service.get_report(&ReportFilter::default()).await;
//!     println!("re-identification rate: {:?}", report.reidentification_rate);
//!     service.verify_ledger().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod digest;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod linkage;
pub mod normalizer;
pub mod reporter;
pub mod scoring;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::{BackpressurePolicy, DecayCurve, FeatureSpec, RelinkConfig};
pub use digest::Digest;
pub use error::{RelinkError, Result};
pub use ledger::{EvidenceLedger, EvidenceRecord, LedgerSnapshot, VerificationReport};
pub use normalizer::{FeatureNormalizer, RawSignal};
pub use reporter::{summarize, ReportFilter, ReportStatistics};
pub use scoring::SimilarityScorer;
pub use service::{LinkageService, ProcessSummary};
pub use types::{
    CandidatePair, Epoch, FeatureValue, LinkageDecision, PairId, ResetEvent, ResetEventId,
    Signal, SignalId, SimilarityScore, Verdict,
};
