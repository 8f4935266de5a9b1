//! Signal ingestion pipeline
//!
//! - **queue**: bounded queue between producers and the pull-based consumer
//! - **reorder**: lateness buffer restoring `collected_at` order
//! - **pairing**: reset registry and epoch-crossing candidate generation

pub mod pairing;
pub mod queue;
pub mod reorder;

pub use pairing::{Candidate, Pairer, PairingRules, ResetRegistry};
pub use queue::{Enqueued, IngestQueue};
pub use reorder::ReorderBuffer;
