//! Append-only, hash-chained evidence ledger
//!
//! Every accepted reset, every signal that entered pairing and every decision
//! transition is recorded here. The ledger is the canonical history; decisions
//! held by the engine are a view over it.
//!
//! - **record**: payload types, sealing and chain verification
//! - **store**: persistence seam (in-memory and JSONL file)

pub mod record;
pub mod store;

pub use record::{
    seal, verify_records, DecisionTransition, EvidenceRecord, LedgerPayload, StoredRecord,
    TransitionCause, VerificationReport,
};
pub use store::{JsonlStore, LedgerHeader, LedgerStore, MemoryStore};

use crate::digest::Digest;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Parse and verify a persisted ledger in one step
pub fn verify_bytes(contents: &[u8]) -> Result<VerificationReport> {
    let (_, records) = store::parse_ledger(contents)?;
    verify_records(&records)
}

/// The evidence ledger
///
/// Appends are serialized behind a single write lock, so sequence numbers and
/// links are assigned in one total order even with concurrent writers.
/// Records are shared, so readers copy pointers under the lock and do their
/// hashing after releasing it.
pub struct EvidenceLedger {
    records: RwLock<Vec<Arc<StoredRecord>>>,
    store: Box<dyn LedgerStore>,
}

impl EvidenceLedger {
    /// Ledger that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            store: Box::new(MemoryStore),
        }
    }

    /// Open a ledger over `store`, continuing any chain it already holds
    ///
    /// A chain that fails verification is still opened: the failure is
    /// logged, `verify()` keeps reporting it, and new records link onto the
    /// stored tail.
    pub async fn open(store: Box<dyn LedgerStore>) -> Result<Self> {
        let records = store.load().await?;
        match verify_records(&records) {
            Ok(report) => info!(
                "Opened evidence ledger with {} records (head {})",
                report.records,
                report.head.short()
            ),
            Err(e) => warn!("Evidence ledger failed verification on open: {}", e),
        }

        Ok(Self {
            records: RwLock::new(records.into_iter().map(Arc::new).collect()),
            store,
        })
    }

    /// Append a payload as the next record
    pub async fn append(&self, payload: LedgerPayload) -> Result<EvidenceRecord> {
        self.append_at(payload, Utc::now()).await
    }

    pub(crate) async fn append_at(
        &self,
        payload: LedgerPayload,
        recorded_at: DateTime<Utc>,
    ) -> Result<EvidenceRecord> {
        let mut records = self.records.write().await;

        let sequence_number = records.len() as u64;
        let prev = records
            .last()
            .map(|r| r.record.record_hash)
            .unwrap_or(Digest::GENESIS);

        let stored = seal(sequence_number, prev, payload, recorded_at)?;
        self.store.append(&stored).await?;

        let record = stored.record;
        records.push(Arc::new(stored));
        debug!(
            "Ledger append #{} ({})",
            record.sequence_number,
            record.record_hash.short()
        );
        Ok(record)
    }

    /// Recompute the whole chain as of now
    ///
    /// Appends made while the hashes are recomputed are not covered.
    pub async fn verify(&self) -> Result<VerificationReport> {
        self.snapshot().await.verify()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Point-in-time copy of every record
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let records = self.records.read().await.clone();
        LedgerSnapshot {
            records: Arc::new(records),
        }
    }
}

/// Immutable view of the ledger at one moment
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    records: Arc<Vec<Arc<StoredRecord>>>,
}

impl LedgerSnapshot {
    pub fn from_records(records: Vec<StoredRecord>) -> Self {
        Self {
            records: Arc::new(records.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn records(&self) -> &[Arc<StoredRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The first `len` records; any prefix of a valid chain verifies
    pub fn prefix(&self, len: usize) -> &[Arc<StoredRecord>] {
        &self.records[..len.min(self.records.len())]
    }

    pub fn verify(&self) -> Result<VerificationReport> {
        verify_records(self.records.as_slice())
    }
}
