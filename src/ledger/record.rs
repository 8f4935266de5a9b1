//! Evidence records and their payloads
//!
//! A record header carries the payload digest, the previous record's digest
//! and its own digest over the header fields. Changing any byte of a stored
//! record therefore breaks verification at that record.

use crate::digest::Digest;
use crate::error::{RelinkError, Result};
use crate::types::{Epoch, PairId, ResetEvent, SignalId, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

const PAYLOAD_DOMAIN: &str = "relink.payload.v1";
const RECORD_DOMAIN: &str = "relink.record.v1";

/// Why a decision moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionCause {
    /// First candidate pair for this session pair was seen
    Opened,

    /// A similarity score was folded into the accumulator
    Evidence {
        pre_signal: SignalId,
        post_signal: SignalId,
        score: f64,
        raw: f64,
        decay: f64,
    },

    /// The pair could not be scored
    Insufficient {
        pre_signal: SignalId,
        post_signal: SignalId,
        comparable: usize,
        required: usize,
    },

    /// Observation window closed or finalize was requested
    Finalized,
}

/// One state transition of a linkage decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTransition {
    pub pair_id: PairId,
    pub cause: TransitionCause,
    pub from: Verdict,
    pub to: Verdict,
    pub confidence: f64,
    pub evidence_count: u32,
    pub finalized: bool,
}

/// Everything the ledger can record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerPayload {
    /// An epoch boundary was accepted
    ResetRecorded { reset: ResetEvent },

    /// A normalized signal entered pairing
    SignalAccepted {
        signal: SignalId,
        source: String,
        epoch: Epoch,
        collected_at: DateTime<Utc>,
    },

    /// A linkage decision changed
    Transition(DecisionTransition),
}

impl LedgerPayload {
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_json(PAYLOAD_DOMAIN, self)?)
    }
}

/// Hash-chained header of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub sequence_number: u64,
    pub payload_hash: Digest,
    pub prev_record_hash: Digest,
    pub record_hash: Digest,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RecordHeader<'a> {
    sequence_number: u64,
    payload_hash: &'a Digest,
    prev_record_hash: &'a Digest,
    recorded_at: &'a DateTime<Utc>,
}

impl EvidenceRecord {
    /// Digest over every header field except `record_hash` itself
    pub fn compute_hash(&self) -> Result<Digest> {
        let header = RecordHeader {
            sequence_number: self.sequence_number,
            payload_hash: &self.payload_hash,
            prev_record_hash: &self.prev_record_hash,
            recorded_at: &self.recorded_at,
        };
        Ok(Digest::of_json(RECORD_DOMAIN, &header)?)
    }
}

/// Record header together with the payload it covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(flatten)]
    pub record: EvidenceRecord,
    pub payload: LedgerPayload,
}

/// Build the record that follows `prev_record_hash` at `sequence_number`
pub fn seal(
    sequence_number: u64,
    prev_record_hash: Digest,
    payload: LedgerPayload,
    recorded_at: DateTime<Utc>,
) -> Result<StoredRecord> {
    let mut record = EvidenceRecord {
        sequence_number,
        payload_hash: payload.digest()?,
        prev_record_hash,
        record_hash: Digest::GENESIS,
        recorded_at,
    };
    record.record_hash = record.compute_hash()?;
    Ok(StoredRecord { record, payload })
}

/// Outcome of a successful chain verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub records: u64,
    /// Hash of the last record, or genesis for an empty ledger
    pub head: Digest,
}

/// Recompute the chain, failing at the first divergent record
pub fn verify_records<R: Borrow<StoredRecord>>(records: &[R]) -> Result<VerificationReport> {
    let mut expected_prev = Digest::GENESIS;

    for (index, stored) in records.iter().enumerate() {
        let stored: &StoredRecord = stored.borrow();
        let position = index as u64;
        let record = &stored.record;
        let broken = |reason: String| RelinkError::LedgerIntegrity {
            sequence_number: position,
            reason,
        };

        if record.sequence_number != position {
            return Err(broken(format!(
                "sequence number {} out of order",
                record.sequence_number
            )));
        }

        let payload_hash = stored.payload.digest()?;
        if payload_hash != record.payload_hash {
            return Err(broken(format!(
                "payload hash mismatch: expected {}, got {}",
                payload_hash, record.payload_hash
            )));
        }

        if record.prev_record_hash != expected_prev {
            return Err(broken(format!(
                "chain broken: expected prev {}, got {}",
                expected_prev, record.prev_record_hash
            )));
        }

        let record_hash = record.compute_hash()?;
        if record_hash != record.record_hash {
            return Err(broken(format!(
                "record hash mismatch: expected {}, got {}",
                record_hash, record.record_hash
            )));
        }

        expected_prev = record.record_hash;
    }

    Ok(VerificationReport {
        records: records.len() as u64,
        head: expected_prev,
    })
}
