//! Core data types for the relink linkage engine
//!
//! Signals, reset events, candidate pairs, similarity scores and linkage
//! decisions. Signals and reset events are immutable once built; scores are
//! derived views; decisions are owned by the linkage engine and mirrored into
//! the evidence ledger.

use crate::digest::Digest;
use crate::error::{RelinkError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier lifetime between resets
pub type Epoch = u64;

/// Code reserved for categorical values outside the configured enumeration
pub const UNKNOWN_CATEGORY: u32 = u32::MAX;

/// Content-addressed signal identifier
///
/// Derived from the signal's fields, so the same observation gets the same
/// id no matter when or in which order it was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub Digest);

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sig-{}", self.0.short())
    }
}

/// One normalized feature slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeatureValue {
    /// Scaled into [0, 1]
    Numeric(f64),

    /// Index into the feature's enumeration, or `UNKNOWN_CATEGORY`
    Categorical(u32),

    /// Not measured; distinct from "measured as zero"
    Absent,
}

impl FeatureValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FeatureValue::Absent)
    }
}

/// A normalized observation of one session at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    id: SignalId,
    source: String,
    observer: Option<String>,
    source_epoch: Epoch,
    collected_at: DateTime<Utc>,
    features: BTreeMap<String, FeatureValue>,
}

#[derive(Serialize)]
struct SignalBody<'a> {
    source: &'a str,
    observer: Option<&'a str>,
    source_epoch: Epoch,
    collected_at: DateTime<Utc>,
    features: &'a BTreeMap<String, FeatureValue>,
}

impl Signal {
    /// Build a signal and derive its id from its content
    pub fn new(
        source: impl Into<String>,
        observer: Option<String>,
        source_epoch: Epoch,
        collected_at: DateTime<Utc>,
        features: BTreeMap<String, FeatureValue>,
    ) -> Result<Self> {
        let source = source.into();
        let body = SignalBody {
            source: &source,
            observer: observer.as_deref(),
            source_epoch,
            collected_at,
            features: &features,
        };
        let id = SignalId(Digest::of_json("relink.signal.v1", &body)?);

        Ok(Self {
            id,
            source,
            observer,
            source_epoch,
            collected_at,
            features,
        })
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn observer(&self) -> Option<&str> {
        self.observer.as_deref()
    }

    pub fn source_epoch(&self) -> Epoch {
        self.source_epoch
    }

    pub fn collected_at(&self) -> DateTime<Utc> {
        self.collected_at
    }

    pub fn features(&self) -> &BTreeMap<String, FeatureValue> {
        &self.features
    }

    /// Feature value, treating undeclared slots as absent
    pub fn feature(&self, name: &str) -> FeatureValue {
        self.features.get(name).copied().unwrap_or(FeatureValue::Absent)
    }
}

/// Identifier of a reset event; equal to the epoch it opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResetEventId(pub Epoch);

impl std::fmt::Display for ResetEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reset-{}", self.0)
    }
}

/// Boundary action that moves the identifier into its next epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetEvent {
    pub id: ResetEventId,
    pub occurred_at: DateTime<Utc>,
    pub old_epoch: Epoch,
    pub new_epoch: Epoch,
}

impl ResetEvent {
    /// Build a reset event, enforcing `new_epoch = old_epoch + 1`
    pub fn new(old_epoch: Epoch, new_epoch: Epoch, occurred_at: DateTime<Utc>) -> Result<Self> {
        if old_epoch.checked_add(1) != Some(new_epoch) {
            return Err(RelinkError::InvalidResetEvent(format!(
                "epoch {} cannot follow {}",
                new_epoch, old_epoch
            )));
        }
        Ok(Self {
            id: ResetEventId(new_epoch),
            occurred_at,
            old_epoch,
            new_epoch,
        })
    }
}

/// Session-level key under which a linkage decision accumulates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairId {
    pub reset: ResetEventId,
    pub pre_source: String,
    pub post_source: String,
}

impl PairId {
    pub fn new(
        reset: ResetEventId,
        pre_source: impl Into<String>,
        post_source: impl Into<String>,
    ) -> Self {
        Self {
            reset,
            pre_source: pre_source.into(),
            post_source: post_source.into(),
        }
    }
}

impl std::fmt::Display for PairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}->{}", self.reset, self.pre_source, self.post_source)
    }
}

/// A pre-/post-reset signal pair eligible for scoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub pair_id: PairId,
    pub pre_signal: SignalId,
    pub post_signal: SignalId,
    /// Milliseconds between the reset and the post-reset signal
    pub gap_ms: i64,
}

/// How much one feature contributed to a score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub feature: String,
    /// Weight after redistribution over comparable features (sums to 1)
    pub weight: f64,
    /// 1 - distance
    pub similarity: f64,
}

/// Bounded similarity of one candidate pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub pair_id: PairId,
    pub pre_signal: SignalId,
    pub post_signal: SignalId,
    /// Decayed score in [0, 1]
    pub value: f64,
    /// Weighted similarity before decay
    pub raw: f64,
    /// Time-decay multiplier applied to `raw`
    pub decay: f64,
    pub contributions: Vec<FeatureContribution>,
}

/// Linkage verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Not enough evidence either way yet
    Pending,
    Linked,
    Unlinked,
    /// Window closed while still undecided
    Ambiguous,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pending => write!(f, "pending"),
            Verdict::Linked => write!(f, "linked"),
            Verdict::Unlinked => write!(f, "unlinked"),
            Verdict::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

/// Current state of a linkage decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkageDecision {
    pub pair_id: PairId,
    pub verdict: Verdict,
    pub confidence: f64,
    /// Scored observations accumulated
    pub evidence_count: u32,
    /// Observations that could not be scored for lack of comparable features
    pub insufficient_count: u32,
    pub finalized: bool,
    pub decided_at: DateTime<Utc>,
}
