//! Summary statistics over the evidence ledger
//!
//! [`summarize`] is a pure function of a ledger snapshot: it replays decision
//! transitions to recover the latest state of every decision and aggregates
//! those. Nothing here holds state of its own.

use crate::ledger::{LedgerPayload, LedgerSnapshot};
use crate::types::{PairId, ResetEventId, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of equal-width confidence buckets over [0, 1]
pub const HISTOGRAM_BUCKETS: usize = 10;

/// Which decisions a report covers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFilter {
    /// Only decisions across this reset
    pub reset: Option<ResetEventId>,

    /// Only transitions recorded at or after this instant
    pub since: Option<DateTime<Utc>>,

    /// Only transitions recorded before this instant
    pub until: Option<DateTime<Utc>>,

    /// Skip decisions that are still open
    pub finalized_only: bool,
}

impl ReportFilter {
    pub fn for_reset(reset: ResetEventId) -> Self {
        Self {
            reset: Some(reset),
            ..Default::default()
        }
    }

    fn admits_time(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| at >= since) && self.until.map_or(true, |until| at < until)
    }
}

/// Verdict counts for one reset event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetSummary {
    pub occurred_at: Option<DateTime<Utc>>,
    pub linked: u64,
    pub unlinked: u64,
    pub ambiguous: u64,
    pub pending: u64,
}

impl ResetSummary {
    fn count(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Linked => self.linked += 1,
            Verdict::Unlinked => self.unlinked += 1,
            Verdict::Ambiguous => self.ambiguous += 1,
            Verdict::Pending => self.pending += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.linked + self.unlinked + self.ambiguous + self.pending
    }

    /// Share of settled pairs that were re-linked
    pub fn reidentification_rate(&self) -> Option<f64> {
        reidentification_rate(self.linked, self.unlinked, self.ambiguous)
    }
}

/// Aggregate view over the selected decisions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub decisions: u64,
    pub finalized: u64,
    pub linked: u64,
    pub unlinked: u64,
    pub ambiguous: u64,
    pub pending: u64,
    pub per_reset: BTreeMap<ResetEventId, ResetSummary>,
    /// Decision confidences in ten equal buckets; bucket 9 includes 1.0
    pub confidence_histogram: [u64; HISTOGRAM_BUCKETS],
    pub mean_confidence: Option<f64>,
    /// `linked / (linked + unlinked + ambiguous)` over finalized decisions
    pub reidentification_rate: Option<f64>,
    /// Ledger records the report was computed from
    pub ledger_records: u64,
}

#[derive(Debug, Clone, Copy)]
struct Latest {
    verdict: Verdict,
    confidence: f64,
    finalized: bool,
}

fn reidentification_rate(linked: u64, unlinked: u64, ambiguous: u64) -> Option<f64> {
    let settled = linked + unlinked + ambiguous;
    if settled == 0 {
        None
    } else {
        Some(linked as f64 / settled as f64)
    }
}

fn bucket(confidence: f64) -> usize {
    let index = (confidence.clamp(0.0, 1.0) * HISTOGRAM_BUCKETS as f64) as usize;
    index.min(HISTOGRAM_BUCKETS - 1)
}

/// Aggregate the decisions recorded in `snapshot`
pub fn summarize(snapshot: &LedgerSnapshot, filter: &ReportFilter) -> ReportStatistics {
    let mut resets: BTreeMap<ResetEventId, DateTime<Utc>> = BTreeMap::new();
    let mut latest: BTreeMap<PairId, Latest> = BTreeMap::new();

    for stored in snapshot.records() {
        match &stored.payload {
            LedgerPayload::ResetRecorded { reset } => {
                resets.insert(reset.id, reset.occurred_at);
            }
            LedgerPayload::Transition(t) => {
                if filter.reset.is_some_and(|r| r != t.pair_id.reset) {
                    continue;
                }
                if !filter.admits_time(stored.record.recorded_at) {
                    continue;
                }
                latest.insert(
                    t.pair_id.clone(),
                    Latest {
                        verdict: t.to,
                        confidence: t.confidence,
                        finalized: t.finalized,
                    },
                );
            }
            LedgerPayload::SignalAccepted { .. } => {}
        }
    }

    let mut stats = ReportStatistics {
        ledger_records: snapshot.len() as u64,
        ..Default::default()
    };
    let mut confidence_sum = 0.0;
    let (mut final_linked, mut final_unlinked, mut final_ambiguous) = (0, 0, 0);

    for (pair_id, state) in &latest {
        if filter.finalized_only && !state.finalized {
            continue;
        }

        stats.decisions += 1;
        confidence_sum += state.confidence;
        stats.confidence_histogram[bucket(state.confidence)] += 1;

        match state.verdict {
            Verdict::Linked => stats.linked += 1,
            Verdict::Unlinked => stats.unlinked += 1,
            Verdict::Ambiguous => stats.ambiguous += 1,
            Verdict::Pending => stats.pending += 1,
        }
        if state.finalized {
            stats.finalized += 1;
            match state.verdict {
                Verdict::Linked => final_linked += 1,
                Verdict::Unlinked => final_unlinked += 1,
                Verdict::Ambiguous => final_ambiguous += 1,
                Verdict::Pending => {}
            }
        }

        stats
            .per_reset
            .entry(pair_id.reset)
            .or_insert_with(|| ResetSummary {
                occurred_at: resets.get(&pair_id.reset).copied(),
                ..Default::default()
            })
            .count(state.verdict);
    }

    if stats.decisions > 0 {
        stats.mean_confidence = Some(confidence_sum / stats.decisions as f64);
    }
    stats.reidentification_rate =
        reidentification_rate(final_linked, final_unlinked, final_ambiguous);
    stats
}
