//! Log-odds evidence accumulation and verdict thresholds
//!
//! Each observation contributes `gain * decay * (raw - midpoint)` log-odds.
//! Raw similarity above the midpoint argues for a link and below it argues
//! against, so many consistent moderate scores can outweigh one strong
//! outlier. Decay only scales how much an observation counts; a stale match
//! is weak evidence for a link, never evidence against one. Addition is
//! commutative: the accumulated value does not depend on arrival order.
//!
//! Confidence is the logistic of the clamped sum:
//!
//! ```text
//! confidence = 1 / (1 + e^(-clamp(L, -max, max)))
//! ```

use crate::config::{AccumulatorConfig, RelinkConfig};
use crate::types::Verdict;

/// Accumulator parameters together with the verdict thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub accumulator: AccumulatorConfig,
    pub high_threshold: f64,
    pub low_threshold: f64,
}

impl DecisionPolicy {
    pub fn from_config(config: &RelinkConfig) -> Self {
        Self {
            accumulator: config.accumulator.clone(),
            high_threshold: config.high_threshold,
            low_threshold: config.low_threshold,
        }
    }

    /// Log-odds before any evidence
    pub fn prior(&self) -> f64 {
        self.accumulator.prior_log_odds
    }

    /// Fold one observation into the running log-odds
    ///
    /// `raw` is the undecayed similarity and `decay` the time multiplier.
    pub fn accumulate(&self, log_odds: f64, raw: f64, decay: f64) -> f64 {
        let raw = raw.clamp(0.0, 1.0);
        let decay = decay.clamp(0.0, 1.0);
        log_odds + self.accumulator.gain * decay * (raw - self.accumulator.midpoint)
    }

    pub fn confidence(&self, log_odds: f64) -> f64 {
        let bound = self.accumulator.max_log_odds;
        let x = log_odds.clamp(-bound, bound);
        1.0 / (1.0 + (-x).exp())
    }

    /// Provisional verdict for an open decision
    pub fn verdict(&self, confidence: f64) -> Verdict {
        if confidence >= self.high_threshold {
            Verdict::Linked
        } else if confidence <= self.low_threshold {
            Verdict::Unlinked
        } else {
            Verdict::Pending
        }
    }

    /// Verdict a decision freezes with when its window closes
    pub fn final_verdict(&self, current: Verdict) -> Verdict {
        match current {
            Verdict::Pending => Verdict::Ambiguous,
            other => other,
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::from_config(&RelinkConfig::default())
    }
}
