//! Time decay of correlation evidence
//!
//! Fresh post-reset observations are stronger evidence than stale ones. The
//! multiplier is 1 at the reset, never increases with the gap, and is exactly
//! 0 from the horizon on. Pairs at or past the horizon are pruned by the
//! pairing stage and never reach the scorer.

use crate::config::{chrono_span, DecayCurve, RelinkConfig};
use chrono::Duration;

/// Decay multiplier over the gap between a reset and a post-reset signal
#[derive(Debug, Clone)]
pub struct TimeDecay {
    horizon: Duration,
    curve: DecayCurve,
}

impl TimeDecay {
    pub fn new(horizon: Duration, curve: DecayCurve) -> Self {
        Self { horizon, curve }
    }

    pub fn from_config(config: &RelinkConfig) -> Self {
        Self::new(config.decay_horizon_span(), config.decay_curve.clone())
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Whether a post-reset signal at `gap` may be paired at all
    pub fn within_horizon(&self, gap: Duration) -> bool {
        gap < self.horizon
    }

    /// Multiplier in [0, 1] for a signal `gap` after the reset
    pub fn multiplier(&self, gap: Duration) -> f64 {
        if gap <= Duration::zero() {
            return 1.0;
        }
        if !self.within_horizon(gap) {
            return 0.0;
        }

        let gap_ms = gap.num_milliseconds() as f64;
        let value = match &self.curve {
            DecayCurve::Linear => 1.0 - gap_ms / self.horizon.num_milliseconds() as f64,
            DecayCurve::Exponential { half_life } => {
                let half_ms = chrono_span(*half_life).num_milliseconds().max(1) as f64;
                0.5f64.powf(gap_ms / half_ms)
            }
        };
        value.clamp(0.0, 1.0)
    }
}
