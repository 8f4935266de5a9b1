//! Weighted similarity between a pre-reset and a post-reset signal
//!
//! # Scoring
//!
//! 1. Per feature: numeric similarity is `1 - |a - b|`; categorical
//!    similarity is 1 on an exact match and 0 otherwise. Features absent on
//!    either side are not comparable and drop out.
//! 2. The weights of the comparable features are renormalized to sum to 1,
//!    which redistributes the weight of missing features proportionally.
//! 3. The weighted mean is multiplied by the time-decay factor for the gap
//!    between the reset and the post-reset signal.
//!
//! Scoring is a pure function of its inputs: features are visited in name
//! order, so identical inputs always produce bit-identical scores.

use crate::config::RelinkConfig;
use crate::error::{RelinkError, Result};
use crate::scoring::decay::TimeDecay;
use crate::types::{
    FeatureContribution, FeatureValue, PairId, ResetEvent, Signal, SimilarityScore,
    UNKNOWN_CATEGORY,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Similarity of a single feature slot, or `None` when not comparable
pub fn feature_similarity(a: FeatureValue, b: FeatureValue) -> Option<f64> {
    match (a, b) {
        (FeatureValue::Numeric(x), FeatureValue::Numeric(y)) => {
            Some(1.0 - (x - y).abs().min(1.0))
        }
        (FeatureValue::Categorical(x), FeatureValue::Categorical(y)) => {
            // The unknown code identifies nothing, so it never matches
            let matched = x == y && x != UNKNOWN_CATEGORY;
            Some(if matched { 1.0 } else { 0.0 })
        }
        _ => None,
    }
}

/// Scores candidate pairs with fixed weights and decay
#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    weights: BTreeMap<String, f64>,
    min_comparable_features: usize,
    decay: TimeDecay,
}

impl SimilarityScorer {
    pub fn new(
        weights: BTreeMap<String, f64>,
        min_comparable_features: usize,
        decay: TimeDecay,
    ) -> Self {
        Self {
            weights,
            min_comparable_features,
            decay,
        }
    }

    /// Weights for every declared feature, defaulting to 1.0
    pub fn from_config(config: &RelinkConfig) -> Self {
        let weights = config
            .features
            .keys()
            .map(|name| (name.clone(), config.weight_of(name)))
            .collect();
        Self::new(
            weights,
            config.min_comparable_features,
            TimeDecay::from_config(config),
        )
    }

    pub fn decay(&self) -> &TimeDecay {
        &self.decay
    }

    /// Weighted mean similarity over comparable features, before decay
    ///
    /// Symmetric in its arguments.
    pub fn weighted_similarity(
        &self,
        a: &Signal,
        b: &Signal,
    ) -> Result<(f64, Vec<FeatureContribution>)> {
        let mut comparable = Vec::new();
        for (name, weight) in &self.weights {
            if *weight <= 0.0 {
                continue;
            }
            if let Some(similarity) = feature_similarity(a.feature(name), b.feature(name)) {
                comparable.push((name, *weight, similarity));
            }
        }

        if comparable.len() < self.min_comparable_features || comparable.is_empty() {
            return Err(RelinkError::InsufficientSignal {
                comparable: comparable.len(),
                required: self.min_comparable_features,
            });
        }

        let total_weight: f64 = comparable.iter().map(|(_, w, _)| w).sum();
        let mut raw = 0.0;
        let mut contributions = Vec::with_capacity(comparable.len());
        for (name, weight, similarity) in comparable {
            let share = weight / total_weight;
            raw += share * similarity;
            contributions.push(FeatureContribution {
                feature: name.clone(),
                weight: share,
                similarity,
            });
        }

        Ok((raw.clamp(0.0, 1.0), contributions))
    }

    /// Score a pre-reset signal against a post-reset signal across `reset`
    pub fn score(&self, pre: &Signal, post: &Signal, reset: &ResetEvent) -> Result<SimilarityScore> {
        let pair_id = PairId::new(reset.id, pre.source(), post.source());
        let (raw, contributions) = self.weighted_similarity(pre, post)?;

        let gap = post.collected_at() - reset.occurred_at;
        let decay = self.decay.multiplier(gap);
        let value = (raw * decay).clamp(0.0, 1.0);

        debug!(
            "Scored {} ({} vs {}): raw {:.3} x decay {:.3} = {:.3}",
            pair_id,
            pre.id(),
            post.id(),
            raw,
            decay,
            value
        );

        Ok(SimilarityScore {
            pair_id,
            pre_signal: pre.id(),
            post_signal: post.id(),
            value,
            raw,
            decay,
            contributions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecayCurve;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn signal(source: &str, epoch: u64, secs: i64, features: &[(&str, FeatureValue)]) -> Signal {
        let features = features
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        Signal::new(source, None, epoch, at(secs), features).unwrap()
    }

    fn scorer(weights: &[(&str, f64)], min: usize) -> SimilarityScorer {
        SimilarityScorer::new(
            weights.iter().map(|(k, w)| (k.to_string(), *w)).collect(),
            min,
            TimeDecay::new(Duration::days(7), DecayCurve::Linear),
        )
    }

    #[test]
    fn test_identical_signals_score_one() {
        let s = scorer(&[("screen_w", 1.0), ("platform", 1.0)], 1);
        let reset = ResetEvent::new(0, 1, at(0)).unwrap();
        let features = [
            ("screen_w", FeatureValue::Numeric(0.4)),
            ("platform", FeatureValue::Categorical(2)),
        ];
        let pre = signal("a", 0, -10, &features);
        let post = signal("b", 1, 0, &features);

        let score = s.score(&pre, &post, &reset).unwrap();
        assert_eq!(score.raw, 1.0);
        assert_eq!(score.decay, 1.0);
        assert_eq!(score.value, 1.0);
        assert_eq!(score.pair_id, PairId::new(reset.id, "a", "b"));
    }

    #[test]
    fn test_absent_weight_is_redistributed() {
        let s = scorer(&[("screen_w", 3.0), ("clock_skew", 1.0)], 1);
        let pre = signal(
            "a",
            0,
            0,
            &[
                ("screen_w", FeatureValue::Numeric(0.5)),
                ("clock_skew", FeatureValue::Absent),
            ],
        );
        let post = signal("b", 1, 0, &[("screen_w", FeatureValue::Numeric(0.25))]);

        let (raw, contributions) = s.weighted_similarity(&pre, &post).unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].weight, 1.0);
        assert!((raw - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_categorical_mismatch_and_unknown() {
        assert_eq!(
            feature_similarity(FeatureValue::Categorical(1), FeatureValue::Categorical(1)),
            Some(1.0)
        );
        assert_eq!(
            feature_similarity(FeatureValue::Categorical(1), FeatureValue::Categorical(2)),
            Some(0.0)
        );
        assert_eq!(
            feature_similarity(
                FeatureValue::Categorical(UNKNOWN_CATEGORY),
                FeatureValue::Categorical(UNKNOWN_CATEGORY)
            ),
            Some(0.0)
        );
        assert_eq!(
            feature_similarity(FeatureValue::Absent, FeatureValue::Numeric(0.3)),
            None
        );
    }

    #[test]
    fn test_insufficient_comparable_features() {
        let s = scorer(&[("screen_w", 1.0), ("clock_skew", 1.0)], 2);
        let pre = signal("a", 0, 0, &[("screen_w", FeatureValue::Numeric(0.5))]);
        let post = signal(
            "b",
            1,
            0,
            &[
                ("screen_w", FeatureValue::Numeric(0.5)),
                ("clock_skew", FeatureValue::Numeric(0.5)),
            ],
        );

        let err = s.weighted_similarity(&pre, &post).unwrap_err();
        assert!(matches!(
            err,
            RelinkError::InsufficientSignal {
                comparable: 1,
                required: 2
            }
        ));
    }

    #[test]
    fn test_disjoint_features_are_insufficient() {
        let s = scorer(&[("screen_w", 1.0), ("clock_skew", 1.0)], 1);
        let pre = signal("a", 0, 0, &[("screen_w", FeatureValue::Numeric(0.5))]);
        let post = signal("b", 1, 0, &[("clock_skew", FeatureValue::Numeric(0.5))]);
        assert!(matches!(
            s.weighted_similarity(&pre, &post),
            Err(RelinkError::InsufficientSignal { comparable: 0, .. })
        ));
    }

    #[test]
    fn test_zero_weight_features_ignored() {
        let s = scorer(&[("screen_w", 1.0), ("platform", 0.0)], 1);
        let pre = signal(
            "a",
            0,
            0,
            &[
                ("screen_w", FeatureValue::Numeric(0.5)),
                ("platform", FeatureValue::Categorical(0)),
            ],
        );
        let post = signal(
            "b",
            1,
            0,
            &[
                ("screen_w", FeatureValue::Numeric(0.5)),
                ("platform", FeatureValue::Categorical(1)),
            ],
        );
        let (raw, contributions) = s.weighted_similarity(&pre, &post).unwrap();
        assert_eq!(raw, 1.0);
        assert_eq!(contributions.len(), 1);
    }

    #[test]
    fn test_decay_applied_to_late_signal() {
        let s = scorer(&[("screen_w", 1.0)], 1);
        let reset = ResetEvent::new(0, 1, at(0)).unwrap();
        let features = [("screen_w", FeatureValue::Numeric(0.5))];
        let pre = signal("a", 0, -100, &features);
        let post = signal("b", 1, 7 * 86400 / 2, &features);

        let score = s.score(&pre, &post, &reset).unwrap();
        assert_eq!(score.raw, 1.0);
        assert!((score.decay - 0.5).abs() < 1e-9);
        assert!((score.value - 0.5).abs() < 1e-9);
    }

    fn feature_strategy() -> impl Strategy<Value = FeatureValue> {
        prop_oneof![
            (0.0f64..=1.0).prop_map(FeatureValue::Numeric),
            Just(FeatureValue::Absent),
        ]
    }

    proptest! {
        #[test]
        fn prop_score_is_deterministic_and_symmetric(
            a in proptest::collection::vec(feature_strategy(), 4),
            b in proptest::collection::vec(feature_strategy(), 4),
            weights in proptest::collection::vec(0.1f64..10.0, 4),
        ) {
            let names = ["f0", "f1", "f2", "f3"];
            let s = SimilarityScorer::new(
                names.iter().zip(&weights).map(|(n, w)| (n.to_string(), *w)).collect(),
                1,
                TimeDecay::new(Duration::days(1), DecayCurve::Linear),
            );
            let fa: Vec<(&str, FeatureValue)> = names.iter().copied().zip(a).collect();
            let fb: Vec<(&str, FeatureValue)> = names.iter().copied().zip(b).collect();
            let pre = signal("a", 0, -5, &fa);
            let post = signal("b", 1, 5, &fb);
            let reset = ResetEvent::new(0, 1, at(0)).unwrap();

            let first = s.score(&pre, &post, &reset);
            let second = s.score(&pre, &post, &reset);
            match (first, second) {
                (Ok(x), Ok(y)) => {
                    prop_assert_eq!(x.value.to_bits(), y.value.to_bits());
                    prop_assert!((0.0..=1.0).contains(&x.value));
                    let (forward, _) = s.weighted_similarity(&pre, &post).unwrap();
                    let (backward, _) = s.weighted_similarity(&post, &pre).unwrap();
                    prop_assert_eq!(forward.to_bits(), backward.to_bits());
                }
                (Err(_), Err(_)) => {}
                _ => prop_assert!(false, "scoring was not deterministic"),
            }
        }
    }
}
