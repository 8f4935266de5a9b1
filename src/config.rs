//! Linkage engine configuration
//!
//! Feature definitions, weights, thresholds, decay and ingestion settings.
//!
//! # Configuration File Format
//!
//! TOML, usually `relink.toml`:
//!
//! ```toml
//! high_threshold = 0.85
//! low_threshold = 0.15
//! decay_horizon = 604800        # seconds
//! lateness_window = 60          # seconds
//! min_comparable_features = 2
//! backpressure_policy = "drop_oldest"
//!
//! [features.screen_w]
//! kind = "numeric"
//! min = 0.0
//! max = 8192.0
//!
//! [features.platform]
//! kind = "categorical"
//! categories = ["android", "ios", "windows", "macos", "linux"]
//!
//! [feature_weights]
//! screen_w = 2.0
//! platform = 0.5
//! ```
//!
//! Any field may be overridden from the environment with a `RELINK__` prefix,
//! e.g. `RELINK__HIGH_THRESHOLD=0.9`.

use crate::error::{RelinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Longest duration any window or horizon may span
const MAX_WINDOW: Duration = Duration::from_secs(3650 * 86400);

/// How a raw feature value is brought into a comparable slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSpec {
    /// Min-max scaled into [0, 1] and clipped
    Numeric { min: f64, max: f64 },

    /// Mapped onto a fixed enumeration; unlisted values become the unknown code
    Categorical { categories: Vec<String> },
}

/// Shape of the time-decay multiplier between the reset and the horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecayCurve {
    /// Falls linearly from 1 at the reset to 0 at the horizon
    #[default]
    Linear,

    /// Halves every `half_life` seconds, cut to 0 at the horizon
    Exponential {
        #[serde(with = "serde_duration")]
        half_life: Duration,
    },
}

/// What to do when the ingestion queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Refuse the incoming signal
    #[default]
    Reject,

    /// Evict the oldest queued signal to make room
    DropOldest,
}

/// Parameters of the log-odds evidence accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Starting log-odds before any evidence
    pub prior_log_odds: f64,

    /// Log-odds added per unit of score above the midpoint
    pub gain: f64,

    /// Score that carries no evidence either way
    pub midpoint: f64,

    /// Saturation bound applied when reading confidence
    pub max_log_odds: f64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            prior_log_odds: 0.0,
            gain: 8.0,
            midpoint: 0.5,
            max_log_odds: 12.0,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelinkConfig {
    /// Declared feature set; anything else in a raw signal is dropped
    ///
    /// Names must be lowercase: the environment and file layering used by
    /// [`RelinkConfig::load`] folds keys to lowercase.
    pub features: BTreeMap<String, FeatureSpec>,

    /// Per-feature weights; declared features without an entry weigh 1.0
    pub feature_weights: BTreeMap<String, f64>,

    /// Confidence at or above which a pair is Linked
    pub high_threshold: f64,

    /// Confidence at or below which a pair is Unlinked
    pub low_threshold: f64,

    /// Post-reset signals at or beyond this gap are never paired
    #[serde(with = "serde_duration")]
    pub decay_horizon: Duration,

    pub decay_curve: DecayCurve,

    /// How far before a reset a pre-reset signal may lie
    #[serde(with = "serde_duration")]
    pub pre_reset_window: Duration,

    /// Comparable features required to produce a score
    pub min_comparable_features: usize,

    /// Bounded out-of-order tolerance of the ingestion stream
    #[serde(with = "serde_duration")]
    pub lateness_window: Duration,

    pub backpressure_policy: BackpressurePolicy,

    /// Maximum number of queued, unprocessed signals
    pub queue_capacity: usize,

    pub accumulator: AccumulatorConfig,

    /// Epoch in force before the first reset event
    pub initial_epoch: u64,

    /// Observers whose signals may be correlated with each other
    pub collusion_groups: Vec<Vec<String>>,

    /// JSONL evidence log; in-memory ledger when unset
    pub ledger_path: Option<PathBuf>,
}

// Custom serde module for Duration (serialize/deserialize as seconds)
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

fn numeric(min: f64, max: f64) -> FeatureSpec {
    FeatureSpec::Numeric { min, max }
}

fn categorical(values: &[&str]) -> FeatureSpec {
    FeatureSpec::Categorical {
        categories: values.iter().map(|v| v.to_string()).collect(),
    }
}

impl Default for RelinkConfig {
    fn default() -> Self {
        let mut features = BTreeMap::new();
        features.insert("screen_w".to_string(), numeric(0.0, 8192.0));
        features.insert("screen_h".to_string(), numeric(0.0, 8192.0));
        features.insert("clock_skew".to_string(), numeric(-1000.0, 1000.0)); // ms
        features.insert("tz_offset".to_string(), numeric(-720.0, 840.0)); // minutes
        features.insert(
            "platform".to_string(),
            categorical(&["android", "ios", "windows", "macos", "linux"]),
        );
        features.insert(
            "gpu_vendor".to_string(),
            categorical(&["qualcomm", "arm", "apple", "nvidia", "amd", "intel"]),
        );

        Self {
            features,
            feature_weights: BTreeMap::new(),
            high_threshold: 0.85,
            low_threshold: 0.15,
            decay_horizon: Duration::from_secs(7 * 86400),
            decay_curve: DecayCurve::Linear,
            pre_reset_window: Duration::from_secs(7 * 86400),
            min_comparable_features: 1,
            lateness_window: Duration::from_secs(60),
            backpressure_policy: BackpressurePolicy::Reject,
            queue_capacity: 1024,
            accumulator: AccumulatorConfig::default(),
            initial_epoch: 0,
            collusion_groups: Vec::new(),
            ledger_path: None,
        }
    }
}

/// Convert a validated std duration into a chrono span
pub(crate) fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl RelinkConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: RelinkConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional config file under `RELINK__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELINK")
                .separator("__")
                .try_parsing(true),
        );

        let config: RelinkConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| RelinkError::Configuration(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Effective weight of a declared feature
    pub fn weight_of(&self, feature: &str) -> f64 {
        self.feature_weights.get(feature).copied().unwrap_or(1.0)
    }

    pub fn decay_horizon_span(&self) -> chrono::Duration {
        chrono_span(self.decay_horizon)
    }

    pub fn pre_reset_window_span(&self) -> chrono::Duration {
        chrono_span(self.pre_reset_window)
    }

    pub fn lateness_span(&self) -> chrono::Duration {
        chrono_span(self.lateness_window)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.validate_thresholds()?;
        self.validate_features()?;
        self.validate_windows()?;
        self.validate_accumulator()?;

        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1"));
        }

        for group in &self.collusion_groups {
            if group.len() < 2 || group.iter().any(|o| o.trim().is_empty()) {
                return Err(invalid(
                    "collusion_groups entries need at least two non-empty observers",
                ));
            }
        }

        Ok(())
    }

    fn validate_thresholds(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(self.high_threshold) || !in_unit(self.low_threshold) {
            return Err(invalid("thresholds must lie within [0, 1]"));
        }
        if self.low_threshold >= self.high_threshold {
            return Err(invalid("low_threshold must be below high_threshold"));
        }
        Ok(())
    }

    fn validate_features(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(invalid("at least one feature must be declared"));
        }

        for (name, spec) in &self.features {
            if name.chars().any(char::is_uppercase) {
                return Err(invalid(&format!(
                    "feature name '{}' must be lowercase",
                    name
                )));
            }
            match spec {
                FeatureSpec::Numeric { min, max } => {
                    if !min.is_finite() || !max.is_finite() || min >= max {
                        return Err(invalid(&format!(
                            "{}: numeric bounds need finite min < max",
                            name
                        )));
                    }
                }
                FeatureSpec::Categorical { categories } => {
                    if categories.is_empty() {
                        return Err(invalid(&format!("{}: no categories declared", name)));
                    }
                    let unique: HashSet<&String> = categories.iter().collect();
                    if unique.len() != categories.len() {
                        return Err(invalid(&format!("{}: duplicate categories", name)));
                    }
                }
            }
        }

        for (name, weight) in &self.feature_weights {
            if !self.features.contains_key(name) {
                return Err(invalid(&format!("weight given for undeclared feature {}", name)));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(invalid(&format!("{}: weight must be finite and >= 0", name)));
            }
        }

        let weighted = self
            .features
            .keys()
            .filter(|name| self.weight_of(name) > 0.0)
            .count();
        if weighted == 0 {
            return Err(invalid("all feature weights are zero"));
        }
        if self.min_comparable_features == 0 || self.min_comparable_features > weighted {
            return Err(invalid(&format!(
                "min_comparable_features must be between 1 and {}",
                weighted
            )));
        }

        Ok(())
    }

    fn validate_windows(&self) -> Result<()> {
        if self.decay_horizon.is_zero() || self.decay_horizon > MAX_WINDOW {
            return Err(invalid("decay_horizon must be between 1 second and 10 years"));
        }
        if self.pre_reset_window.is_zero() || self.pre_reset_window > MAX_WINDOW {
            return Err(invalid("pre_reset_window must be between 1 second and 10 years"));
        }
        if self.lateness_window > MAX_WINDOW {
            return Err(invalid("lateness_window must be at most 10 years"));
        }
        if let DecayCurve::Exponential { half_life } = &self.decay_curve {
            if half_life.is_zero() {
                return Err(invalid("exponential decay needs a positive half_life"));
            }
        }
        Ok(())
    }

    fn validate_accumulator(&self) -> Result<()> {
        let acc = &self.accumulator;
        if !acc.gain.is_finite() || acc.gain <= 0.0 {
            return Err(invalid("accumulator.gain must be positive"));
        }
        if !acc.midpoint.is_finite() || acc.midpoint <= 0.0 || acc.midpoint >= 1.0 {
            return Err(invalid("accumulator.midpoint must lie strictly within (0, 1)"));
        }
        if !acc.max_log_odds.is_finite() || acc.max_log_odds <= 0.0 {
            return Err(invalid("accumulator.max_log_odds must be positive"));
        }
        if !acc.prior_log_odds.is_finite() {
            return Err(invalid("accumulator.prior_log_odds must be finite"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> RelinkError {
    RelinkError::Configuration(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelinkConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_inverted_thresholds() {
        let config = RelinkConfig {
            high_threshold: 0.2,
            low_threshold: 0.8,
            ..Default::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("low_threshold must be below high_threshold"));
    }

    #[test]
    fn test_validate_threshold_out_of_range() {
        let config = RelinkConfig {
            high_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RelinkError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_negative_weight() {
        let mut config = RelinkConfig::default();
        config.feature_weights.insert("screen_w".to_string(), -1.0);

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("weight must be finite"));
    }

    #[test]
    fn test_validate_weight_for_unknown_feature() {
        let mut config = RelinkConfig::default();
        config.feature_weights.insert("canvas_hash".to_string(), 1.0);

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("undeclared feature"));
    }

    #[test]
    fn test_validate_rejects_uppercase_feature_name() {
        let mut config = RelinkConfig::default();
        config
            .features
            .insert("screenW".to_string(), FeatureSpec::Numeric { min: 0.0, max: 1.0 });

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("must be lowercase"));
    }

    #[test]
    fn test_validate_all_weights_zero() {
        let mut config = RelinkConfig::default();
        for name in config.features.keys().cloned().collect::<Vec<_>>() {
            config.feature_weights.insert(name, 0.0);
        }

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("all feature weights are zero"));
    }

    #[test]
    fn test_validate_min_comparable_too_large() {
        let config = RelinkConfig {
            min_comparable_features: 50,
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("min_comparable_features"));
    }

    #[test]
    fn test_validate_zero_horizon() {
        let config = RelinkConfig {
            decay_horizon: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_collusion_group_needs_two() {
        let config = RelinkConfig {
            collusion_groups: vec![vec!["tracker.example".to_string()]],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            high_threshold = 0.9
            low_threshold = 0.1
            decay_horizon = 3600
            lateness_window = 5
            min_comparable_features = 2
            backpressure_policy = "drop_oldest"

            [decay_curve]
            kind = "exponential"
            half_life = 600

            [features.screen_w]
            kind = "numeric"
            min = 0.0
            max = 4096.0

            [features.platform]
            kind = "categorical"
            categories = ["android", "ios"]

            [feature_weights]
            screen_w = 3.0
        "#;

        let config = RelinkConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.high_threshold, 0.9);
        assert_eq!(config.decay_horizon, Duration::from_secs(3600));
        assert_eq!(config.backpressure_policy, BackpressurePolicy::DropOldest);
        assert_eq!(
            config.decay_curve,
            DecayCurve::Exponential {
                half_life: Duration::from_secs(600)
            }
        );
        assert_eq!(config.weight_of("screen_w"), 3.0);
        assert_eq!(config.weight_of("platform"), 1.0);
        // Fields not in the file keep their defaults
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let result = RelinkConfig::from_toml("high_threshold = 0.1\nlow_threshold = 0.5\n");
        assert!(matches!(result, Err(RelinkError::Configuration(_))));
    }

    #[test]
    fn test_serialize_roundtrip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("relink.toml");

        let config = RelinkConfig::default();
        config.to_file(&path).unwrap();
        let loaded = RelinkConfig::from_file(&path).unwrap();

        assert_eq!(config.features, loaded.features);
        assert_eq!(config.decay_horizon, loaded.decay_horizon);
    }

    #[test]
    fn test_load_layers_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("relink.toml");
        std::fs::write(&path, "high_threshold = 0.95\nqueue_capacity = 16\n").unwrap();

        let config = RelinkConfig::load(Some(&path)).unwrap();
        assert_eq!(config.high_threshold, 0.95);
        assert_eq!(config.queue_capacity, 16);
        assert!(!config.features.is_empty());
    }
}
