//! Feature normalization
//!
//! Turns heterogeneous raw collector payloads into [`Signal`]s with one slot
//! per declared feature. Numeric features are min-max scaled into [0, 1],
//! categorical features are mapped onto a fixed enumeration, and anything
//! missing is recorded as [`FeatureValue::Absent`] rather than zero so the
//! scorer can tell "dissimilar" from "unmeasured".

use crate::config::FeatureSpec;
use crate::error::{RelinkError, Result};
use crate::types::{Epoch, FeatureValue, Signal, UNKNOWN_CATEGORY};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Payload as handed over by an external collector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSignal {
    /// Session or device stream the observation belongs to
    #[serde(default)]
    pub source: Option<String>,

    /// Tracker that made the observation
    #[serde(default)]
    pub observer: Option<String>,

    /// Identifier epoch tag
    #[serde(default)]
    pub epoch: Option<Epoch>,

    /// RFC 3339 string or integer milliseconds since the Unix epoch
    #[serde(default)]
    pub collected_at: Option<Value>,

    #[serde(default)]
    pub features: serde_json::Map<String, Value>,
}

impl RawSignal {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RelinkError::MalformedSignal(e.to_string()))
    }
}

/// Non-fatal problem found while normalizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationWarning {
    /// Feature not in the declared set; dropped
    UnknownFeature(String),

    /// Value of the wrong JSON type for the slot
    TypeMismatch { feature: String, expected: &'static str },

    /// Categorical value outside the enumeration
    UnknownCategory { feature: String, value: String },
}

impl std::fmt::Display for NormalizationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizationWarning::UnknownFeature(name) => {
                write!(f, "unknown feature '{}' dropped", name)
            }
            NormalizationWarning::TypeMismatch { feature, expected } => {
                write!(f, "feature '{}' expected {}", feature, expected)
            }
            NormalizationWarning::UnknownCategory { feature, value } => {
                write!(f, "feature '{}' has unknown category '{}'", feature, value)
            }
        }
    }
}

/// Normalized signal plus whatever was dropped on the way
#[derive(Debug, Clone)]
pub struct Normalized {
    pub signal: Signal,
    pub warnings: Vec<NormalizationWarning>,
}

/// Maps raw payloads onto the declared feature slots
#[derive(Debug, Clone)]
pub struct FeatureNormalizer {
    features: BTreeMap<String, FeatureSpec>,
}

impl FeatureNormalizer {
    pub fn new(features: BTreeMap<String, FeatureSpec>) -> Self {
        Self { features }
    }

    /// Normalize one raw payload
    ///
    /// Fails only when a mandatory field (source, epoch, collected_at) is
    /// missing or unparseable.
    pub fn normalize(&self, raw: &RawSignal) -> Result<Normalized> {
        let source = raw
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RelinkError::MalformedSignal("missing source".to_string()))?;
        let epoch = raw
            .epoch
            .ok_or_else(|| RelinkError::MalformedSignal("missing epoch tag".to_string()))?;
        let collected_at = parse_timestamp(raw.collected_at.as_ref())?;

        let mut warnings = Vec::new();

        for name in raw.features.keys() {
            if !self.features.contains_key(name) {
                warn!("Dropping unknown feature '{}' from source {}", name, source);
                warnings.push(NormalizationWarning::UnknownFeature(name.clone()));
            }
        }

        let mut features = BTreeMap::new();
        for (name, spec) in &self.features {
            let value = match raw.features.get(name) {
                None | Some(Value::Null) => FeatureValue::Absent,
                Some(value) => normalize_value(name, spec, value, &mut warnings),
            };
            features.insert(name.clone(), value);
        }

        let observer = raw
            .observer
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string);

        let signal = Signal::new(source, observer, epoch, collected_at, features)?;
        debug!(
            "Normalized {} (epoch {}, {} warnings)",
            signal.id(),
            epoch,
            warnings.len()
        );

        Ok(Normalized { signal, warnings })
    }
}

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => Err(RelinkError::MalformedSignal(
            "missing collected_at timestamp".to_string(),
        )),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RelinkError::MalformedSignal(format!("bad collected_at '{}': {}", s, e))),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| RelinkError::MalformedSignal(format!("bad collected_at {}", n))),
        Some(other) => Err(RelinkError::MalformedSignal(format!(
            "collected_at must be a string or integer, got {}",
            other
        ))),
    }
}

fn normalize_value(
    name: &str,
    spec: &FeatureSpec,
    value: &Value,
    warnings: &mut Vec<NormalizationWarning>,
) -> FeatureValue {
    match spec {
        FeatureSpec::Numeric { min, max } => match value.as_f64().filter(|v| v.is_finite()) {
            Some(v) => FeatureValue::Numeric(((v - min) / (max - min)).clamp(0.0, 1.0)),
            None => {
                warnings.push(NormalizationWarning::TypeMismatch {
                    feature: name.to_string(),
                    expected: "a finite number",
                });
                FeatureValue::Absent
            }
        },
        FeatureSpec::Categorical { categories } => {
            let label = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    warnings.push(NormalizationWarning::TypeMismatch {
                        feature: name.to_string(),
                        expected: "a scalar category",
                    });
                    return FeatureValue::Absent;
                }
            };

            match categories
                .iter()
                .position(|c| c.eq_ignore_ascii_case(&label))
            {
                Some(index) => FeatureValue::Categorical(index as u32),
                None => {
                    warnings.push(NormalizationWarning::UnknownCategory {
                        feature: name.to_string(),
                        value: label,
                    });
                    FeatureValue::Categorical(UNKNOWN_CATEGORY)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> FeatureNormalizer {
        let mut features = BTreeMap::new();
        features.insert(
            "screen_w".to_string(),
            FeatureSpec::Numeric {
                min: 0.0,
                max: 4000.0,
            },
        );
        features.insert(
            "platform".to_string(),
            FeatureSpec::Categorical {
                categories: vec!["android".to_string(), "ios".to_string()],
            },
        );
        FeatureNormalizer::new(features)
    }

    fn raw(value: Value) -> RawSignal {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_numeric_scaling_and_clipping() {
        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 0,
                "collected_at": "2024-05-01T10:00:00Z",
                "features": {"screen_w": 1000}
            })))
            .unwrap();
        assert_eq!(out.signal.feature("screen_w"), FeatureValue::Numeric(0.25));

        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 0,
                "collected_at": 0,
                "features": {"screen_w": 9000}
            })))
            .unwrap();
        assert_eq!(out.signal.feature("screen_w"), FeatureValue::Numeric(1.0));
    }

    #[test]
    fn test_missing_feature_is_absent_not_zero() {
        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 2,
                "collected_at": 1_700_000_000_000i64,
                "features": {"platform": null}
            })))
            .unwrap();
        assert!(out.signal.feature("screen_w").is_absent());
        assert!(out.signal.feature("platform").is_absent());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_categorical_mapping() {
        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 0,
                "collected_at": 0,
                "features": {"platform": "iOS"}
            })))
            .unwrap();
        assert_eq!(out.signal.feature("platform"), FeatureValue::Categorical(1));

        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 0,
                "collected_at": 0,
                "features": {"platform": "symbian"}
            })))
            .unwrap();
        assert_eq!(
            out.signal.feature("platform"),
            FeatureValue::Categorical(UNKNOWN_CATEGORY)
        );
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_unknown_feature_dropped_with_warning() {
        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 0,
                "collected_at": 0,
                "features": {"canvas_hash": "abc", "screen_w": 2000}
            })))
            .unwrap();
        assert!(!out.signal.features().contains_key("canvas_hash"));
        assert_eq!(
            out.warnings,
            vec![NormalizationWarning::UnknownFeature("canvas_hash".to_string())]
        );
    }

    #[test]
    fn test_type_mismatch_becomes_absent() {
        let out = normalizer()
            .normalize(&raw(json!({
                "source": "dev-1",
                "epoch": 0,
                "collected_at": 0,
                "features": {"screen_w": "wide"}
            })))
            .unwrap();
        assert!(out.signal.feature("screen_w").is_absent());
        assert!(matches!(
            out.warnings[0],
            NormalizationWarning::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_missing_mandatory_fields() {
        let n = normalizer();

        let no_epoch = raw(json!({"source": "dev-1", "collected_at": 0}));
        assert!(matches!(
            n.normalize(&no_epoch),
            Err(RelinkError::MalformedSignal(_))
        ));

        let no_time = raw(json!({"source": "dev-1", "epoch": 0}));
        assert!(matches!(
            n.normalize(&no_time),
            Err(RelinkError::MalformedSignal(_))
        ));

        let bad_time = raw(json!({"source": "dev-1", "epoch": 0, "collected_at": "yesterday"}));
        assert!(matches!(
            n.normalize(&bad_time),
            Err(RelinkError::MalformedSignal(_))
        ));

        let no_source = raw(json!({"source": "  ", "epoch": 0, "collected_at": 0}));
        assert!(matches!(
            n.normalize(&no_source),
            Err(RelinkError::MalformedSignal(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            RawSignal::from_json("not json"),
            Err(RelinkError::MalformedSignal(_))
        ));
    }
}
