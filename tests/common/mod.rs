//! Common test utilities and helpers

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use relink_core::{FeatureSpec, LinkageService, RawSignal, RelinkConfig};
use serde_json::{json, Value};
use std::time::Duration;

/// Fixed base instant so ledgers and ids are reproducible
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Config whose numeric features take already-normalized [0, 1] inputs
pub fn unit_config(features: &[&str]) -> RelinkConfig {
    let mut config = RelinkConfig::default();
    config.features.clear();
    for name in features {
        config
            .features
            .insert(name.to_string(), FeatureSpec::Numeric { min: 0.0, max: 1.0 });
    }
    config.lateness_window = Duration::from_secs(60);
    config.decay_horizon = Duration::from_secs(7 * 86400);
    config
}

pub fn raw_signal(source: &str, epoch: u64, secs: i64, features: Value) -> RawSignal {
    serde_json::from_value(json!({
        "source": source,
        "epoch": epoch,
        "collected_at": at(secs).to_rfc3339(),
        "features": features,
    }))
    .expect("valid raw signal")
}

pub fn observed_signal(
    source: &str,
    observer: &str,
    epoch: u64,
    secs: i64,
    features: Value,
) -> RawSignal {
    let mut raw = raw_signal(source, epoch, secs, features);
    raw.observer = Some(observer.to_string());
    raw
}

pub async fn service(config: RelinkConfig) -> LinkageService {
    LinkageService::new(config)
        .await
        .expect("Failed to create linkage service")
}
