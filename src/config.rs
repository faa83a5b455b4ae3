//! Configuration loaded from environment variables

use std::env;
use std::str::FromStr;

use tracing::warn;

use crate::sdr::{CaptureConfig, GainSetting, OverflowPolicy, RetunePolicy};

/// Where raw samples come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// rtl_tcp server address (`host:port`)
    RtlTcp(String),
    /// In-process generator, no hardware
    Synthetic,
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("synthetic") {
            Ok(Self::Synthetic)
        } else if s.contains(':') {
            Ok(Self::RtlTcp(s.to_string()))
        } else {
            Err(format!("expected 'synthetic' or host:port, got '{}'", s))
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub source: Source,

    /// Pipeline and device settings
    pub capture: CaptureConfig,

    /// Statistics reporting interval in milliseconds
    pub stats_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = CaptureConfig::default();
        let get = |key: &str| lookup(key);

        Self {
            source: parse_or(
                get("IQ_SOURCE"),
                "IQ_SOURCE",
                Source::RtlTcp("127.0.0.1:1234".to_string()),
            ),

            capture: CaptureConfig {
                device_index: parse_or(get("DEVICE_INDEX"), "DEVICE_INDEX", defaults.device_index),
                tuned_frequency: parse_or(
                    get("TUNED_FREQUENCY"),
                    "TUNED_FREQUENCY",
                    defaults.tuned_frequency,
                ),
                sample_rate: parse_or(get("SAMPLE_RATE"), "SAMPLE_RATE", defaults.sample_rate),
                gain: parse_or(get("DEVICE_GAIN"), "DEVICE_GAIN", GainSetting::Max),
                ppm_error: parse_or(get("PPM_ERROR"), "PPM_ERROR", defaults.ppm_error),
                decimation: parse_or(get("DECIMATION"), "DECIMATION", defaults.decimation),
                block_size: parse_or(get("BLOCK_SIZE"), "BLOCK_SIZE", defaults.block_size),
                queue_capacity: parse_or(
                    get("QUEUE_CAPACITY"),
                    "QUEUE_CAPACITY",
                    defaults.queue_capacity,
                ),
                overflow_policy: parse_or(
                    get("OVERFLOW_POLICY"),
                    "OVERFLOW_POLICY",
                    OverflowPolicy::Block,
                ),
                retune_policy: parse_or(
                    get("RETUNE_POLICY"),
                    "RETUNE_POLICY",
                    RetunePolicy::Optimistic,
                ),
            },

            stats_interval_ms: parse_or(get("STATS_INTERVAL_MS"), "STATS_INTERVAL_MS", 5000),
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("Ignoring {}={:?}: {}", key, raw, e);
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.source, Source::RtlTcp("127.0.0.1:1234".to_string()));
        assert_eq!(config.capture.block_size, 16 * 16384);
        assert_eq!(config.capture.queue_capacity, 1);
        assert_eq!(config.capture.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.stats_interval_ms, 5000);
        assert!(config.capture.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("IQ_SOURCE", "synthetic"),
            ("TUNED_FREQUENCY", "145800000"),
            ("DECIMATION", "4"),
            ("OVERFLOW_POLICY", "drop"),
            ("RETUNE_POLICY", "rollback"),
            ("DEVICE_GAIN", "auto"),
        ]);
        assert_eq!(config.source, Source::Synthetic);
        assert_eq!(config.capture.tuned_frequency, 145_800_000);
        assert_eq!(config.capture.decimation, 4);
        assert_eq!(config.capture.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.capture.retune_policy, RetunePolicy::Rollback);
        assert_eq!(config.capture.gain, GainSetting::Auto);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = config_from(&[("SAMPLE_RATE", "fast"), ("IQ_SOURCE", "dongle")]);
        assert_eq!(config.capture.sample_rate, CaptureConfig::default().sample_rate);
        assert_eq!(config.source, Source::RtlTcp("127.0.0.1:1234".to_string()));
    }
}
