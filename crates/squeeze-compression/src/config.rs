//! Configuration for adaptive compression
//!
//! Defaults are overlaid with optional environment overrides. Missing or
//! unparseable values fall back to the default for that field.

use serde::{Deserialize, Serialize};
use squeeze_core::{Error, Result};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable for the minimum compressible size (bytes)
pub const ENV_MIN_SIZE: &str = "COMPRESSION_MIN_SIZE";
/// Environment variable for the base gzip level
pub const ENV_LEVEL: &str = "COMPRESSION_LEVEL";
/// Environment variable for the retry count
pub const ENV_MAX_RETRIES: &str = "COMPRESSION_MAX_RETRIES";
/// Environment variable for the retry delay (milliseconds)
pub const ENV_RETRY_DELAY_MS: &str = "COMPRESSION_RETRY_DELAY_MS";
/// Environment variable for the update interval (seconds)
pub const ENV_UPDATE_INTERVAL_SECS: &str = "COMPRESSION_UPDATE_INTERVAL_SECS";
/// Environment variable for the target latency (milliseconds)
pub const ENV_TARGET_LATENCY_MS: &str = "COMPRESSION_TARGET_LATENCY_MS";
/// Environment variable toggling adaptive mode
pub const ENV_ADAPTIVE: &str = "COMPRESSION_ADAPTIVE";

/// Lowest gzip level
pub const MIN_GZIP_LEVEL: u32 = 1;
/// Highest gzip level
pub const MAX_GZIP_LEVEL: u32 = 9;

/// Adaptive compression configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Minimum response size to compress (in bytes)
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Base gzip level (1-9)
    #[serde(default = "default_level")]
    pub level: u32,

    /// Retry count. Reserved, the adjustment loop does not use it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries. Reserved.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Feed observations back into per-path levels
    #[serde(default = "default_adaptive")]
    pub adaptive: bool,

    /// How often aggregate statistics are expected to be reported
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Below this ratio the level is lowered
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,

    /// Desired ratio
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,

    /// Above this ratio the level is raised
    #[serde(default = "default_max_ratio")]
    pub max_ratio: f64,

    /// Latency considered unacceptable
    #[serde(default = "default_max_latency", with = "humantime_serde")]
    pub max_latency: Duration,

    /// Above this average latency the level is lowered
    #[serde(default = "default_target_latency", with = "humantime_serde")]
    pub target_latency: Duration,

    /// Lowest level the adjuster may pick
    #[serde(default = "default_min_level")]
    pub min_level: u32,

    /// Highest level the adjuster may pick
    #[serde(default = "default_max_level")]
    pub max_level: u32,

    /// Observations needed on a path before it is adjusted
    #[serde(default = "default_sample_threshold")]
    pub sample_threshold: u64,

    /// Minimum time between two adjustment evaluations of one path
    #[serde(default = "default_adjustment_interval", with = "humantime_serde")]
    pub adjustment_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            level: default_level(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            adaptive: default_adaptive(),
            update_interval: default_update_interval(),
            min_ratio: default_min_ratio(),
            target_ratio: default_target_ratio(),
            max_ratio: default_max_ratio(),
            max_latency: default_max_latency(),
            target_latency: default_target_latency(),
            min_level: default_min_level(),
            max_level: default_max_level(),
            sample_threshold: default_sample_threshold(),
            adjustment_interval: default_adjustment_interval(),
        }
    }
}

fn default_min_size() -> usize {
    1024
}

fn default_level() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_adaptive() -> bool {
    true
}

fn default_update_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_min_ratio() -> f64 {
    0.3
}

fn default_target_ratio() -> f64 {
    0.5
}

fn default_max_ratio() -> f64 {
    0.9
}

fn default_max_latency() -> Duration {
    Duration::from_millis(50)
}

fn default_target_latency() -> Duration {
    Duration::from_millis(20)
}

fn default_min_level() -> u32 {
    MIN_GZIP_LEVEL
}

fn default_max_level() -> u32 {
    MAX_GZIP_LEVEL
}

fn default_sample_threshold() -> u64 {
    10
}

fn default_adjustment_interval() -> Duration {
    Duration::from_secs(60)
}

impl AdaptiveConfig {
    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_with(&lookup, ENV_MIN_SIZE, &mut config.min_size);
        override_with(&lookup, ENV_LEVEL, &mut config.level);
        override_with(&lookup, ENV_MAX_RETRIES, &mut config.max_retries);
        override_with(&lookup, ENV_ADAPTIVE, &mut config.adaptive);

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RETRY_DELAY_MS) {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_UPDATE_INTERVAL_SECS) {
            config.update_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_TARGET_LATENCY_MS) {
            config.target_latency = Duration::from_millis(ms);
        }

        config
    }

    /// Load from the environment and validate
    pub fn load() -> Result<Self> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Check every tunable, naming the first field that is out of range
    pub fn validate(&self) -> Result<()> {
        check_level("level", self.level)?;
        check_level("min_level", self.min_level)?;
        check_level("max_level", self.max_level)?;
        if self.min_level > self.max_level {
            return Err(Error::invalid_config(
                "max_level",
                format!(
                    "must be >= min_level ({}), got {}",
                    self.min_level, self.max_level
                ),
            ));
        }

        if self.retry_delay < Duration::from_millis(1) {
            return Err(Error::invalid_config(
                "retry_delay",
                format!("must be at least 1ms, got {:?}", self.retry_delay),
            ));
        }

        if self.update_interval < Duration::from_secs(1) {
            return Err(Error::invalid_config(
                "update_interval",
                format!("must be at least 1s, got {:?}", self.update_interval),
            ));
        }

        if !(0.0..=1.0).contains(&self.min_ratio) {
            return Err(Error::invalid_config(
                "min_ratio",
                format!("must be between 0 and 1, got {}", self.min_ratio),
            ));
        }

        if !(self.min_ratio..=1.0).contains(&self.max_ratio) {
            return Err(Error::invalid_config(
                "max_ratio",
                format!(
                    "must be between min_ratio ({}) and 1, got {}",
                    self.min_ratio, self.max_ratio
                ),
            ));
        }

        if !(self.min_ratio..=self.max_ratio).contains(&self.target_ratio) {
            return Err(Error::invalid_config(
                "target_ratio",
                format!(
                    "must be between min_ratio ({}) and max_ratio ({}), got {}",
                    self.min_ratio, self.max_ratio, self.target_ratio
                ),
            ));
        }

        if self.sample_threshold == 0 {
            return Err(Error::invalid_config("sample_threshold", "must be > 0"));
        }

        if self.target_latency > self.max_latency {
            tracing::warn!(
                target_latency_ms = self.target_latency.as_millis(),
                max_latency_ms = self.max_latency.as_millis(),
                "target_latency is above max_latency"
            );
        }

        Ok(())
    }

    /// Check if a body of this size is worth compressing
    pub fn should_compress(&self, size: usize) -> bool {
        size >= self.min_size
    }
}

fn check_level(field: &'static str, level: u32) -> Result<()> {
    if !(MIN_GZIP_LEVEL..=MAX_GZIP_LEVEL).contains(&level) {
        return Err(Error::invalid_config(
            field,
            format!(
                "must be between {} and {}, got {}",
                MIN_GZIP_LEVEL, MAX_GZIP_LEVEL, level
            ),
        ));
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::debug!(var = key, value = %raw, "Ignoring unparseable override");
            None
        }
    }
}

fn override_with<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_var(lookup, key) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AdaptiveConfig::default();
        assert_eq!(config.min_size, 1024);
        assert_eq!(config.level, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert_eq!(config.update_interval, Duration::from_secs(3600));
        assert_eq!(config.min_ratio, 0.3);
        assert_eq!(config.target_ratio, 0.5);
        assert_eq!(config.max_ratio, 0.9);
        assert_eq!(config.max_latency, Duration::from_millis(50));
        assert_eq!(config.target_latency, Duration::from_millis(20));
        assert_eq!((config.min_level, config.max_level), (1, 9));
        assert_eq!(config.sample_threshold, 10);
        assert_eq!(config.adjustment_interval, Duration::from_secs(60));
        assert!(config.adaptive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = AdaptiveConfig::from_lookup(lookup_from(&[
            (ENV_MIN_SIZE, "2048"),
            (ENV_LEVEL, "7"),
            (ENV_MAX_RETRIES, "5"),
            (ENV_RETRY_DELAY_MS, "250"),
            (ENV_UPDATE_INTERVAL_SECS, "30"),
            (ENV_TARGET_LATENCY_MS, "15"),
            (ENV_ADAPTIVE, "false"),
        ]));

        assert_eq!(config.min_size, 2048);
        assert_eq!(config.level, 7);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.update_interval, Duration::from_secs(30));
        assert_eq!(config.target_latency, Duration::from_millis(15));
        assert!(!config.adaptive);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let config = AdaptiveConfig::from_lookup(lookup_from(&[
            (ENV_MIN_SIZE, "lots"),
            (ENV_LEVEL, "-3"),
            (ENV_RETRY_DELAY_MS, ""),
        ]));
        assert_eq!(config, AdaptiveConfig::default());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases: Vec<(&str, Box<dyn Fn(&mut AdaptiveConfig)>)> = vec![
            ("level", Box::new(|c: &mut AdaptiveConfig| c.level = 0)),
            ("level", Box::new(|c: &mut AdaptiveConfig| c.level = 10)),
            ("min_ratio", Box::new(|c: &mut AdaptiveConfig| c.min_ratio = -0.1)),
            ("max_ratio", Box::new(|c: &mut AdaptiveConfig| c.max_ratio = 0.2)),
            ("retry_delay", Box::new(|c: &mut AdaptiveConfig| c.retry_delay = Duration::ZERO)),
            (
                "update_interval",
                Box::new(|c: &mut AdaptiveConfig| c.update_interval = Duration::from_millis(500)),
            ),
            ("target_ratio", Box::new(|c: &mut AdaptiveConfig| c.target_ratio = 0.95)),
            ("max_level", Box::new(|c: &mut AdaptiveConfig| {
                c.min_level = 6;
                c.max_level = 4;
            })),
            ("sample_threshold", Box::new(|c: &mut AdaptiveConfig| c.sample_threshold = 0)),
        ];

        for (field, mutate) in cases {
            let mut config = AdaptiveConfig::default();
            mutate(&mut config);
            match config.validate() {
                Err(Error::InvalidConfig { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected {field} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_should_compress() {
        let config = AdaptiveConfig::default();
        assert!(!config.should_compress(512));
        assert!(config.should_compress(2048));
    }

    #[test]
    fn test_serde_durations() {
        let json = serde_json::to_value(AdaptiveConfig::default()).unwrap();
        assert_eq!(json["retry_delay"], "100ms");
        assert_eq!(json["adjustment_interval"], "1m");

        let parsed: AdaptiveConfig = serde_json::from_str(r#"{"level": 3}"#).unwrap();
        assert_eq!(parsed.level, 3);
        assert_eq!(parsed.min_size, 1024);
    }
}
