//! Runtime configuration for feed-prefetch.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every policy knob (TTLs, retry budgets, velocity thresholds, prefetch caps)
//! lives here so platforms can tune them without code changes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::fetch::retry::RetryPolicy;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "feed-prefetch", about = "Simulated feed browsing session over the prefetch cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Platform profile used for default retention times.
    #[arg(long, value_enum, default_value_t = Profile::Tv)]
    pub profile: Profile,

    /// Number of items in the simulated catalog.
    #[arg(long, default_value_t = 200)]
    pub items: u32,

    /// Make every Nth simulated request fail with a transient error (0 = never).
    #[arg(long, default_value_t = 0)]
    pub failure_every: u32,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Device class the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Living-room devices: plenty of RAM, long browsing sessions.
    Tv,
    /// Phones and tablets: tighter memory, shorter sessions.
    Mobile,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TTL store settings.
    pub cache: CacheConfig,

    /// Retry budgets.
    pub retry: RetryConfig,

    /// Pagination and prefetch settings.
    pub prefetch: PrefetchConfig,

    /// Scroll velocity classification.
    pub velocity: VelocityConfig,

    /// Constrained-mode settings.
    pub mode: ModeConfig,
}

/// TTL store and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds between expired-entry sweeps.
    pub sweep_interval_secs: u64,

    /// TTL for feed entries in normal mode.
    pub normal_ttl_secs: u64,

    /// TTL for feed entries created while constrained.
    pub constrained_ttl_secs: u64,

    /// How long a feed survives after its last subscriber detaches.
    pub retention_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            normal_ttl_secs: 600,
            constrained_ttl_secs: 120,
            retention_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn normal_ttl(&self) -> Duration {
        Duration::from_secs(self.normal_ttl_secs)
    }

    pub fn constrained_ttl(&self) -> Duration {
        Duration::from_secs(self.constrained_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// One retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Retries allowed after the first failure.
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Retry budgets for the two classes of fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First-page loads, where a failure shows an error banner.
    pub single_shot: RetryPolicyConfig,

    /// Infinite-scroll appends and background prefetches.
    pub infinite: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            single_shot: RetryPolicyConfig {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
            },
            infinite: RetryPolicyConfig {
                max_attempts: 6,
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
            },
        }
    }
}

/// Pagination and prefetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Items requested per page.
    pub page_size: u32,

    /// Maximum concurrent page fetches in a bulk prefetch.
    pub concurrency_cap: usize,

    /// Minimum interval between scroll-triggered prefetches, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            concurrency_cap: 2,
            debounce_ms: 150,
        }
    }
}

impl PrefetchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Pages to prefetch for each aggressiveness level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchDistances {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub ultra: u32,
}

impl Default for PrefetchDistances {
    fn default() -> Self {
        Self {
            low: 1,
            medium: 2,
            high: 3,
            ultra: 5,
        }
    }
}

/// Scroll velocity classification thresholds.
///
/// Velocities are expressed in scroll units per frame of `frame_ms`
/// milliseconds; set `frame_ms` to 1 for plain units/ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    /// Rolling window capacity.
    pub window: usize,

    /// Frame length used to normalise velocities.
    pub frame_ms: u64,

    /// Position deltas below this are treated as no movement.
    pub idle_delta: f64,

    /// Upper bound (inclusive) of the Low level.
    pub low_max: f64,

    /// Upper bound (inclusive) of the Medium level.
    pub medium_max: f64,

    /// Upper bound (inclusive) of the High level.
    pub high_max: f64,

    pub distances: PrefetchDistances,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            window: 5,
            frame_ms: 16,
            idle_delta: 1.0,
            low_max: 0.5,
            medium_max: 2.0,
            high_max: 5.0,
            distances: PrefetchDistances::default(),
        }
    }
}

/// Constrained-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Namespaces whose caches are dropped when entering constrained mode.
    pub background_namespaces: Vec<String>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            background_namespaces: ["movies", "shows", "genres", "recently-added", "watchlist"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Defaults tuned for a platform profile.
    pub fn for_profile(profile: Profile) -> Self {
        let mut config = Config::default();
        match profile {
            Profile::Tv => {
                config.cache.normal_ttl_secs = 600;
                config.cache.retention_secs = 1_800;
            }
            Profile::Mobile => {
                config.cache.normal_ttl_secs = 300;
                config.cache.retention_secs = 600;
            }
        }
        config
    }

    /// Load configuration from a JSON file laid over the profile defaults.
    /// Fields absent from the file keep the profile's values; a missing file
    /// yields the profile defaults unchanged.
    pub fn load(path: &std::path::Path, profile: Profile) -> anyhow::Result<Self> {
        let defaults = Config::for_profile(profile);
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using {:?} defaults", path, profile);
            return Ok(defaults);
        }

        let data = std::fs::read_to_string(path)?;
        let overrides: serde_json::Value = serde_json::from_str(&data)?;
        let mut merged = serde_json::to_value(defaults)?;
        merge_json(&mut merged, overrides);
        Ok(serde_json::from_value(merged)?)
    }
}

/// Overlay `overrides` onto `base`, descending into objects present in both.
fn merge_json(base: &mut serde_json::Value, overrides: serde_json::Value) {
    use serde_json::Value;

    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (field, value) in overrides {
                match base.get_mut(&field) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(field, value);
                    }
                }
            }
        }
        (base, value) => *base = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.prefetch.page_size, 20);
        assert_eq!(cfg.prefetch.concurrency_cap, 2);
        assert_eq!(cfg.retry.single_shot.max_attempts, 3);
        assert_eq!(cfg.retry.infinite.max_attempts, 6);
        assert_eq!(cfg.cache.constrained_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_profiles_differ_in_retention() {
        let tv = Config::for_profile(Profile::Tv);
        let mobile = Config::for_profile(Profile::Mobile);
        assert!(tv.cache.retention() > mobile.cache.retention());
        assert!(tv.cache.normal_ttl() > mobile.cache.normal_ttl());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "prefetch": { "page_size": 50 } }"#).unwrap();

        let cfg = Config::load(&path, Profile::Tv).unwrap();
        assert_eq!(cfg.prefetch.page_size, 50);
        assert_eq!(cfg.prefetch.concurrency_cap, 2);
        assert_eq!(cfg.velocity.window, 5);
    }

    #[test]
    fn test_partial_file_keeps_profile_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "prefetch": { "page_size": 50 }, "cache": { "constrained_ttl_secs": 90 } }"#,
        )
        .unwrap();

        let cfg = Config::load(&path, Profile::Mobile).unwrap();
        assert_eq!(cfg.prefetch.page_size, 50);
        assert_eq!(cfg.cache.normal_ttl_secs, 300);
        assert_eq!(cfg.cache.retention_secs, 600);
        assert_eq!(cfg.cache.constrained_ttl_secs, 90);

        let tv = Config::load(&path, Profile::Tv).unwrap();
        assert_eq!(tv.cache.normal_ttl_secs, 600);
        assert_eq!(tv.cache.retention_secs, 1_800);
    }

    #[test]
    fn test_file_overrides_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "cache": { "retention_secs": 42 } }"#).unwrap();

        let cfg = Config::load(&path, Profile::Tv).unwrap();
        assert_eq!(cfg.cache.retention_secs, 42);
        assert_eq!(cfg.cache.normal_ttl_secs, 600);
    }

    #[test]
    fn test_load_missing_file_uses_profile() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json"), Profile::Mobile).unwrap();
        assert_eq!(cfg.cache.retention_secs, 600);
    }
}
