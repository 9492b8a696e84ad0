//! Defines all configuration structures for the Wakeclock engine.
//!
//! These structs are designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`, with `WAKECLOCK__*` environment variables
//! layered on top. Durations that are product decisions rather than correctness
//! constraints (snooze length, pre-alarm lead time, auto-silence) live here so
//! they can be injected instead of hard-coded.

use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The top-level configuration for the `AlarmRegistry`.
#[derive(Debug, Clone, Deserialize)]
pub struct WakeclockConfig {
    /// The timezone alarm times of day are interpreted in.
    /// Uses the string names from the IANA Time Zone Database
    /// (e.g., "Europe/Berlin").
    #[serde(default = "default_timezone")]
    pub timezone: Tz,

    /// Length of a default snooze, in minutes.
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: u32,

    /// How long before the main wake a pre-alarm fires, in minutes.
    #[serde(default = "default_prealarm_minutes")]
    pub prealarm_minutes: u32,

    /// How long a firing alarm rings before it silences itself, in minutes.
    /// Zero disables auto-silence.
    #[serde(default = "default_auto_silence_minutes")]
    pub auto_silence_minutes: u32,

    /// Wakes due within this margin of the timer firing are dispatched together.
    #[serde(default = "default_fire_tolerance_ms")]
    pub fire_tolerance_ms: u64,

    /// Retry policy for the startup load of persisted alarms.
    #[serde(default = "RetryConfig::load_default")]
    pub load_retry: RetryConfig,

    /// Retry policy for fire-and-forget persistence writes.
    #[serde(default = "RetryConfig::write_default")]
    pub write_retry: RetryConfig,

    /// Retry policy for arming or cancelling the OS wake timer.
    #[serde(default = "RetryConfig::timer_default")]
    pub timer_retry: RetryConfig,

    /// Capacity of each broadcast event stream.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Location of the JSON alarm store used by the binaries.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// A bounded retry policy: `attempts` tries spaced `interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Persisted alarms may be momentarily unreadable at boot; keep trying for a minute.
    fn load_default() -> Self {
        Self {
            attempts: 120,
            interval_ms: 500,
        }
    }

    fn write_default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 100,
        }
    }

    fn timer_default() -> Self {
        Self {
            attempts: 3,
            interval_ms: 50,
        }
    }
}

impl WakeclockConfig {
    /// Loads the configuration from an optional TOML file and the environment.
    ///
    /// Missing keys fall back to their defaults, so an absent file yields
    /// `WakeclockConfig::default()` plus any environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("WAKECLOCK").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn snooze_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.snooze_minutes))
    }

    pub fn prealarm_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.prealarm_minutes))
    }

    /// `None` when auto-silence is switched off.
    pub fn auto_silence(&self) -> Option<Duration> {
        (self.auto_silence_minutes > 0)
            .then(|| Duration::from_secs(u64::from(self.auto_silence_minutes) * 60))
    }

    pub fn fire_tolerance(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.fire_tolerance_ms).unwrap_or(i64::MAX))
    }
}

// --- Default value functions for serde ---

fn default_timezone() -> Tz {
    Tz::UTC
}

fn default_snooze_minutes() -> u32 {
    10
}

fn default_prealarm_minutes() -> u32 {
    30
}

fn default_auto_silence_minutes() -> u32 {
    10
}

fn default_fire_tolerance_ms() -> u64 {
    1_000
}

fn default_channel_capacity() -> usize {
    64
}

fn default_store_path() -> PathBuf {
    PathBuf::from("wakeclock.json")
}

impl Default for WakeclockConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            snooze_minutes: default_snooze_minutes(),
            prealarm_minutes: default_prealarm_minutes(),
            auto_silence_minutes: default_auto_silence_minutes(),
            fire_tolerance_ms: default_fire_tolerance_ms(),
            load_retry: RetryConfig::load_default(),
            write_retry: RetryConfig::write_default(),
            timer_retry: RetryConfig::timer_default(),
            channel_capacity: default_channel_capacity(),
            store_path: default_store_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_product_values() {
        let config = WakeclockConfig::default();
        assert_eq!(config.snooze_duration(), chrono::Duration::minutes(10));
        assert_eq!(config.prealarm_duration(), chrono::Duration::minutes(30));
        assert_eq!(config.auto_silence(), Some(Duration::from_secs(600)));
        assert_eq!(config.load_retry.attempts, 120);
        assert_eq!(config.load_retry.interval(), Duration::from_millis(500));
    }

    #[test]
    fn zero_auto_silence_disables_it() {
        let config = WakeclockConfig {
            auto_silence_minutes: 0,
            ..Default::default()
        };
        assert_eq!(config.auto_silence(), None);
    }

    #[test]
    fn loads_partial_toml_file() {
        let path = std::env::temp_dir().join(format!("wakeclock-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "timezone = \"Europe/Berlin\"").unwrap();
        writeln!(file, "snooze_minutes = 5").unwrap();
        writeln!(file, "[load_retry]").unwrap();
        writeln!(file, "attempts = 3").unwrap();
        writeln!(file, "interval_ms = 10").unwrap();
        drop(file);

        let config = WakeclockConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.snooze_minutes, 5);
        assert_eq!(config.prealarm_minutes, 30);
        assert_eq!(config.load_retry, RetryConfig { attempts: 3, interval_ms: 10 });
    }
}
