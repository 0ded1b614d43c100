//! Host configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use beacon_core::{ChannelConfig, StationConfig, SubscriberConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of event-loop threads registered as execution contexts.
    #[serde(default = "default_loops")]
    pub loops: usize,

    /// Producer tick interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Stop after this many milliseconds (`0` = run until signalled).
    #[serde(default)]
    pub run_for_ms: u64,

    /// Station seed.
    #[serde(default)]
    pub station: StationConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_loops() -> usize {
    std::env::var("BEACON_LOOPS")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(2)
}

fn default_tick_ms() -> u64 {
    std::env::var("BEACON_TICK_MS")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(1_000)
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loops: default_loops(),
            tick_ms: default_tick_ms(),
            run_for_ms: 0,
            station: StationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Station seed, with a `status` channel when none is configured.
    #[must_use]
    pub fn station_seed(&self) -> StationConfig {
        let mut seed = self.station.clone();
        if seed.channels.is_empty() {
            seed.channels.push(ChannelConfig {
                name: "status".to_string(),
                default_queue_capacity: Some(16),
                subscribers: vec![SubscriberConfig::default()],
            });
        }
        seed
    }

    /// Producer tick interval.
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Run duration, if bounded.
    #[must_use]
    pub fn run_for(&self) -> Option<Duration> {
        (self.run_for_ms > 0).then(|| Duration::from_millis(self.run_for_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.loops >= 1);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
        assert!(config.run_for().is_none());
    }

    #[test]
    fn test_default_seed_has_status_channel() {
        let seed = Config::default().station_seed();
        assert_eq!(seed.channels.len(), 1);
        assert_eq!(seed.channels[0].name, "status");
        assert_eq!(seed.channels[0].subscribers.len(), 1);
        assert!(seed.channels[0].subscribers[0].queue);
        assert!(seed.channels[0].subscribers[0].signal);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            loops = 4
            tick_ms = 250
            run_for_ms = 2000

            [station]
            name = "prices"

            [[station.channels]]
            name = "ticker"

            [metrics]
            enabled = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.loops, 4);
        assert_eq!(config.tick(), Duration::from_millis(250));
        assert_eq!(config.run_for(), Some(Duration::from_secs(2)));
        assert_eq!(config.station.name, "prices");
        assert!(!config.metrics.enabled);

        // Configured channels are kept as-is
        assert_eq!(config.station_seed().channels[0].name, "ticker");
    }
}
