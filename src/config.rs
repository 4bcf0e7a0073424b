// src/config.rs

//! Configuration for the kmsdot display session.
//!
//! Settings are grouped into small serde-deserializable structs with
//! sensible defaults, so a partial JSON file can override individual
//! values. The defaults reproduce the classic demo: first DRM card,
//! a 30 second session, a 300-dot field inside a 250x200 inset.

use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable naming an optional JSON config file.
const CONFIG_ENV: &str = "KMSDOT_CONFIG";

/// Process-wide configuration, loaded once on first access.
pub static CONFIG: Lazy<Config> = Lazy::new(Config::load);

/// Root configuration for the session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)] // Apply default values for the entire struct if a field is missing.
pub struct Config {
    /// DRM device selection.
    pub device: DeviceConfig,
    /// Session lifetime settings.
    pub session: SessionConfig,
    /// Content generator settings.
    pub pattern: PatternConfig,
}

impl Config {
    /// Loads the configuration, honoring a JSON override file named by
    /// `KMSDOT_CONFIG`. A missing or malformed file falls back to the
    /// defaults with a diagnostic rather than aborting startup.
    pub fn load() -> Self {
        let Some(path) = std::env::var_os(CONFIG_ENV) else {
            return Config::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        "Ignoring malformed config file {}: {}",
                        PathBuf::from(&path).display(),
                        e
                    );
                    Config::default()
                }
            },
            Err(e) => {
                warn!(
                    "Cannot read config file {}: {}",
                    PathBuf::from(&path).display(),
                    e
                );
                Config::default()
            }
        }
    }
}

/// DRM device selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device node to open when no path is given on the command line.
    pub path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            path: PathBuf::from("/dev/dri/card0"),
        }
    }
}

/// Session lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wall-clock deadline for the render loop, in seconds. The session
    /// ends when this elapses even without user input.
    pub duration_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig { duration_secs: 30 }
    }
}

/// Content generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Number of dots in the drifting field.
    pub dot_count: usize,
    /// Horizontal border width in pixels; the dot field lives inside it.
    pub inset_x: u32,
    /// Vertical border height in pixels.
    pub inset_y: u32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        PatternConfig {
            dot_count: 300,
            inset_x: 250,
            inset_y: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_provide_the_classic_defaults() {
        let config = Config::default();
        assert_eq!(config.device.path, PathBuf::from("/dev/dri/card0"));
        assert_eq!(config.session.duration_secs, 30);
        assert_eq!(config.pattern.dot_count, 300);
        assert_eq!(config.pattern.inset_x, 250);
        assert_eq!(config.pattern.inset_y, 200);
    }

    #[test]
    fn it_should_merge_a_partial_json_override_over_defaults() {
        let json = r#"{ "session": { "duration_secs": 5 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.session.duration_secs, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.pattern.dot_count, 300);
        assert_eq!(config.device.path, PathBuf::from("/dev/dri/card0"));
    }
}
