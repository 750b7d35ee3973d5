//! Configuration types for Berth
//!
//! This module defines configuration structures used across components.
//! Every section implements `Default`, so a partial TOML file only needs to
//! name the values it overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for Berth
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata database configuration
    pub metadata: MetadataConfig,
    /// Garbage collection scheduler configuration
    pub gc: GcConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Metadata database configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Path of the metadata database file
    pub path: PathBuf,
    /// Skip fsync on commit (faster, loses the last commits on crash)
    pub no_sync: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/berth/meta.redb"),
            no_sync: false,
        }
    }
}

/// Garbage collection scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Maximum fraction of wall time spent collecting (0.02 = 2%)
    pub pause_threshold: f64,
    /// Number of deletions that trigger a collection (0 disables)
    pub deletion_threshold: u32,
    /// Number of mutations that trigger a collection (0 disables)
    pub mutation_threshold: u32,
    /// Delay between a trigger and the collection (milliseconds)
    pub schedule_delay_ms: u64,
    /// Delay before the first collection after startup (milliseconds)
    pub startup_delay_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause_threshold: 0.02,
            deletion_threshold: 0,
            mutation_threshold: 100,
            schedule_delay_ms: 0,
            startup_delay_ms: 100,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level (overridden by `RUST_LOG`)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gc.mutation_threshold, 100);
        assert_eq!(config.gc.deletion_threshold, 0);
        assert!((config.gc.pause_threshold - 0.02).abs() < f64::EPSILON);
        assert_eq!(config.logging.level, "info");
        assert!(!config.metadata.no_sync);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(
                r#"
                [metadata]
                path = "/tmp/meta.redb"

                [gc]
                deletion_threshold = 5
                "#,
                ::config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.metadata.path, PathBuf::from("/tmp/meta.redb"));
        assert_eq!(config.gc.deletion_threshold, 5);
        assert_eq!(config.gc.mutation_threshold, 100);
        assert_eq!(config.logging.level, "info");
    }
}
