//! Typed configuration for [`crate::CacheFacade`].
//!
//! This module defines the configuration *type* only; reading it from a file
//! or environment is left to the embedding application (see spec §6.3).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Storage placement policy for the disk tier (spec §4.2 "Placement policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Always store inline in the manifest row.
    Inline,
    /// Always store as a sidecar file.
    File,
    /// Inline iff `size <= inline_threshold_bytes`.
    Mixed,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Mixed
    }
}

/// Configuration for the in-memory LRU tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of resident entries.
    pub count_limit: usize,
    /// Maximum total accounting cost across resident entries.
    pub cost_limit: u64,
    /// Entries idle longer than this are evicted by the age pass. `None` means unbounded.
    #[serde(with = "humanish_duration_opt")]
    pub age_limit: Option<Duration>,
    /// Interval between background trim passes. Zero disables the background trimmer.
    #[serde(with = "humanish_duration")]
    pub auto_trim_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            count_limit: 1000,
            cost_limit: 50 * 1024 * 1024,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for the on-disk manifest tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Whether the disk tier is active at all.
    pub enabled: bool,
    /// Maximum total bytes (inline + sidecar) across resident records.
    pub byte_limit: u64,
    /// Maximum number of resident records.
    pub count_limit: u64,
    /// Records idle longer than this are evicted by the age pass. `None` means unbounded.
    #[serde(with = "humanish_duration_opt")]
    pub age_limit: Option<Duration>,
    /// Interval between background trim passes. Zero disables the background trimmer.
    #[serde(with = "humanish_duration")]
    pub auto_trim_interval: Duration,
    /// Values at or under this size are stored inline when `storage_mode` is `Mixed`.
    pub inline_threshold_bytes: u64,
    /// Placement policy for new writes.
    pub storage_mode: StorageMode,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            byte_limit: 1024 * 1024 * 1024,
            count_limit: 100_000,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(30),
            inline_threshold_bytes: 20 * 1024,
            storage_mode: StorageMode::Mixed,
        }
    }
}

/// Top-level configuration for a [`crate::CacheFacade`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Name of this cache instance; also the on-disk directory name under `directory`.
    pub name: String,
    /// Overrides the default data root (platform cache directory) when set.
    pub directory: Option<std::path::PathBuf>,
    /// Memory tier configuration.
    pub memory: MemoryConfig,
    /// Disk tier configuration.
    pub disk: DiskConfig,
    /// Whether tier and facade operations emit `tracing` events.
    pub logging_enabled: bool,
    /// Whether the facade records [`crate::metrics::Metrics`].
    pub metrics_enabled: bool,
}

impl CacheConfig {
    /// A configuration with the given name and otherwise all defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: None,
            memory: MemoryConfig::default(),
            disk: DiskConfig::default(),
            logging_enabled: true,
            metrics_enabled: true,
        }
    }
}

mod humanish_duration {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

mod humanish_duration_opt {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
    }
}
