//! Store configuration and its file/environment loading.

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::hlog::LogLayout;
use crate::utility::is_power_of_two;

/// How a checkpoint persists the mutable region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CheckpointKind {
    /// Rely on the log's own flush: everything below the cut reaches the
    /// main log device before the checkpoint commits.
    #[default]
    FuzzyLog,
    /// Additionally copy the in-memory tail of the log into a side
    /// snapshot file for faster recovery reads.
    Snapshot,
    /// Persist only the index and metadata; log durability is whatever the
    /// flush pipeline has already achieved.
    IndexOnly,
}

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading a config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML syntax or schema error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// A value failed to parse.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Raw value.
        value: String,
    },
    /// An environment override names no known field.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// A field violates a structural constraint.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Hash index buckets (rounded up to a power of two).
    pub table_size: u64,
    /// log2 of the page size in bytes.
    pub page_size_bits: u32,
    /// log2 of the in-memory buffer size in bytes.
    pub memory_size_bits: u32,
    /// log2 of the device segment size in bytes.
    pub segment_size_bits: u32,
    /// Fraction of the in-memory buffer kept mutable.
    pub mutable_fraction: f64,
    /// Checkpoint flavour.
    pub checkpoint_kind: CheckpointKind,
    /// Copy values read from the device back to the tail.
    pub copy_reads_to_tail: bool,
    /// Reserve device space for the log up front.
    pub preallocate_log: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 16,
            page_size_bits: 22,
            memory_size_bits: 28,
            segment_size_bits: 30,
            mutable_fraction: 0.9,
            checkpoint_kind: CheckpointKind::FuzzyLog,
            copy_reads_to_tail: false,
            preallocate_log: false,
        }
    }
}

impl KvConfig {
    const ENV_PREFIX: &'static str = "STRATAKV__";

    /// Validate and normalise the configuration.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if !is_power_of_two(self.table_size) {
            self.table_size = self.table_size.next_power_of_two();
        }
        if self.page_size_bits > Address::OFFSET_BITS {
            return Err(ConfigError::Invalid(format!(
                "page_size_bits {} exceeds the address offset width {}",
                self.page_size_bits,
                Address::OFFSET_BITS
            )));
        }
        if self.memory_size_bits <= self.page_size_bits {
            return Err(ConfigError::Invalid(
                "memory_size_bits must exceed page_size_bits".into(),
            ));
        }
        if self.segment_size_bits < self.page_size_bits {
            return Err(ConfigError::Invalid(
                "segment_size_bits must be at least page_size_bits".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.mutable_fraction) {
            return Err(ConfigError::Invalid(format!(
                "mutable_fraction {} outside [0, 1]",
                self.mutable_fraction
            )));
        }
        Ok(self)
    }

    /// Load from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validated()
    }

    /// Load from the `STRATAKV_CONFIG` file (if set), then apply
    /// `STRATAKV__field` environment overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("STRATAKV_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validated()
    }

    /// Apply `STRATAKV__field` environment overrides in place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(field) = key.strip_prefix(Self::ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match field.to_ascii_lowercase().as_str() {
                "table_size" => self.table_size = parse(&key, value)?,
                "page_size_bits" => self.page_size_bits = parse(&key, value)?,
                "memory_size_bits" => self.memory_size_bits = parse(&key, value)?,
                "segment_size_bits" => self.segment_size_bits = parse(&key, value)?,
                "mutable_fraction" => self.mutable_fraction = parse(&key, value)?,
                "copy_reads_to_tail" => self.copy_reads_to_tail = parse(&key, value)?,
                "preallocate_log" => self.preallocate_log = parse(&key, value)?,
                "checkpoint_kind" => {
                    self.checkpoint_kind = match value {
                        "FuzzyLog" | "fuzzy" => CheckpointKind::FuzzyLog,
                        "Snapshot" | "snapshot" => CheckpointKind::Snapshot,
                        "IndexOnly" | "index_only" => CheckpointKind::IndexOnly,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                key,
                                value: value.into(),
                            })
                        }
                    }
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// The log geometry this configuration describes.
    pub fn log_layout(&self) -> LogLayout {
        LogLayout::from_bits(
            self.page_size_bits,
            self.memory_size_bits,
            self.mutable_fraction,
        )
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.page_size_bits
    }

    /// Segment size in bytes.
    pub fn segment_size(&self) -> u64 {
        1 << self.segment_size_bits
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        KvConfig::default().validated().unwrap();
    }

    #[test]
    fn table_size_rounds_up() {
        let config = KvConfig {
            table_size: 1000,
            ..KvConfig::default()
        };
        assert_eq!(config.validated().unwrap().table_size, 1024);
    }

    #[test]
    fn rejects_oversized_pages() {
        let config = KvConfig {
            page_size_bits: 30,
            ..KvConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(
            &path,
            r#"
table_size = 2048
page_size_bits = 14
memory_size_bits = 20
mutable_fraction = 0.5
checkpoint_kind = "Snapshot"
copy_reads_to_tail = true
"#,
        )
        .unwrap();

        let config = KvConfig::load_from_path(&path).unwrap();
        assert_eq!(config.table_size, 2048);
        assert_eq!(config.page_size_bits, 14);
        assert_eq!(config.checkpoint_kind, CheckpointKind::Snapshot);
        assert!(config.copy_reads_to_tail);
        // Unset fields keep their defaults.
        assert_eq!(config.segment_size_bits, 30);
    }

    #[test]
    fn layout_matches_bits() {
        let config = KvConfig {
            page_size_bits: 12,
            memory_size_bits: 15,
            mutable_fraction: 0.5,
            ..KvConfig::default()
        };
        let layout = config.log_layout();
        assert_eq!(layout.page_size, 4096);
        assert_eq!(layout.frame_count, 8);
        assert_eq!(layout.mutable_pages, 4);
    }
}
