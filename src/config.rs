//! Engine configuration.
//!
//! Defaults bucket by Los Angeles local time and split impressions by day.
//! A JSON file may override any subset of fields and the CLI overrides the
//! file.

use crate::error::{EngineError, Result};
use crate::event::EventType;
use chrono_tz::Tz;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Zstd,
    Snappy,
    Uncompressed,
}

impl CompressionKind {
    fn to_parquet(self) -> Compression {
        match self {
            CompressionKind::Zstd => Compression::ZSTD(ZstdLevel::default()),
            CompressionKind::Snappy => Compression::SNAPPY,
            CompressionKind::Uncompressed => Compression::UNCOMPRESSED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IANA timezone used to derive day/week/hour/minute buckets.
    pub timezone: String,
    /// Event types whose partitions are further split by local day.
    pub day_partitioned_types: Vec<EventType>,
    pub compression: CompressionKind,
    pub max_row_group_size: usize,
    /// Rows per record batch, for both CSV decoding and parquet reads.
    pub batch_size: usize,
    /// Prepare worker pool size; 0 uses the available parallelism.
    pub workers: usize,
    /// How many malformed-record messages the ingest report keeps.
    pub malformed_sample_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Los_Angeles".to_string(),
            day_partitioned_types: vec![EventType::Impression],
            compression: CompressionKind::Zstd,
            max_row_group_size: 1024 * 1024,
            batch_size: 8192,
            workers: 0,
            malformed_sample_limit: 20,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be positive".into()));
        }
        if self.max_row_group_size == 0 {
            return Err(EngineError::Config(
                "max_row_group_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| EngineError::Config(format!("timezone '{}': {}", self.timezone, e)))
    }

    pub fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map_or(4, |n| n.get())
        }
    }

    pub fn is_day_partitioned(&self, event_type: EventType) -> bool {
        self.day_partitioned_types.contains(&event_type)
    }

    pub fn writer_properties(&self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression.to_parquet())
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_dictionary_enabled(true)
            .set_max_row_group_size(self.max_row_group_size)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"timezone": "UTC", "compression": "snappy"}"#).unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.compression, CompressionKind::Snappy);
        assert_eq!(config.day_partitioned_types, vec![EventType::Impression]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let config = EngineConfig {
            timezone: "Mars/Olympus_Mons".into(),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
