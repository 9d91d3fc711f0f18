//! Engine tunables and read-only application settings

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Transfer engine configuration. Every field has a default so a partial
/// JSON document is enough to override a single value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Objects larger than this go through multipart upload
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Provider minimum for every part except the last
    pub min_part_size: u64,
    pub max_parts: u32,
    /// Parallel part uploads per file
    pub part_concurrency: usize,
    /// Global cap on simultaneously active part/object uploads
    pub max_active_uploads: usize,
    pub max_retries: usize,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub speed_window_ms: u64,
    pub presign_ttl_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 8 * MIB,
            part_size: 5 * MIB,
            min_part_size: 5 * MIB,
            max_parts: 10_000,
            part_concurrency: 4,
            max_active_uploads: 8,
            max_retries: 3,
            retry_min_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            speed_window_ms: 3_000,
            presign_ttl_secs: 3_600,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            default_page_size: 50,
            max_page_size: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidSetting(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidSetting(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.part_concurrency == 0 || self.max_active_uploads == 0 {
            return Err(ConfigError::InvalidSetting(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.min_part_size == 0 || self.part_size == 0 {
            return Err(ConfigError::InvalidSetting(
                "part sizes must be at least 1 byte".to_string(),
            ));
        }
        if self.part_size < self.min_part_size {
            return Err(ConfigError::InvalidSetting(format!(
                "part_size {} is below the provider minimum {}",
                self.part_size, self.min_part_size
            )));
        }
        if self.multipart_threshold < self.part_size {
            return Err(ConfigError::InvalidSetting(format!(
                "multipart_threshold {} is smaller than part_size {}",
                self.multipart_threshold, self.part_size
            )));
        }
        if self.max_parts == 0 || self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_parts and page sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }
}

/// Application settings owned by the configuration UI. The engine only reads them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub default_bucket_id: Option<i64>,
    pub last_active_bucket_id: Option<i64>,
    pub use_system_proxy: bool,
    pub locale: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_bucket_id: None,
            last_active_bucket_id: None,
            use_system_proxy: true,
            locale: "en".to_string(),
        }
    }
}
