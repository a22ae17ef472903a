//! Application configuration management.
//!
//! Settings live in a JSON file under the platform configuration directory
//! (`<config dir>/tubeharvest/config.json`). Every field has a default, so a
//! partial or older file still loads.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::ApiConfig;
use crate::cache::{CacheConfig, default_cache_directory};
use crate::error::{Error, Result};
use crate::fs::{read_error, write_json_atomic};
use crate::history::HISTORY_FILE_NAME;
use crate::orchestrator::QueueConfig;
use crate::retry::RetryConfig;
use crate::thumbnail::ThumbnailConfig;
use crate::tools::ToolsConfig;
use crate::video::{DownloadMode, SortOrder};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Directory downloads are saved to.
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    /// Mode used when none is given.
    #[serde(default)]
    pub default_mode: DownloadMode,
    /// Listing order used when none is given.
    #[serde(default)]
    pub default_sort: SortOrder,
    /// Download pool configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Metadata cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Retry settings for paged metadata requests.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Metadata API connection settings.
    #[serde(default)]
    pub api: ApiConfig,
    /// External tool discovery.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Thumbnail fetching.
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    /// Download history file. Defaults to the data directory.
    #[serde(default)]
    pub history_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            default_mode: DownloadMode::default(),
            default_sort: SortOrder::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            api: ApiConfig::default(),
            tools: ToolsConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            history_path: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, or create default if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        if !config_path.exists() {
            debug!("Config file not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save_to(&config_path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| read_error(path, e))?;

        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.queue.validate();

        info!("Loaded config from {}", path.display());
        debug!(
            "Download directory: {}",
            config.download_directory.display()
        );
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// History file in use.
    #[must_use]
    pub fn history_file(&self) -> PathBuf {
        self.history_path.clone().unwrap_or_else(default_history_path)
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Get the default download directory.
#[must_use]
pub fn default_download_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tubeharvest")
}

/// Get the default history file path.
#[must_use]
pub fn default_history_path() -> PathBuf {
    dirs::data_local_dir()
        .map_or_else(default_cache_directory, |dir| dir.join("tubeharvest"))
        .join(HISTORY_FILE_NAME)
}

/// Get the path to the config file.
fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("tubeharvest")
        .join("config.json")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.default_mode, DownloadMode::VideoAudio);
        assert_eq!(config.queue.max_concurrent_downloads, 4);
        assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.api.api_key_env, "YOUTUBE_API_KEY");
        assert_eq!(config.thumbnails.timeout_secs, 5);
        assert!(config.download_directory.ends_with("tubeharvest"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = AppConfig {
            default_mode: DownloadMode::AudioOnly,
            download_directory: dir.path().join("media"),
            history_path: Some(dir.path().join("history.json")),
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.history_file(), dir.path().join("history.json"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"default_mode": "audio", "queue": {"max_concurrent_downloads": 64}}"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_mode, DownloadMode::AudioOnly);
        assert_eq!(config.queue.max_concurrent_downloads, 8);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.download_directory, default_download_directory());
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_config_file_path_uses_correct_name() {
        let path = AppConfig::config_file_path();
        assert!(path.ends_with("tubeharvest/config.json"));
    }

    #[test]
    fn test_default_history_path_name() {
        assert!(default_history_path().ends_with(HISTORY_FILE_NAME));
    }
}
