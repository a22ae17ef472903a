//! On-disk metadata cache with time-based expiry.
//!
//! The cache is a single JSON document mapping a composite key to
//! `{ timestamp, data, etag }`:
//!
//! ```json
//! {
//!   "channel_videos:UC123": { "timestamp": 1718000000.0, "data": [...], "etag": "abc" }
//! }
//! ```
//!
//! An entry older than the configured TTL (24 hours by default) reads as a miss.
//! Writes go through an in-process mutex and replace the file atomically, and
//! every write drops expired entries and caps the document at
//! [`CacheConfig::max_entries`] so the file cannot grow without bound.
//!
//! # Example
//!
//! ```rust,ignore
//! use tubeharvest_core::cache::{CacheConfig, CacheKey, CacheStore};
//!
//! let cache = CacheStore::open(CacheConfig::default())?;
//! cache.put_as(&CacheKey::Video("abc".into()), &record, None)?;
//! if let Some((record, _etag)) = cache.get_as::<VideoRecord>(&CacheKey::Video("abc".into())) {
//!     println!("cached: {}", record.title);
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::fs::{load_json_or_default, unix_now_secs, write_json_atomic};

/// Default cache TTL in seconds (24 hours).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Default maximum number of entries kept in the cache document.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 2048;

/// Default cache file name.
const CACHE_FILE_NAME: &str = "cache.json";

/// Cache configuration options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether caching is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time-to-live for cache entries in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Maximum number of entries kept; the oldest are evicted first.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Custom cache file path (optional).
    /// If not set, uses the platform cache directory.
    #[serde(default)]
    pub custom_cache_path: Option<PathBuf>,
}

const fn default_true() -> bool {
    true
}

const fn default_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

const fn default_max_entries() -> usize {
    DEFAULT_MAX_CACHE_ENTRIES
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_entries: DEFAULT_MAX_CACHE_ENTRIES,
            custom_cache_path: None,
        }
    }
}

impl CacheConfig {
    /// Set the cache TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Set the maximum number of entries.
    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the cache file path.
    #[must_use]
    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.custom_cache_path = Some(path);
        self
    }

    /// Disable caching entirely.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// The file the cache document lives in.
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.custom_cache_path
            .clone()
            .unwrap_or_else(|| default_cache_directory().join(CACHE_FILE_NAME))
    }
}

/// Composite cache key: operation type plus argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Handle or custom path resolved to a channel id.
    Handle(String),
    /// Full upload listing of a channel.
    ChannelVideos(String),
    /// A single video's metadata.
    Video(String),
    /// View counts for one batch of video ids.
    Stats(Vec<String>),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "handle:{handle}"),
            Self::ChannelVideos(channel_id) => write!(f, "channel_videos:{channel_id}"),
            Self::Video(video_id) => write!(f, "video:{video_id}"),
            Self::Stats(ids) => write!(f, "stats:{}", ids.join(",")),
        }
    }
}

/// A single cache entry as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// When the entry was written (seconds since the Unix epoch).
    pub timestamp: f64,
    /// Cached payload.
    pub data: serde_json::Value,
    /// Entity tag reported by the API, if any.
    #[serde(default)]
    pub etag: Option<String>,
}

impl CacheEntry {
    /// Check if this entry has expired at `now` for the given TTL.
    #[must_use]
    pub fn is_expired_at(&self, now: f64, ttl_secs: u64) -> bool {
        now - self.timestamp >= ttl_secs as f64
    }
}

/// A fresh cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Cached payload.
    pub data: serde_json::Value,
    /// Entity tag stored with the payload.
    pub etag: Option<String>,
}

type CacheDocument = BTreeMap<String, CacheEntry>;

/// JSON-file backed cache shared by the metadata client.
pub struct CacheStore {
    config: CacheConfig,
    path: PathBuf,
    document: Mutex<CacheDocument>,
}

impl CacheStore {
    /// Open the cache at the location given by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing cache file cannot be read.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let path = config.cache_path();
        Self::open_at(path, config)
    }

    /// Open the cache stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing cache file cannot be read.
    pub fn open_at(path: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        let path = path.into();

        let document: CacheDocument = if config.enabled {
            load_json_or_default(&path)?
        } else {
            debug!("Cache is disabled");
            CacheDocument::new()
        };

        info!(
            "Cache initialized at {} with {} entries",
            path.display(),
            document.len()
        );

        Ok(Self {
            config,
            path,
            document: Mutex::new(document),
        })
    }

    /// An in-memory cache that never stores anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            config: CacheConfig::disabled(),
            document: Mutex::new(CacheDocument::new()),
        }
    }

    /// Path of the cache document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if caching is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of entries currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Read a fresh entry.
    ///
    /// Returns `None` if the key is absent, expired, or caching is disabled.
    pub fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }

        let key = key.to_string();
        let document = self.lock();
        let entry = document.get(&key)?;

        if entry.is_expired_at(unix_now_secs(), self.config.ttl_secs) {
            debug!("Cache entry expired: {}", key);
            return None;
        }

        debug!("Cache hit: {}", key);
        Some(CacheHit {
            data: entry.data.clone(),
            etag: entry.etag.clone(),
        })
    }

    /// Read a fresh entry and deserialize its payload.
    ///
    /// A payload that does not match `T` is logged and treated as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<(T, Option<String>)> {
        let hit = self.get(key)?;
        match serde_json::from_value(hit.data) {
            Ok(value) => Some((value, hit.etag)),
            Err(e) => {
                let err = CacheError::InvalidPayload {
                    key: key.to_string(),
                    reason: e.to_string(),
                };
                warn!("Discarding cached value: {}", err);
                None
            }
        }
    }

    /// Write an entry, overwriting whatever was stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache document cannot be persisted.
    pub fn put(
        &self,
        key: &CacheKey,
        data: serde_json::Value,
        etag: Option<String>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = unix_now_secs();
        let mut document = self.lock();
        document.insert(
            key.to_string(),
            CacheEntry {
                timestamp: now,
                data,
                etag,
            },
        );

        let expired = Self::drop_expired(&mut document, now, self.config.ttl_secs);
        let evicted = Self::enforce_capacity(&mut document, self.config.max_entries);
        if expired + evicted > 0 {
            debug!(
                "Cache cleanup on write: {} expired, {} evicted",
                expired, evicted
            );
        }

        write_json_atomic(&self.path, &*document)?;
        debug!("Cached {}", key);
        Ok(())
    }

    /// Serialize `value` and write it under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or persisting fails.
    pub fn put_as<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        etag: Option<String>,
    ) -> Result<()> {
        let data = serde_json::to_value(value)?;
        self.put(key, data, etag)
    }

    /// Remove every expired entry and persist the result.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache document cannot be persisted.
    pub fn purge_expired(&self) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }

        let mut document = self.lock();
        let removed = Self::drop_expired(&mut document, unix_now_secs(), self.config.ttl_secs);
        if removed > 0 {
            write_json_atomic(&self.path, &*document)?;
            info!("Purged {} expired cache entries", removed);
        }
        Ok(removed)
    }

    fn drop_expired(document: &mut CacheDocument, now: f64, ttl_secs: u64) -> usize {
        let before = document.len();
        document.retain(|_, entry| !entry.is_expired_at(now, ttl_secs));
        before - document.len()
    }

    fn enforce_capacity(document: &mut CacheDocument, max_entries: usize) -> usize {
        if document.len() <= max_entries {
            return 0;
        }

        let mut by_age: Vec<(String, f64)> = document
            .iter()
            .map(|(key, entry)| (key.clone(), entry.timestamp))
            .collect();
        by_age.sort_by(|a, b| a.1.total_cmp(&b.1));

        let excess = document.len() - max_entries;
        for (key, _) in by_age.into_iter().take(excess) {
            document.remove(&key);
        }
        excess
    }

    fn lock(&self) -> MutexGuard<'_, CacheDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Get the default cache directory.
#[must_use]
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("tubeharvest")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, config: CacheConfig) -> CacheStore {
        CacheStore::open_at(dir.path().join("cache.json"), config).unwrap()
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(CacheKey::Handle("veritasium".into()).to_string(), "handle:veritasium");
        assert_eq!(
            CacheKey::ChannelVideos("UC123".into()).to_string(),
            "channel_videos:UC123"
        );
        assert_eq!(CacheKey::Video("abc".into()).to_string(), "video:abc");
        assert_eq!(
            CacheKey::Stats(vec!["a".into(), "b".into()]).to_string(),
            "stats:a,b"
        );
    }

    #[test]
    fn test_round_trip_within_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = store_in(&dir, CacheConfig::default());
        let key = CacheKey::Video("abc".into());
        let payload = json!({"title": "Hello", "views": 42, "tags": ["x", "y"]});

        cache
            .put(&key, payload.clone(), Some("etag-1".to_string()))
            .unwrap();

        let hit = cache.get(&key).expect("fresh entry should hit");
        assert_eq!(hit.data, payload);
        assert_eq!(hit.etag.as_deref(), Some("etag-1"));
    }

    #[test]
    fn test_round_trip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::ChannelVideos("UC1".into());
        let payload = json!([{"video_id": "a"}, {"video_id": "b"}]);

        store_in(&dir, CacheConfig::default())
            .put(&key, payload.clone(), None)
            .unwrap();

        let reopened = store_in(&dir, CacheConfig::default());
        assert_eq!(reopened.get(&key).unwrap().data, payload);
    }

    #[test]
    fn test_zero_ttl_is_always_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = store_in(&dir, CacheConfig::default().with_ttl(0));
        let key = CacheKey::Video("abc".into());

        cache.put(&key, json!("payload"), None).unwrap();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_old_entry_on_disk_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let stale = unix_now_secs() - (DEFAULT_CACHE_TTL_SECS as f64) - 10.0;
        let fresh = unix_now_secs() - 60.0;
        std::fs::write(
            &path,
            json!({
                "video:old": {"timestamp": stale, "data": "old", "etag": null},
                "video:new": {"timestamp": fresh, "data": "new", "etag": null}
            })
            .to_string(),
        )
        .unwrap();

        let cache = CacheStore::open_at(&path, CacheConfig::default()).unwrap();
        assert!(cache.get(&CacheKey::Video("old".into())).is_none());
        assert_eq!(
            cache.get(&CacheKey::Video("new".into())).unwrap().data,
            json!("new")
        );
    }

    #[test]
    fn test_purge_expired_removes_stale_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let stale = unix_now_secs() - (DEFAULT_CACHE_TTL_SECS as f64) * 2.0;
        std::fs::write(
            &path,
            json!({
                "video:a": {"timestamp": stale, "data": 1},
                "video:b": {"timestamp": stale, "data": 2},
                "video:c": {"timestamp": unix_now_secs(), "data": 3}
            })
            .to_string(),
        )
        .unwrap();

        let cache = CacheStore::open_at(&path, CacheConfig::default()).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.purge_expired().unwrap(), 2);
        assert_eq!(cache.len(), 1);

        let reopened = CacheStore::open_at(&path, CacheConfig::default()).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let cache = store_in(&dir, CacheConfig::default().with_max_entries(2));

        cache.put(&CacheKey::Video("1".into()), json!(1), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put(&CacheKey::Video("2".into()), json!(2), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put(&CacheKey::Video("3".into()), json!(3), None).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::Video("1".into())).is_none());
        assert!(cache.get(&CacheKey::Video("3".into())).is_some());
    }

    #[test]
    fn test_typed_helpers_and_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let cache = store_in(&dir, CacheConfig::default());
        let key = CacheKey::Handle("someone".into());

        cache.put_as(&key, &"UC42".to_string(), None).unwrap();
        let (id, etag): (String, _) = cache.get_as(&key).unwrap();
        assert_eq!(id, "UC42");
        assert!(etag.is_none());

        let wrong: Option<(Vec<u32>, _)> = cache.get_as(&key);
        assert!(wrong.is_none());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = CacheStore::disabled();
        let key = CacheKey::Video("abc".into());
        cache.put(&key, json!(1), None).unwrap();
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
        assert!(!cache.is_enabled());
    }
}
