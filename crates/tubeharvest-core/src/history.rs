//! Download history persisted as a JSON mapping of URL to saved file.
//!
//! History is never pruned. A document that fails to parse is moved aside
//! rather than overwritten by the next record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::fs::{load_json_or_set_aside, unix_now_secs, write_json_atomic};

/// Default history file name.
pub const HISTORY_FILE_NAME: &str = "download_history.json";

/// Where a downloaded URL ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Saved file.
    pub file_path: PathBuf,
    /// When the entry was recorded (fractional seconds since the Unix epoch).
    pub timestamp: f64,
}

/// Persistent record of completed downloads.
///
/// Every [`record`](Self::record) rewrites the whole document under a mutex,
/// so concurrent workers never lose each other's entries.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, HistoryEntry>>,
}

impl HistoryStore {
    /// Load the history stored at `path`, starting empty if it does not exist.
    ///
    /// An unparseable file is renamed to `<name>.<secs>.bak` and the store
    /// starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or moved aside.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: BTreeMap<String, HistoryEntry> = load_json_or_set_aside(&path)?;
        info!(
            "Loaded download history from {} ({} entries)",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the history document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `url` was saved to `file_path`, replacing any earlier entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the history document cannot be written.
    pub fn record(&self, url: &str, file_path: &Path) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(
            url.to_string(),
            HistoryEntry {
                file_path: file_path.to_path_buf(),
                timestamp: unix_now_secs(),
            },
        );
        write_json_atomic(&self.path, &*entries)?;
        debug!("Recorded history entry for {} -> {}", url, file_path.display());
        Ok(())
    }

    /// Look up the entry for `url`.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<HistoryEntry> {
        self.lock().get(url).cloned()
    }

    /// Snapshot of every entry, ordered by URL.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, HistoryEntry)> {
        self.lock()
            .iter()
            .map(|(url, entry)| (url.clone(), entry.clone()))
            .collect()
    }

    /// Number of recorded URLs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, HistoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
