//! JSON document persistence shared by the cache, history and config stores.
//!
//! Every document is written to a sibling temp file first and then renamed over
//! the target, so a reader never observes a half-written file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{Error, FileSystemError, Result};

/// Converts an I/O error for read operations.
pub(crate) fn read_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::ReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for write operations.
pub(crate) fn write_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for directory creation.
pub(crate) fn create_dir_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::CreateDirFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Seconds since the Unix epoch, with sub-second precision.
pub(crate) fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Read a file, treating "not found" as `None`.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(read_error(path, e)),
    }
}

/// Load a JSON document, falling back to `T::default()` when the file is
/// missing or cannot be parsed.
///
/// Read failures other than "not found" are reported; a corrupt document is
/// only logged so the application can keep working with an empty store.
pub(crate) fn load_json_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(content) = read_optional(path)? else {
        return Ok(T::default());
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(
                "Ignoring unreadable JSON document {}: {}",
                path.display(),
                e
            );
            Ok(T::default())
        }
    }
}

/// Load a JSON document whose contents must survive a failed parse.
///
/// An unreadable document is renamed to [`backup_path`] before starting from
/// `T::default()`, so later writes to `path` cannot replace it.
///
/// # Errors
///
/// Returns an error if the file cannot be read or cannot be moved aside.
pub(crate) fn load_json_or_set_aside<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(content) = read_optional(path)? else {
        return Ok(T::default());
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(value),
        Err(e) => {
            let backup = backup_path(path);
            fs::rename(path, &backup).map_err(|err| write_error(&backup, err))?;
            warn!(
                "Unreadable JSON document {} moved to {}: {}",
                path.display(),
                backup.display(),
                e
            );
            Ok(T::default())
        }
    }
}

/// `<name>.<unix secs>.bak` next to `path`.
pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(format!(".{:.0}.bak", unix_now_secs().floor()));
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| create_dir_error(parent, e))?;
    }

    let content = serde_json::to_string_pretty(value)?;
    let tmp_path = temp_sibling(path);

    fs::write(&tmp_path, content).map_err(|e| write_error(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        write_error(path, e)
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
