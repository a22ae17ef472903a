//! Discovery of the external `yt-dlp` and `ffmpeg` executables.
//!
//! Each tool is looked up in the application-local tools directory first
//! (by default the directory holding the running executable), then in every
//! directory of `PATH`.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Tool discovery settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Directory searched before `PATH`. Defaults to the executable's directory.
    pub tools_dir: Option<PathBuf>,
}

/// An external executable the downloader depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// The media downloader.
    YtDlp,
    /// Used to merge streams and transcode audio.
    Ffmpeg,
}

impl Tool {
    /// Name of the tool as shown to users.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::YtDlp => "yt-dlp",
            Self::Ffmpeg => "ffmpeg",
        }
    }

    /// File name of the executable on this platform.
    #[must_use]
    pub fn binary_name(self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.name())
        } else {
            self.name().to_string()
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Finds external tools on disk.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    tools_dir: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl ToolLocator {
    /// Create a locator from configuration, falling back to the directory of
    /// the running executable.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        let tools_dir = config.tools_dir.clone().or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
        });
        Self {
            tools_dir,
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Create a locator with an explicit tools directory and search path.
    #[must_use]
    pub fn with_paths(tools_dir: Option<PathBuf>, search_path: Option<OsString>) -> Self {
        Self {
            tools_dir,
            search_path,
        }
    }

    /// Locate `tool`, returning `None` if it is not installed.
    #[must_use]
    pub fn locate(&self, tool: Tool) -> Option<PathBuf> {
        let binary = tool.binary_name();

        let local = self.tools_dir.iter().map(|dir| dir.join(&binary));
        let on_path = self
            .search_path
            .iter()
            .flat_map(std::env::split_paths)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(&binary));

        let found = local.chain(on_path).find(|candidate| candidate.is_file());
        match &found {
            Some(path) => debug!("Found {} at {}", tool, path.display()),
            None => debug!("{} not found", tool),
        }
        found
    }

    /// Locate `tool` or fail with [`Error::ToolMissing`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolMissing`] if the tool cannot be found.
    pub fn require(&self, tool: Tool) -> Result<PathBuf> {
        self.locate(tool).ok_or_else(|| Error::tool_missing(tool.name()))
    }
}
