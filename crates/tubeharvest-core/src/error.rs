//! Error types for Tubeharvest core operations.
//!
//! The top-level [`Error`] carries the user-facing taxonomy (invalid input,
//! resolution failures, missing tools) while domain errors ([`ApiError`],
//! [`DownloadError`], [`CacheError`], [`FileSystemError`]) keep the details.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tubeharvest core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The input does not look like any supported channel or video reference.
    #[error("Invalid channel reference: {0}")]
    InvalidReference(String),

    /// The API answered but no channel matched the reference.
    #[error("Could not resolve channel reference: {0}")]
    ResolutionFailed(String),

    /// A paged metadata fetch gave up.
    #[error("Metadata fetch failed after {attempts} attempt(s): {reason}")]
    MetadataFetchFailed {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Description of the last failure.
        reason: String,
    },

    /// The requested resource does not exist remotely.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of resource ("video", "channel").
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A required external executable is not installed.
    #[error("External tool is missing: {tool}")]
    ToolMissing {
        /// Name of the missing executable.
        tool: String,
    },

    /// A download batch stopped before every job reported a result.
    #[error("Download batch ended unexpectedly: {0}")]
    BatchAborted(String),

    /// Remote API error.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Download error.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Cache error.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// File system error.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Shorthand for a missing external tool.
    pub fn tool_missing(tool: impl Into<String>) -> Self {
        Self::ToolMissing { tool: tool.into() }
    }

    /// Shorthand for a missing remote resource.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Errors reported by the remote metadata API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No API key was configured.
    #[error("API key is not configured (set {env_var})")]
    MissingApiKey {
        /// Environment variable expected to hold the key.
        env_var: String,
    },

    /// The API answered with a non-success status.
    #[error("API request failed with status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message extracted from the response body.
        message: String,
    },

    /// The request never got a response.
    #[error("Network error: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
        /// Whether the failure was a timeout or connection problem.
        transient: bool,
    },

    /// The response body did not have the expected shape.
    #[error("Failed to decode API response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Rate limiting, server errors and connection problems are transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Network { transient, .. } => *transient,
            Self::MissingApiKey { .. } | Self::Decode(_) => false,
        }
    }
}

/// Errors raised while running the external downloader.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The downloader process could not be started.
    #[error("Failed to start {tool}: {reason}")]
    SpawnFailed {
        /// Executable that failed to start.
        tool: String,
        /// OS error message.
        reason: String,
    },

    /// The downloader exited unsuccessfully.
    #[error("Downloader exited with code {code:?}: {stderr}")]
    ProcessFailed {
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Tail of the process's standard error.
        stderr: String,
    },

    /// The downloader succeeded but did not report an output file.
    #[error("Downloader did not report an output file for {url}")]
    MissingOutput {
        /// URL that was downloaded.
        url: String,
    },
}

/// Cache-specific errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cached payload could not be converted to the requested type.
    #[error("Cached value for key '{key}' has an unexpected shape: {reason}")]
    InvalidPayload {
        /// Cache key.
        key: String,
        /// Deserialization error.
        reason: String,
    },
}

/// File system errors with the offending path attached.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading a file failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// Writing a file failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path that was written.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },
}
