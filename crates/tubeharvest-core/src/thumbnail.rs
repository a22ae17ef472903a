//! Thumbnail fetching for listed videos.
//!
//! Thumbnails are downloaded on their own small pool with a short timeout so
//! that a slow image host never holds up listing or downloading. Each fetch
//! fails independently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Error, Result};
use crate::video::VideoRecord;

/// Default number of concurrent thumbnail fetches.
pub const DEFAULT_THUMBNAIL_WORKERS: usize = 4;

/// Default timeout for thumbnail fetch requests.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;

/// Thumbnail fetch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Concurrent fetches.
    pub workers: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_THUMBNAIL_WORKERS,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

/// Generate a thumbnail URL for a video ID.
///
/// Used when the listing carried no thumbnail.
#[must_use]
pub fn youtube_thumbnail_url(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{video_id}/mqdefault.jpg")
}

/// Result of fetching one thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailOutcome {
    /// Video ID.
    pub video_id: String,
    /// Saved file, or the reason the fetch failed.
    pub result: std::result::Result<PathBuf, String>,
}

/// Downloads thumbnails to `<dir>/<video id>.jpg`.
#[derive(Debug, Clone)]
pub struct ThumbnailFetcher {
    client: reqwest::Client,
    workers: usize,
}

impl ThumbnailFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ThumbnailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ApiError::Network {
                message: format!("Failed to create HTTP client: {e}"),
                transient: false,
            })?;
        Ok(Self {
            client,
            workers: config.workers.max(1),
        })
    }

    /// Fetch thumbnails for every record, returning one outcome per record in
    /// input order. Files already present are kept.
    pub async fn fetch_all(&self, records: &[VideoRecord], dir: &Path) -> Vec<ThumbnailOutcome> {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            let reason = crate::fs::create_dir_error(dir, e).to_string();
            return records
                .iter()
                .map(|r| ThumbnailOutcome {
                    video_id: r.id.clone(),
                    result: Err(reason.clone()),
                })
                .collect();
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, record) in records.iter().enumerate() {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            let video_id = record.id.clone();
            let url = record
                .thumbnail_url
                .clone()
                .unwrap_or_else(|| youtube_thumbnail_url(&record.id));
            let path = dir.join(format!("{video_id}.jpg"));

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => save_thumbnail(&client, &url, &path)
                        .await
                        .map(|()| path)
                        .map_err(|e| {
                            warn!("Thumbnail for {} failed: {}", video_id, e);
                            e.to_string()
                        }),
                    Err(_) => Err("thumbnail pool closed".to_string()),
                };
                (index, ThumbnailOutcome { video_id, result })
            });
        }

        let mut outcomes: Vec<Option<ThumbnailOutcome>> = vec![None; records.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!("Thumbnail task failed: {}", e),
            }
        }

        let outcomes: Vec<ThumbnailOutcome> = outcomes
            .into_iter()
            .zip(records)
            .map(|(outcome, record)| {
                outcome.unwrap_or_else(|| ThumbnailOutcome {
                    video_id: record.id.clone(),
                    result: Err("thumbnail task ended unexpectedly".to_string()),
                })
            })
            .collect();

        let saved = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!("Fetched {}/{} thumbnails into {}", saved, outcomes.len(), dir.display());
        outcomes
    }
}

async fn save_thumbnail(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        debug!("Thumbnail already present: {}", path.display());
        return Ok(());
    }

    let response = client.get(url).send().await.map_err(|e| ApiError::Network {
        transient: e.is_timeout() || e.is_connect(),
        message: format!("Failed to fetch thumbnail: {e}"),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Http {
            status: status.as_u16(),
            message: format!("thumbnail request to {url} failed"),
        }
        .into());
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.starts_with("image/") {
        warn!("Unexpected content type for thumbnail: {}", content_type);
    }

    let data = response.bytes().await.map_err(|e| ApiError::Network {
        transient: false,
        message: format!("Failed to read thumbnail data: {e}"),
    })?;
    if data.is_empty() {
        return Err(Error::Api(ApiError::Decode("Empty thumbnail data".to_string())));
    }

    tokio::fs::write(path, &data)
        .await
        .map_err(|e| crate::fs::write_error(path, e))
}
