//! Video records, download jobs and browsing helpers.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Base URL of a video's watch page.
pub const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

static HASHTAG_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"#\S+").ok());

/// Metadata for one video as shown to the user.
///
/// Records are produced by the metadata client and never modified afterwards;
/// sorting and filtering only reorder or select references to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    /// Video ID.
    pub id: String,
    /// Title with hashtags removed.
    pub title: String,
    /// Thumbnail URL (medium quality when available).
    pub thumbnail_url: Option<String>,
    /// Publication timestamp as an ISO-8601 string.
    pub published_at: String,
    /// View count (0 when unknown).
    pub view_count: u64,
}

impl VideoRecord {
    /// URL of the video's watch page.
    #[must_use]
    pub fn watch_url(&self) -> String {
        watch_url(&self.id)
    }
}

/// Watch page URL for a video ID.
#[must_use]
pub fn watch_url(video_id: &str) -> String {
    format!("{WATCH_URL_PREFIX}{video_id}")
}

/// One item of a channel's upload collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEntry {
    /// Video ID.
    pub video_id: String,
    /// Raw title.
    pub title: String,
    /// Thumbnail URL.
    pub thumbnail_url: Option<String>,
    /// Publication timestamp.
    pub published_at: String,
}

impl UploadEntry {
    /// Build the display record once the view count is known.
    #[must_use]
    pub fn into_record(self, view_count: u64) -> VideoRecord {
        VideoRecord {
            title: clean_title(&self.title),
            id: self.video_id,
            thumbnail_url: self.thumbnail_url,
            published_at: self.published_at,
            view_count,
        }
    }
}

/// What to keep from a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DownloadMode {
    /// Best video and best audio merged into an mp4.
    #[default]
    #[serde(rename = "video+audio")]
    VideoAudio,
    /// Video stream only.
    #[serde(rename = "video")]
    VideoOnly,
    /// Audio transcoded to mp3.
    #[serde(rename = "audio")]
    AudioOnly,
}

impl DownloadMode {
    /// All modes, in menu order.
    pub const ALL: [Self; 3] = [Self::VideoAudio, Self::VideoOnly, Self::AudioOnly];

    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VideoAudio => "video+audio",
            Self::VideoOnly => "video",
            Self::AudioOnly => "audio",
        }
    }

    /// Whether the mode needs ffmpeg to merge or transcode.
    #[must_use]
    pub const fn needs_ffmpeg(self) -> bool {
        matches!(self, Self::VideoAudio | Self::AudioOnly)
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "video+audio" | "videoaudio" | "both" => Ok(Self::VideoAudio),
            "video" => Ok(Self::VideoOnly),
            "audio" | "mp3" => Ok(Self::AudioOnly),
            other => Err(Error::Configuration(format!(
                "Unknown download mode '{other}' (expected video+audio, video or audio)"
            ))),
        }
    }
}

/// A single video queued for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Video ID.
    pub video_id: String,
    /// Watch page URL passed to the downloader.
    pub url: String,
    /// Download mode.
    pub mode: DownloadMode,
}

impl DownloadJob {
    /// Create a job for a video ID.
    #[must_use]
    pub fn new(video_id: impl Into<String>, mode: DownloadMode) -> Self {
        let video_id = video_id.into();
        Self {
            url: watch_url(&video_id),
            video_id,
            mode,
        }
    }

    /// Create a job for a listed record.
    #[must_use]
    pub fn for_video(record: &VideoRecord, mode: DownloadMode) -> Self {
        Self::new(record.id.clone(), mode)
    }
}

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    Latest,
    /// Oldest first.
    Oldest,
    /// Most viewed first.
    Popular,
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "oldest" => Ok(Self::Oldest),
            "popular" => Ok(Self::Popular),
            other => Err(Error::Configuration(format!(
                "Unknown sort order '{other}' (expected latest, oldest or popular)"
            ))),
        }
    }
}

/// Sort a view of records in place.
///
/// ISO-8601 timestamps compare correctly as strings. Ties keep their listing
/// order.
pub fn sort_videos(videos: &mut [&VideoRecord], order: SortOrder) {
    match order {
        SortOrder::Latest => videos.sort_by(|a, b| b.published_at.cmp(&a.published_at)),
        SortOrder::Oldest => videos.sort_by(|a, b| a.published_at.cmp(&b.published_at)),
        SortOrder::Popular => videos.sort_by_key(|v| Reverse(v.view_count)),
    }
}

/// Select the records whose title contains `query`, ignoring case.
///
/// A blank query selects everything.
#[must_use]
pub fn filter_videos<'a>(videos: &[&'a VideoRecord], query: &str) -> Vec<&'a VideoRecord> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return videos.to_vec();
    }
    videos
        .iter()
        .copied()
        .filter(|v| v.title.to_lowercase().contains(&query))
        .collect()
}

/// Strip hashtags from a title.
#[must_use]
pub fn clean_title(title: &str) -> String {
    match HASHTAG_RE.as_ref() {
        Some(re) => re.replace_all(title, "").trim().to_string(),
        None => title.trim().to_string(),
    }
}
