//! Remote metadata API.
//!
//! [`MetadataApi`] is the seam between the metadata client and the network:
//! it exposes exactly the five lookups the client needs. [`YouTubeDataApi`]
//! implements it over HTTP against the YouTube Data API v3.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApiError, Error, Result};
use crate::video::{UploadEntry, VideoRecord, clean_title};

/// Maximum page size and ID batch size accepted by the API.
pub const API_PAGE_SIZE: usize = 50;

/// Default API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Default request timeout in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Environment variable holding the API key by default.
pub const DEFAULT_API_KEY_ENV: &str = "YOUTUBE_API_KEY";

/// Connection settings for the metadata API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API base URL.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Environment variable the API key is read from.
    pub api_key_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

/// One page of a channel's upload collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistPage {
    /// Entries on this page.
    pub items: Vec<UploadEntry>,
    /// Token for the next page, absent on the last page.
    pub next_page_token: Option<String>,
    /// Entity tag of the page.
    pub etag: Option<String>,
}

/// Full metadata for a single video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVideo {
    /// Video ID.
    pub id: String,
    /// Raw title.
    pub title: String,
    /// Thumbnail URL.
    pub thumbnail_url: Option<String>,
    /// Publication timestamp.
    pub published_at: String,
    /// View count.
    pub view_count: u64,
}

impl ApiVideo {
    /// Convert into a display record.
    #[must_use]
    pub fn into_record(self) -> VideoRecord {
        VideoRecord {
            id: self.id,
            title: clean_title(&self.title),
            thumbnail_url: self.thumbnail_url,
            published_at: self.published_at,
            view_count: self.view_count,
        }
    }
}

/// View count of one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoStatistics {
    /// Video ID.
    pub id: String,
    /// View count.
    pub view_count: u64,
}

/// Remote lookups used by the metadata client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Search for a channel by name; returns the best match's ID.
    async fn search_channel(&self, query: &str) -> Result<Option<String>>;

    /// ID of the playlist holding a channel's uploads.
    async fn uploads_playlist(&self, channel_id: &str) -> Result<Option<String>>;

    /// One page (up to 50 entries) of a playlist.
    async fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<String>,
    ) -> Result<PlaylistPage>;

    /// Snippet and statistics of a single video.
    async fn video_details(&self, video_id: &str) -> Result<Option<ApiVideo>>;

    /// View counts for up to 50 videos.
    async fn video_statistics(&self, video_ids: &[String]) -> Result<Vec<VideoStatistics>>;
}

/// HTTP client for the YouTube Data API v3.
pub struct YouTubeDataApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for YouTubeDataApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YouTubeDataApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl YouTubeDataApi {
    /// Create a client, reading the API key from the configured environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::MissingApiKey`] if the variable is unset or blank.
    pub fn from_env(config: &ApiConfig) -> Result<Self> {
        let key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ApiError::MissingApiKey {
                env_var: config.api_key_env.clone(),
            })?;
        Self::with_key(config, key)
    }

    /// Create a client with an explicit API key.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_key(config: &ApiConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ApiError::Network {
                message: format!("Failed to create HTTP client: {e}"),
                transient: false,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}/{endpoint}", self.base_url);
        debug!("GET {} {:?}", url, params);

        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body = response.text().await.map_err(network_error)?;

        if !status.is_success() {
            let err = status_error(status, &body);
            warn!("{} returned {}", endpoint, status);
            return Err(err.into());
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::Api(ApiError::Decode(format!("{endpoint}: {e}"))))
    }
}

#[async_trait]
impl MetadataApi for YouTubeDataApi {
    async fn search_channel(&self, query: &str) -> Result<Option<String>> {
        let response: SearchResponse = self
            .get_json(
                "search",
                &[
                    ("part", "snippet"),
                    ("q", query),
                    ("type", "channel"),
                    ("maxResults", "1"),
                ],
            )
            .await?;
        Ok(response.first_channel_id())
    }

    async fn uploads_playlist(&self, channel_id: &str) -> Result<Option<String>> {
        let response: ChannelListResponse = self
            .get_json("channels", &[("part", "contentDetails"), ("id", channel_id)])
            .await?;
        Ok(response.uploads_playlist())
    }

    async fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<String>,
    ) -> Result<PlaylistPage> {
        let page_size = API_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "snippet"),
            ("playlistId", playlist_id),
            ("maxResults", page_size.as_str()),
        ];
        if let Some(token) = page_token.as_deref() {
            params.push(("pageToken", token));
        }

        let response: PlaylistItemsResponse = self.get_json("playlistItems", &params).await?;
        Ok(response.into_page())
    }

    async fn video_details(&self, video_id: &str) -> Result<Option<ApiVideo>> {
        let response: VideoListResponse = self
            .get_json("videos", &[("part", "snippet,statistics"), ("id", video_id)])
            .await?;
        Ok(response.items.into_iter().find_map(VideoItem::into_api_video))
    }

    async fn video_statistics(&self, video_ids: &[String]) -> Result<Vec<VideoStatistics>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = video_ids.join(",");
        let page_size = API_PAGE_SIZE.to_string();
        let response: VideoListResponse = self
            .get_json(
                "videos",
                &[
                    ("part", "statistics"),
                    ("id", ids.as_str()),
                    ("maxResults", page_size.as_str()),
                ],
            )
            .await?;
        Ok(response
            .items
            .into_iter()
            .map(|item| VideoStatistics {
                view_count: item.view_count(),
                id: item.id,
            })
            .collect())
    }
}

fn network_error(e: reqwest::Error) -> Error {
    Error::Api(ApiError::Network {
        transient: e.is_timeout() || e.is_connect(),
        message: e.to_string(),
    })
}

/// Map a non-success response to an error, preferring the API's own message.
fn status_error(status: StatusCode, body: &str) -> ApiError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .map(|r| r.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    ApiError::Http {
        status: status.as_u16(),
        message,
    }
}

// Wire format of the v3 API, reduced to the fields in use.

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Thumbnails {
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

impl Thumbnails {
    fn best_url(self) -> Option<String> {
        self.medium.or(self.default).map(|t| t.url)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

impl SearchResponse {
    fn first_channel_id(self) -> Option<String> {
        self.items.into_iter().next().map(|item| item.snippet.channel_id)
    }
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    snippet: SearchSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    channel_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

impl ChannelListResponse {
    fn uploads_playlist(self) -> Option<String> {
        self.items
            .into_iter()
            .next()
            .and_then(|item| item.content_details.related_playlists.uploads)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    content_details: ChannelContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Debug, Deserialize)]
struct RelatedPlaylists {
    uploads: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    etag: Option<String>,
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

impl PlaylistItemsResponse {
    fn into_page(self) -> PlaylistPage {
        PlaylistPage {
            items: self
                .items
                .into_iter()
                .map(|item| item.snippet.into_entry())
                .collect(),
            next_page_token: self.next_page_token.filter(|t| !t.is_empty()),
            etag: self.etag,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    snippet: PlaylistSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistSnippet {
    title: String,
    published_at: String,
    #[serde(default)]
    thumbnails: Thumbnails,
    resource_id: ResourceId,
}

impl PlaylistSnippet {
    fn into_entry(self) -> UploadEntry {
        UploadEntry {
            video_id: self.resource_id.video_id,
            title: self.title,
            thumbnail_url: self.thumbnails.best_url(),
            published_at: self.published_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    snippet: Option<VideoSnippet>,
    statistics: Option<Statistics>,
}

impl VideoItem {
    fn view_count(&self) -> u64 {
        self.statistics
            .as_ref()
            .and_then(|s| s.view_count.as_deref())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn into_api_video(self) -> Option<ApiVideo> {
        let view_count = self.view_count();
        let snippet = self.snippet?;
        Some(ApiVideo {
            id: self.id,
            title: snippet.title,
            thumbnail_url: snippet.thumbnails.best_url(),
            published_at: snippet.published_at,
            view_count,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    published_at: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    view_count: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_response_first_channel() {
        let response: SearchResponse = serde_json::from_value(json!({
            "items": [
                {"id": {"channelId": "UC1"}, "snippet": {"channelId": "UC1", "title": "One"}},
                {"id": {"channelId": "UC2"}, "snippet": {"channelId": "UC2", "title": "Two"}}
            ]
        }))
        .unwrap();
        assert_eq!(response.first_channel_id().as_deref(), Some("UC1"));

        let empty: SearchResponse = serde_json::from_value(json!({"items": []})).unwrap();
        assert!(empty.first_channel_id().is_none());
    }

    #[test]
    fn test_channel_uploads_playlist() {
        let response: ChannelListResponse = serde_json::from_value(json!({
            "items": [{"contentDetails": {"relatedPlaylists": {"uploads": "UU1", "likes": ""}}}]
        }))
        .unwrap();
        assert_eq!(response.uploads_playlist().as_deref(), Some("UU1"));

        let missing: ChannelListResponse = serde_json::from_value(json!({})).unwrap();
        assert!(missing.uploads_playlist().is_none());
    }

    #[test]
    fn test_playlist_page_conversion() {
        let response: PlaylistItemsResponse = serde_json::from_value(json!({
            "etag": "tag-1",
            "nextPageToken": "CDIQAA",
            "items": [
                {"snippet": {
                    "title": "First #new",
                    "publishedAt": "2024-01-01T00:00:00Z",
                    "thumbnails": {
                        "default": {"url": "https://i.ytimg.com/vi/a/default.jpg"},
                        "medium": {"url": "https://i.ytimg.com/vi/a/mqdefault.jpg"}
                    },
                    "resourceId": {"kind": "youtube#video", "videoId": "a"}
                }},
                {"snippet": {
                    "title": "Second",
                    "publishedAt": "2024-01-02T00:00:00Z",
                    "thumbnails": {"default": {"url": "https://i.ytimg.com/vi/b/default.jpg"}},
                    "resourceId": {"videoId": "b"}
                }}
            ]
        }))
        .unwrap();

        let page = response.into_page();
        assert_eq!(page.etag.as_deref(), Some("tag-1"));
        assert_eq!(page.next_page_token.as_deref(), Some("CDIQAA"));
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].video_id, "a");
        assert_eq!(page.items[0].title, "First #new");
        assert_eq!(
            page.items[0].thumbnail_url.as_deref(),
            Some("https://i.ytimg.com/vi/a/mqdefault.jpg")
        );
        assert_eq!(
            page.items[1].thumbnail_url.as_deref(),
            Some("https://i.ytimg.com/vi/b/default.jpg")
        );
    }

    #[test]
    fn test_last_page_has_no_token() {
        let response: PlaylistItemsResponse =
            serde_json::from_value(json!({"items": [], "nextPageToken": ""})).unwrap();
        assert!(response.into_page().next_page_token.is_none());
    }

    #[test]
    fn test_video_item_conversion() {
        let response: VideoListResponse = serde_json::from_value(json!({
            "items": [{
                "id": "xyz",
                "snippet": {
                    "title": "Launch #space #rockets",
                    "publishedAt": "2024-05-01T12:00:00Z",
                    "thumbnails": {"medium": {"url": "https://i.ytimg.com/vi/xyz/mqdefault.jpg"}}
                },
                "statistics": {"viewCount": "1234567", "likeCount": "10"}
            }]
        }))
        .unwrap();

        let video = response
            .items
            .into_iter()
            .find_map(VideoItem::into_api_video)
            .unwrap();
        assert_eq!(video.view_count, 1_234_567);

        let record = video.into_record();
        assert_eq!(record.title, "Launch");
        assert_eq!(record.id, "xyz");
    }

    #[test]
    fn test_missing_view_count_is_zero() {
        let response: VideoListResponse = serde_json::from_value(json!({
            "items": [
                {"id": "a", "statistics": {}},
                {"id": "b"},
                {"id": "c", "statistics": {"viewCount": "not a number"}}
            ]
        }))
        .unwrap();
        assert!(response.items.iter().all(|item| item.view_count() == 0));
    }

    #[test]
    fn test_status_error_uses_api_message() {
        let body = r#"{"error": {"code": 403, "message": "The request cannot be completed because you have exceeded your quota."}}"#;
        let err = status_error(StatusCode::FORBIDDEN, body);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("exceeded your quota"));

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "<html>down</html>");
        assert!(err.is_transient());
        assert!(err.to_string().contains("Service Unavailable"));

        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
    }

    #[test]
    fn test_missing_api_key() {
        let config = ApiConfig {
            api_key_env: "TUBEHARVEST_TEST_UNSET_API_KEY".to_string(),
            ..Default::default()
        };
        let err = YouTubeDataApi::from_env(&config).unwrap_err();
        assert!(matches!(
            err,
            Error::Api(ApiError::MissingApiKey { ref env_var }) if env_var == "TUBEHARVEST_TEST_UNSET_API_KEY"
        ));
    }

    #[test]
    fn test_with_key_trims_base_url() {
        let config = ApiConfig {
            base_url: "http://localhost:9999/v3/".to_string(),
            ..Default::default()
        };
        let api = YouTubeDataApi::with_key(&config, "k").unwrap();
        assert_eq!(api.base_url, "http://localhost:9999/v3");
    }
}
