//! Metadata client: reference resolution, upload listing and view counts.
//!
//! Every lookup checks the [`CacheStore`] first and stores what it fetched.
//! Paged listing retries each page with exponential backoff, and a page's
//! items are appended only once that page has succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{API_PAGE_SIZE, MetadataApi};
use crate::cache::{CacheKey, CacheStore};
use crate::error::{Error, Result};
use crate::reference::{ChannelReference, ReferenceKind, ResolvedReference};
use crate::retry::{RetryConfig, with_backoff};
use crate::video::{UploadEntry, VideoRecord};

/// Client for channel and video metadata.
pub struct MetadataClient {
    api: Arc<dyn MetadataApi>,
    cache: Arc<CacheStore>,
    retry: RetryConfig,
}

impl MetadataClient {
    /// Create a client over an API implementation and a cache.
    pub fn new(api: Arc<dyn MetadataApi>, cache: Arc<CacheStore>) -> Self {
        Self {
            api,
            cache,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry settings for paged requests.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The cache used by this client.
    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Parse and resolve a user-supplied reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReference`] for unparseable input and
    /// [`Error::ResolutionFailed`] when no channel matches a handle.
    pub async fn resolve_reference(&self, input: &str) -> Result<ResolvedReference> {
        let reference = ChannelReference::parse(input)?;
        self.resolve(&reference).await
    }

    /// Resolve an already parsed reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResolutionFailed`] when no channel matches a handle or
    /// custom path, or the API error that prevented the search.
    pub async fn resolve(&self, reference: &ChannelReference) -> Result<ResolvedReference> {
        let name = match reference {
            ChannelReference::Video(id) => return Ok(ResolvedReference::video(id.clone())),
            ChannelReference::ChannelId(id) => return Ok(ResolvedReference::channel(id.clone())),
            ChannelReference::Handle(name) | ChannelReference::CustomPath(name) => name,
        };

        let key = CacheKey::Handle(name.clone());
        if let Some((channel_id, _)) = self.cache.get_as::<String>(&key) {
            debug!("Resolved {} from cache: {}", reference, channel_id);
            return Ok(ResolvedReference::channel(channel_id));
        }

        let channel_id = self
            .api
            .search_channel(name)
            .await?
            .ok_or_else(|| Error::ResolutionFailed(reference.to_string()))?;

        info!("Resolved {} to channel {}", reference, channel_id);
        self.store(&key, &channel_id, None).await;
        Ok(ResolvedReference::channel(channel_id))
    }

    /// List every upload of a channel, oldest page first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the channel has no upload collection and
    /// [`Error::MetadataFetchFailed`] if a request keeps failing.
    pub async fn list_channel_videos(&self, channel_id: &str) -> Result<Vec<UploadEntry>> {
        let key = CacheKey::ChannelVideos(channel_id.to_string());
        if let Some((entries, _)) = self.cache.get_as::<Vec<UploadEntry>>(&key) {
            info!(
                "Using cached upload list for {} ({} videos)",
                channel_id,
                entries.len()
            );
            return Ok(entries);
        }

        let playlist_id = with_backoff(&self.retry, "uploads lookup", || {
            self.api.uploads_playlist(channel_id)
        })
        .await?
        .ok_or_else(|| Error::not_found("channel", channel_id))?;

        let mut entries = Vec::new();
        let mut etag = None;
        let mut token: Option<String> = None;
        let mut pages = 0_usize;

        loop {
            let page = with_backoff(&self.retry, "playlist page", || {
                self.api.playlist_page(&playlist_id, token.clone())
            })
            .await?;

            pages += 1;
            etag = etag.or(page.etag);
            entries.extend(page.items);

            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }

        info!(
            "Listed {} videos for channel {} in {} page(s)",
            entries.len(),
            channel_id,
            pages
        );
        self.store(&key, &entries, etag).await;
        Ok(entries)
    }

    /// Fetch one video's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the API knows no such video.
    pub async fn fetch_single_video(&self, video_id: &str) -> Result<VideoRecord> {
        let key = CacheKey::Video(video_id.to_string());
        if let Some((record, _)) = self.cache.get_as::<VideoRecord>(&key) {
            debug!("Using cached metadata for video {}", video_id);
            return Ok(record);
        }

        let record = self
            .api
            .video_details(video_id)
            .await?
            .ok_or_else(|| Error::not_found("video", video_id))?
            .into_record();

        self.store(&key, &record, None).await;
        Ok(record)
    }

    /// Fetch view counts in batches of 50.
    ///
    /// A failed batch is logged and contributes nothing; the other batches
    /// still run.
    pub async fn fetch_view_counts(&self, video_ids: &[String]) -> HashMap<String, u64> {
        let mut counts = HashMap::with_capacity(video_ids.len());

        for batch in video_ids.chunks(API_PAGE_SIZE) {
            let key = CacheKey::Stats(batch.to_vec());
            if let Some((cached, _)) = self.cache.get_as::<HashMap<String, u64>>(&key) {
                counts.extend(cached);
                continue;
            }

            match self.api.video_statistics(batch).await {
                Ok(stats) => {
                    let batch_counts: HashMap<String, u64> = stats
                        .into_iter()
                        .map(|s| (s.id, s.view_count))
                        .collect();
                    self.store(&key, &batch_counts, None).await;
                    counts.extend(batch_counts);
                }
                Err(e) => {
                    error!(
                        "Failed to fetch view counts for batch of {} (first {}): {}",
                        batch.len(),
                        batch.first().map_or("", String::as_str),
                        e
                    );
                }
            }
        }

        counts
    }

    /// Resolve `input` and load the records to browse.
    ///
    /// A video reference yields that single video; a channel yields all of its
    /// uploads with view counts attached (0 when unavailable).
    ///
    /// # Errors
    ///
    /// Propagates resolution and listing failures.
    pub async fn browse(&self, input: &str) -> Result<Vec<VideoRecord>> {
        let resolved = self.resolve_reference(input).await?;

        match resolved.kind {
            ReferenceKind::Video => Ok(vec![self.fetch_single_video(&resolved.id).await?]),
            ReferenceKind::Channel => {
                let entries = self.list_channel_videos(&resolved.id).await?;
                let ids: Vec<String> = entries.iter().map(|e| e.video_id.clone()).collect();
                let counts = self.fetch_view_counts(&ids).await;

                Ok(entries
                    .into_iter()
                    .map(|entry| {
                        let views = counts.get(&entry.video_id).copied().unwrap_or(0);
                        entry.into_record(views)
                    })
                    .collect())
            }
        }
    }

    /// Persist `value` under `key` off the async worker threads.
    async fn store<T: Serialize + Sync>(&self, key: &CacheKey, value: &T, etag: Option<String>) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize {} for the cache: {}", key, e);
                return;
            }
        };

        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        let written = tokio::task::spawn_blocking(move || {
            if let Err(e) = cache.put(&key, data, etag) {
                warn!("Failed to cache {}: {}", key, e);
            }
        })
        .await;
        if let Err(e) = written {
            warn!("Cache write task failed: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::api::{ApiVideo, MockMetadataApi, PlaylistPage, VideoStatistics};
    use crate::cache::CacheConfig;
    use crate::error::ApiError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn entry(id: &str) -> UploadEntry {
        UploadEntry {
            video_id: id.to_string(),
            title: format!("Video {id} #tag"),
            thumbnail_url: None,
            published_at: format!("2024-01-01T00:00:{id:0>2}Z"),
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> PlaylistPage {
        PlaylistPage {
            items: ids.iter().map(|id| entry(id)).collect(),
            next_page_token: next.map(String::from),
            etag: Some("etag".to_string()),
        }
    }

    fn unavailable() -> Error {
        Error::Api(ApiError::Http {
            status: 503,
            message: "backend error".to_string(),
        })
    }

    fn client(api: MockMetadataApi, dir: &TempDir) -> MetadataClient {
        let cache = CacheStore::open_at(dir.path().join("cache.json"), CacheConfig::default()).unwrap();
        MetadataClient::new(Arc::new(api), Arc::new(cache))
    }

    fn expect_three_pages(api: &mut MockMetadataApi) {
        api.expect_uploads_playlist()
            .returning(|_| Ok(Some("UU1".to_string())));
        api.expect_playlist_page()
            .withf(|_, token| token.is_none())
            .times(1)
            .returning(|_, _| Ok(page(&["1", "2"], Some("p2"))));
        api.expect_playlist_page()
            .withf(|_, token| token.as_deref() == Some("p2"))
            .times(1)
            .returning(|_, _| Ok(page(&["3", "4"], Some("p3"))));
        api.expect_playlist_page()
            .withf(|_, token| token.as_deref() == Some("p3"))
            .times(1)
            .returning(|_, _| Ok(page(&["5"], None)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cache_is_on_disk_when_call_returns() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_search_channel()
            .times(1)
            .returning(|_| Ok(Some("UC99".to_string())));
        let client = client(api, &dir);

        client.resolve_reference("@someone").await.unwrap();

        let reopened =
            CacheStore::open_at(dir.path().join("cache.json"), CacheConfig::default()).unwrap();
        let (channel_id, _) = reopened
            .get_as::<String>(&CacheKey::Handle("someone".to_string()))
            .unwrap();
        assert_eq!(channel_id, "UC99");
    }

    #[tokio::test]
    async fn test_local_references_need_no_api() {
        let dir = TempDir::new().unwrap();
        let client = client(MockMetadataApi::new(), &dir);

        let video = client
            .resolve_reference("https://www.youtube.com/watch?v=abc&t=3")
            .await
            .unwrap();
        assert_eq!(video, ResolvedReference::video("abc"));

        let channel = client
            .resolve_reference("https://www.youtube.com/channel/UC42/videos")
            .await
            .unwrap();
        assert_eq!(channel, ResolvedReference::channel("UC42"));
    }

    #[tokio::test]
    async fn test_handle_resolution_is_cached() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_search_channel()
            .withf(|q| q == "veritasium")
            .times(1)
            .returning(|_| Ok(Some("UCHnyfMqiRRG1u-2MsSQLbXA".to_string())));
        let client = client(api, &dir);

        for _ in 0..2 {
            let resolved = client.resolve_reference("@veritasium").await.unwrap();
            assert_eq!(resolved.id, "UCHnyfMqiRRG1u-2MsSQLbXA");
            assert_eq!(resolved.kind, ReferenceKind::Channel);
        }
    }

    #[tokio::test]
    async fn test_unknown_handle_fails_resolution() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_search_channel().returning(|_| Ok(None));
        let client = client(api, &dir);

        let err = client.resolve_reference("@nobody").await.unwrap_err();
        assert!(matches!(err, Error::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_reference() {
        let dir = TempDir::new().unwrap();
        let client = client(MockMetadataApi::new(), &dir);
        let err = client.resolve_reference("not a channel").await.unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }

    #[tokio::test]
    async fn test_pages_are_concatenated_in_order() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        expect_three_pages(&mut api);
        let client = client(api, &dir);

        let entries = client.list_channel_videos("UC1").await.unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.video_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_listing_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        expect_three_pages(&mut api);
        let client = client(api, &dir);

        let first = client.list_channel_videos("UC1").await.unwrap();
        // The mock allows each page exactly once.
        let second = client.list_channel_videos("UC1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_page_failures_are_retried_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_uploads_playlist()
            .returning(|_| Ok(Some("UU1".to_string())));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        api.expect_playlist_page().returning(move |_, token| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            match (token.as_deref(), n) {
                (None, _) => Ok(page(&["1", "2"], Some("p2"))),
                (Some("p2"), 1 | 2) => Err(unavailable()),
                (Some("p2"), _) => Ok(page(&["3"], None)),
                _ => unreachable!(),
            }
        });
        let client = client(api, &dir);

        let entries = client.list_channel_videos("UC1").await.unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.video_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_listing() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_uploads_playlist()
            .returning(|_| Ok(Some("UU1".to_string())));
        api.expect_playlist_page()
            .times(3)
            .returning(|_, _| Err(unavailable()));
        let client = client(api, &dir);

        let err = client.list_channel_videos("UC1").await.unwrap_err();
        assert!(matches!(err, Error::MetadataFetchFailed { attempts: 3, .. }));
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_channel_without_uploads_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_uploads_playlist().returning(|_| Ok(None));
        let client = client(api, &dir);

        let err = client.list_channel_videos("UCgone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "channel", .. }));
    }

    #[tokio::test]
    async fn test_single_video_and_not_found() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_video_details()
            .withf(|id| id == "abc")
            .times(1)
            .returning(|_| {
                Ok(Some(ApiVideo {
                    id: "abc".to_string(),
                    title: "Hello #world".to_string(),
                    thumbnail_url: None,
                    published_at: "2024-01-01T00:00:00Z".to_string(),
                    view_count: 7,
                }))
            });
        api.expect_video_details()
            .withf(|id| id == "missing")
            .returning(|_| Ok(None));
        let client = client(api, &dir);

        let record = client.fetch_single_video("abc").await.unwrap();
        assert_eq!(record.title, "Hello");
        assert_eq!(record.view_count, 7);
        // Second call hits the cache.
        assert_eq!(client.fetch_single_video("abc").await.unwrap(), record);

        let err = client.fetch_single_video("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "video", .. }));
    }

    #[tokio::test]
    async fn test_view_counts_are_batched_and_failures_isolated() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<String> = (0..120).map(|i| format!("v{i}")).collect();

        let mut api = MockMetadataApi::new();
        api.expect_video_statistics()
            .times(3)
            .returning(|batch: &[String]| {
                assert!(batch.len() <= 50);
                if batch[0] == "v50" {
                    return Err(unavailable());
                }
                Ok(batch
                    .iter()
                    .map(|id| VideoStatistics {
                        id: id.clone(),
                        view_count: 10,
                    })
                    .collect())
            });
        let client = client(api, &dir);

        let counts = client.fetch_view_counts(&ids).await;
        assert_eq!(counts.len(), 70);
        assert_eq!(counts.get("v0"), Some(&10));
        assert!(!counts.contains_key("v75"));
        assert_eq!(counts.get("v119"), Some(&10));
    }

    #[tokio::test]
    async fn test_browse_channel_attaches_view_counts() {
        let dir = TempDir::new().unwrap();
        let mut api = MockMetadataApi::new();
        api.expect_uploads_playlist()
            .returning(|_| Ok(Some("UU1".to_string())));
        api.expect_playlist_page()
            .returning(|_, _| Ok(page(&["1", "2"], None)));
        api.expect_video_statistics().returning(|_| {
            Ok(vec![VideoStatistics {
                id: "1".to_string(),
                view_count: 99,
            }])
        });
        let client = client(api, &dir);

        let records = client
            .browse("https://www.youtube.com/channel/UC1")
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "Video 1");
        assert_eq!(records[0].view_count, 99);
        assert_eq!(records[1].view_count, 0);
    }
}
