//! Tubeharvest Core Library
//!
//! This crate provides the core functionality for the Tubeharvest application:
//! - Channel and video reference parsing and resolution
//! - Paged channel listing with an on-disk metadata cache and retry/backoff
//! - Batch downloading through yt-dlp on a bounded worker pool with
//!   aggregated progress
//! - Download history, thumbnail fetching and configuration

pub mod api;
pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
mod fs;
pub mod history;
pub mod metadata;
pub mod orchestrator;
pub mod reference;
pub mod retry;
pub mod thumbnail;
pub mod tools;
pub mod video;

pub use api::{MetadataApi, YouTubeDataApi};
pub use cache::{CacheConfig, CacheKey, CacheStore};
pub use config::AppConfig;
pub use downloader::{DownloadOutcome, DownloadWorker, MediaTool, ProgressSink, YtDlpTool};
pub use error::{Error, Result};
pub use history::HistoryStore;
pub use metadata::MetadataClient;
pub use orchestrator::{BatchEvent, BatchSummary, DownloadOrchestrator, QueueConfig};
pub use reference::{ChannelReference, ReferenceKind, ResolvedReference};
pub use thumbnail::ThumbnailFetcher;
pub use tools::{Tool, ToolLocator};
pub use video::{DownloadJob, DownloadMode, SortOrder, VideoRecord};
