//! Command handlers for the `tubeharvest` binary.
//!
//! Each handler wires the core services together from [`AppConfig`] and
//! renders results for the terminal.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tubeharvest_core::video::{filter_videos, sort_videos};
use tubeharvest_core::{
    AppConfig, BatchEvent, BatchSummary, CacheStore, DownloadJob, DownloadMode,
    DownloadOrchestrator, DownloadWorker, Error, HistoryStore, MetadataClient, Result, SortOrder,
    ThumbnailFetcher, ToolLocator, VideoRecord, YouTubeDataApi, YtDlpTool,
};

/// Width of the aggregate progress bar in characters.
const BAR_WIDTH: usize = 30;

/// Which listed videos a download should include.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every listed video (after search filtering).
    All,
    /// Only these video IDs.
    Ids(Vec<String>),
    /// Nothing chosen on the command line.
    Unspecified,
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Everything succeeded.
    Completed,
    /// The command ran but some items failed.
    PartialFailure,
}

/// Services shared by all commands.
pub struct AppState {
    config: AppConfig,
}

impl AppState {
    /// Create state over a loaded configuration.
    pub const fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn cache(&self) -> Result<Arc<CacheStore>> {
        Ok(Arc::new(CacheStore::open(self.config.cache.clone())?))
    }

    fn metadata_client(&self) -> Result<MetadataClient> {
        let api = YouTubeDataApi::from_env(&self.config.api)?;
        Ok(MetadataClient::new(Arc::new(api), self.cache()?).with_retry(self.config.retry))
    }

    fn history(&self) -> Result<Arc<HistoryStore>> {
        Ok(Arc::new(HistoryStore::load(self.config.history_file())?))
    }

    fn orchestrator(&self) -> Result<DownloadOrchestrator> {
        let tool = YtDlpTool::new(ToolLocator::new(&self.config.tools));
        let worker = DownloadWorker::new(Arc::new(tool), self.history()?);
        Ok(DownloadOrchestrator::new(worker, &self.config.queue))
    }

    /// Load records for `reference`, filtered by `search` and ordered by `sort`.
    async fn load_view(
        &self,
        reference: &str,
        sort: Option<SortOrder>,
        search: Option<&str>,
    ) -> Result<Vec<VideoRecord>> {
        let records = self.metadata_client()?.browse(reference).await?;
        Ok(arrange(
            &records,
            sort.unwrap_or(self.config.default_sort),
            search.unwrap_or(""),
        ))
    }

    /// `list`: print the videos behind a reference.
    pub async fn list(
        &self,
        reference: &str,
        sort: Option<SortOrder>,
        search: Option<&str>,
        json: bool,
    ) -> Result<CommandStatus> {
        let view = self.load_view(reference, sort, search).await?;
        let mut stdout = std::io::stdout().lock();

        if json {
            let rendered = serde_json::to_string_pretty(&view)?;
            writeln!(stdout, "{rendered}")?;
        } else {
            write!(stdout, "{}", render_listing(&view))?;
        }
        Ok(CommandStatus::Completed)
    }

    /// `download`: fetch the selected videos behind a reference.
    pub async fn download(
        &self,
        reference: &str,
        mode: Option<DownloadMode>,
        output: Option<PathBuf>,
        selection: Selection,
        search: Option<&str>,
    ) -> Result<CommandStatus> {
        let view = self.load_view(reference, None, search).await?;
        let chosen = select(&view, &selection)?;
        let mode = mode.unwrap_or(self.config.default_mode);
        let dest = output.unwrap_or_else(|| self.config.download_directory.clone());

        let jobs: Vec<DownloadJob> = chosen
            .iter()
            .map(|record| DownloadJob::for_video(record, mode))
            .collect();
        info!(
            "Downloading {} video(s) as {} into {}",
            jobs.len(),
            mode,
            dest.display()
        );

        let orchestrator = self.orchestrator()?;
        let mut printer = ProgressPrinter::default();
        let summary = orchestrator
            .run_batch(jobs, dest, |event| printer.handle(event))
            .await?;

        print!("{}", render_summary(&summary));
        Ok(if summary.failed == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::PartialFailure
        })
    }

    /// `thumbnails`: save thumbnails of the videos behind a reference.
    pub async fn thumbnails(
        &self,
        reference: &str,
        output: PathBuf,
        search: Option<&str>,
    ) -> Result<CommandStatus> {
        let view = self.load_view(reference, None, search).await?;
        let fetcher = ThumbnailFetcher::new(&self.config.thumbnails)?;
        let outcomes = fetcher.fetch_all(&view, &output).await;

        let mut failed = 0_usize;
        for outcome in &outcomes {
            match &outcome.result {
                Ok(path) => println!("{}  {}", outcome.video_id, path.display()),
                Err(reason) => {
                    failed += 1;
                    println!("{}  failed: {}", outcome.video_id, reason);
                }
            }
        }
        Ok(if failed == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::PartialFailure
        })
    }

    /// `history`: print what has been downloaded.
    pub fn history_report(&self) -> Result<CommandStatus> {
        let history = self.history()?;
        let mut entries = history.entries();
        entries.sort_by(|a, b| {
            b.1.timestamp
                .total_cmp(&a.1.timestamp)
                .then_with(|| a.0.cmp(&b.0))
        });

        if entries.is_empty() {
            println!("No downloads recorded in {}", history.path().display());
        }
        for (url, entry) in entries {
            println!(
                "{:.0}  {}  {}",
                entry.timestamp.floor(),
                url,
                entry.file_path.display()
            );
        }
        Ok(CommandStatus::Completed)
    }

    /// `cache purge`: drop expired cache entries.
    pub fn purge_cache(&self) -> Result<CommandStatus> {
        let cache = self.cache()?;
        let removed = cache.purge_expired()?;
        println!(
            "Removed {} expired entr{} from {} ({} left)",
            removed,
            if removed == 1 { "y" } else { "ies" },
            cache.path().display(),
            cache.len()
        );
        Ok(CommandStatus::Completed)
    }

    /// `config show`: print the effective configuration.
    pub fn show_config(&self) -> Result<CommandStatus> {
        println!("{}", serde_json::to_string_pretty(&self.config)?);
        Ok(CommandStatus::Completed)
    }
}

/// Filter then sort `records`.
pub fn arrange(records: &[VideoRecord], sort: SortOrder, search: &str) -> Vec<VideoRecord> {
    let all: Vec<&VideoRecord> = records.iter().collect();
    let mut view = filter_videos(&all, search);
    sort_videos(&mut view, sort);
    view.into_iter().cloned().collect()
}

/// Pick the records a download should include.
///
/// A lone record is chosen implicitly.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when nothing is chosen or none of the
/// requested IDs are listed.
pub fn select<'a>(view: &'a [VideoRecord], selection: &Selection) -> Result<Vec<&'a VideoRecord>> {
    let chosen: Vec<&VideoRecord> = match selection {
        Selection::All => view.iter().collect(),
        Selection::Unspecified if view.len() == 1 => view.iter().collect(),
        Selection::Unspecified => {
            return Err(Error::Configuration(format!(
                "{} videos listed; choose with --all or --select",
                view.len()
            )));
        }
        Selection::Ids(ids) => {
            for id in ids {
                if !view.iter().any(|r| &r.id == id) {
                    warn!("Video {} is not in the listing, skipping", id);
                }
            }
            view.iter().filter(|r| ids.contains(&r.id)).collect()
        }
    };

    if chosen.is_empty() {
        return Err(Error::Configuration("No videos selected".to_string()));
    }
    Ok(chosen)
}

/// Render records as an aligned table.
pub fn render_listing(records: &[VideoRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let date = record.published_at.get(..10).unwrap_or(&record.published_at);
        out.push_str(&format!(
            "{:<11}  {:<10}  {:>12}  {}\n",
            record.id, date, record.view_count, record.title
        ));
    }
    out.push_str(&format!("{} video(s)\n", records.len()));
    out
}

/// Render the end-of-batch report.
pub fn render_summary(summary: &BatchSummary) -> String {
    let mut out = String::new();
    for outcome in &summary.outcomes {
        let line = if outcome.success {
            let path = outcome
                .file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let note = if outcome.already_present {
                " (already present)"
            } else {
                ""
            };
            format!("  ok      {}  {}{}\n", outcome.video_id, path, note)
        } else {
            format!(
                "  failed  {}  {}\n",
                outcome.video_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            )
        };
        out.push_str(&line);
    }
    out.push_str(&format!(
        "{} of {} downloaded, {} failed\n",
        summary.succeeded, summary.total, summary.failed
    ));
    out
}

/// Text bar for an aggregate percentage.
pub fn render_bar(percent: f64, done: usize, total: usize) -> String {
    let clamped = percent.clamp(0.0, 100.0);
    let filled = ((clamped / 100.0) * BAR_WIDTH as f64).round() as usize;
    format!(
        "[{}{}] {:>5.1}% ({}/{})",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled.min(BAR_WIDTH)),
        clamped,
        done,
        total
    )
}

/// Draws batch events on stderr.
#[derive(Debug, Default)]
struct ProgressPrinter {
    bar_drawn: bool,
}

impl ProgressPrinter {
    fn handle(&mut self, event: &BatchEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = match event {
            BatchEvent::Aggregate {
                percent,
                done,
                total,
            } => {
                self.bar_drawn = true;
                write!(stderr, "\r{}", render_bar(*percent, *done, *total))
            }
            BatchEvent::JobFinished { outcome, .. } if !outcome.success => {
                self.bar_drawn = false;
                writeln!(
                    stderr,
                    "\rfailed {}: {}",
                    outcome.video_id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                )
            }
            BatchEvent::BatchCompleted(_) if self.bar_drawn => {
                self.bar_drawn = false;
                writeln!(stderr)
            }
            _ => Ok(()),
        };
    }
}
