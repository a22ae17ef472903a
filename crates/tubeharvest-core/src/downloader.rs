//! Download worker and the external downloader it drives.
//!
//! [`MediaTool`] is the seam around the external `yt-dlp` process; the
//! [`DownloadWorker`] owns the per-job contract:
//!
//! 1. check that the required tools are installed
//! 2. ask the tool where the output would be written
//! 3. if that file already exists, report success without downloading
//! 4. otherwise transfer, streaming byte progress to a [`ProgressSink`]
//!
//! A successful job is recorded in the [`HistoryStore`]. The worker never
//! returns an error: failures come back as a [`DownloadOutcome`] with
//! `success == false`.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{DownloadError, Error, Result};
use crate::history::HistoryStore;
use crate::tools::{Tool, ToolLocator};
use crate::video::{DownloadJob, DownloadMode};

/// Number of retries passed to yt-dlp for the download and for each fragment.
pub const TRANSFER_RETRIES: u32 = 3;

/// Audio bitrate used when extracting mp3.
pub const AUDIO_QUALITY: &str = "320K";

/// Prefix of the machine-readable progress lines requested from yt-dlp.
const PROGRESS_PREFIX: &str = "th-progress:";

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 8;

/// Byte progress reported while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProgress {
    /// Bytes received so far and the expected total, if known.
    Bytes {
        /// Bytes downloaded.
        downloaded: u64,
        /// Expected size.
        total: Option<u64>,
    },
    /// The transfer completed.
    Finished,
}

/// Receiver of a job's transfer progress.
#[derive(Clone)]
pub struct ProgressSink {
    callback: Option<Arc<dyn Fn(TransferProgress) + Send + Sync>>,
}

impl ProgressSink {
    /// Forward progress to `callback`.
    pub fn new(callback: impl Fn(TransferProgress) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// A sink that drops every update.
    #[must_use]
    pub const fn none() -> Self {
        Self { callback: None }
    }

    /// Report byte progress.
    pub fn report(&self, downloaded: u64, total: Option<u64>) {
        self.emit(TransferProgress::Bytes { downloaded, total });
    }

    /// Report completion.
    pub fn finished(&self) {
        self.emit(TransferProgress::Finished);
    }

    fn emit(&self, progress: TransferProgress) {
        if let Some(callback) = &self.callback {
            callback(progress);
        }
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink")
            .field("attached", &self.callback.is_some())
            .finish()
    }
}

/// External media downloader.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Verify that every executable needed for `mode` is installed.
    fn check_available(&self, mode: DownloadMode) -> Result<()>;

    /// Path the download of `url` would be saved to, without downloading.
    async fn probe_output(&self, url: &str, mode: DownloadMode, dest: &Path) -> Result<PathBuf>;

    /// Download `url` into `dest`, returning the final file path.
    async fn transfer(
        &self,
        url: &str,
        mode: DownloadMode,
        dest: &Path,
        progress: ProgressSink,
    ) -> Result<PathBuf>;
}

/// [`MediaTool`] backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpTool {
    locator: ToolLocator,
}

impl YtDlpTool {
    /// Create a tool that finds its executables through `locator`.
    #[must_use]
    pub const fn new(locator: ToolLocator) -> Self {
        Self { locator }
    }

    fn base_args(&self, mode: DownloadMode, dest: &Path) -> Vec<OsString> {
        build_args(mode, dest, self.locator.locate(Tool::Ffmpeg).as_deref())
    }

    async fn spawn(&self, args: Vec<OsString>) -> Result<tokio::process::Child> {
        let yt_dlp = self.locator.require(Tool::YtDlp)?;
        debug!("Running {} {:?}", yt_dlp.display(), args);

        Command::new(&yt_dlp)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Download(DownloadError::SpawnFailed {
                    tool: Tool::YtDlp.to_string(),
                    reason: e.to_string(),
                })
            })
    }
}

#[async_trait]
impl MediaTool for YtDlpTool {
    fn check_available(&self, mode: DownloadMode) -> Result<()> {
        self.locator.require(Tool::YtDlp)?;
        if mode.needs_ffmpeg() {
            self.locator.require(Tool::Ffmpeg)?;
        }
        Ok(())
    }

    async fn probe_output(&self, url: &str, mode: DownloadMode, dest: &Path) -> Result<PathBuf> {
        let mut args = self.base_args(mode, dest);
        args.extend(
            ["--simulate", "--no-warnings", "--print", "filename", url]
                .into_iter()
                .map(OsString::from),
        );

        let output = self
            .spawn(args)
            .await?
            .wait_with_output()
            .await
            .map_err(|e| DownloadError::SpawnFailed {
                tool: Tool::YtDlp.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DownloadError::ProcessFailed {
                code: output.status.code(),
                stderr: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = last_output_line(&stdout).ok_or_else(|| DownloadError::MissingOutput {
            url: url.to_string(),
        })?;
        Ok(final_output_path(PathBuf::from(path), mode))
    }

    async fn transfer(
        &self,
        url: &str,
        mode: DownloadMode,
        dest: &Path,
        progress: ProgressSink,
    ) -> Result<PathBuf> {
        let mut args = self.base_args(mode, dest);
        let template = format!(
            "download:{PROGRESS_PREFIX}%(progress.downloaded_bytes)s:%(progress.total_bytes)s:%(progress.total_bytes_estimate)s"
        );
        args.extend(
            [
                "--newline",
                "--progress",
                "--progress-template",
                template.as_str(),
                "--print",
                "after_move:filepath",
                url,
            ]
            .into_iter()
            .map(OsString::from),
        );

        let mut child = self.spawn(args).await?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_reader = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let mut final_path = None;
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((downloaded, total)) = parse_progress_line(&line) {
                    progress.report(downloaded, total);
                } else if !line.trim().is_empty() {
                    final_path = Some(PathBuf::from(line.trim()));
                }
            }
        }

        let status = child.wait().await.map_err(|e| DownloadError::SpawnFailed {
            tool: Tool::YtDlp.to_string(),
            reason: e.to_string(),
        })?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            return Err(DownloadError::ProcessFailed {
                code: status.code(),
                stderr: stderr_tail(&stderr),
            }
            .into());
        }

        progress.finished();
        final_path.ok_or_else(|| {
            DownloadError::MissingOutput {
                url: url.to_string(),
            }
            .into()
        })
    }
}

/// Command line shared by probing and transferring, without the URL.
fn build_args(mode: DownloadMode, dest: &Path, ffmpeg: Option<&Path>) -> Vec<OsString> {
    let retries = TRANSFER_RETRIES.to_string();
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |arg: &str| args.push(OsString::from(arg));

    let format = match mode {
        DownloadMode::VideoAudio => "bestvideo+bestaudio/best",
        DownloadMode::VideoOnly => "bestvideo",
        DownloadMode::AudioOnly => "bestaudio[ext=m4a]",
    };
    push("-f");
    push(format);
    push("--no-playlist");
    push("--restrict-filenames");
    push("--retries");
    push(retries.as_str());
    push("--fragment-retries");
    push(retries.as_str());

    match mode {
        DownloadMode::VideoAudio => {
            push("--merge-output-format");
            push("mp4");
        }
        DownloadMode::VideoOnly => {}
        DownloadMode::AudioOnly => {
            push("--extract-audio");
            push("--audio-format");
            push("mp3");
            push("--audio-quality");
            push(AUDIO_QUALITY);
        }
    }

    args.push(OsString::from("-o"));
    args.push(dest.join("%(title)s.%(ext)s").into_os_string());

    if let Some(ffmpeg) = ffmpeg {
        args.push(OsString::from("--ffmpeg-location"));
        args.push(ffmpeg.as_os_str().to_os_string());
    }

    args
}

/// Parse a `th-progress:<downloaded>:<total>:<estimate>` line.
///
/// Fields yt-dlp cannot fill are printed as `NA`; the exact total is preferred
/// over the estimate.
fn parse_progress_line(line: &str) -> Option<(u64, Option<u64>)> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split(':').map(parse_byte_count);

    let downloaded = fields.next()??;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();
    Some((downloaded, total.or(estimate).filter(|t| *t > 0)))
}

fn parse_byte_count(field: &str) -> Option<u64> {
    let value: f64 = field.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then(|| value.round() as u64)
}

fn last_output_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).rfind(|line| !line.is_empty())
}

/// yt-dlp reports the pre-conversion name; audio ends up as mp3.
fn final_output_path(path: PathBuf, mode: DownloadMode) -> PathBuf {
    match mode {
        DownloadMode::AudioOnly => path.with_extension("mp3"),
        DownloadMode::VideoAudio | DownloadMode::VideoOnly => path,
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    /// Video ID of the job.
    pub video_id: String,
    /// URL of the job.
    pub url: String,
    /// Whether the file is now on disk.
    pub success: bool,
    /// Where the file is.
    pub file_path: Option<PathBuf>,
    /// Whether the file was already present and nothing was transferred.
    pub already_present: bool,
    /// Failure description.
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn succeeded(job: &DownloadJob, file_path: PathBuf, already_present: bool) -> Self {
        Self {
            video_id: job.video_id.clone(),
            url: job.url.clone(),
            success: true,
            file_path: Some(file_path),
            already_present,
            error: None,
        }
    }

    /// A failed outcome for `job`.
    #[must_use]
    pub fn failed(job: &DownloadJob, error: impl Into<String>) -> Self {
        Self {
            video_id: job.video_id.clone(),
            url: job.url.clone(),
            success: false,
            file_path: None,
            already_present: false,
            error: Some(error.into()),
        }
    }
}

/// Runs single download jobs.
#[derive(Clone)]
pub struct DownloadWorker {
    tool: Arc<dyn MediaTool>,
    history: Arc<HistoryStore>,
}

impl DownloadWorker {
    /// Create a worker.
    pub fn new(tool: Arc<dyn MediaTool>, history: Arc<HistoryStore>) -> Self {
        Self { tool, history }
    }

    /// The history this worker records into.
    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Download one job into `dest`.
    pub async fn download(
        &self,
        job: &DownloadJob,
        dest: &Path,
        progress: ProgressSink,
    ) -> DownloadOutcome {
        match self.try_download(job, dest, progress).await {
            Ok((path, already_present)) => {
                self.remember(&job.url, &path).await;
                DownloadOutcome::succeeded(job, path, already_present)
            }
            Err(e) => {
                error!("Download failed for {} ({}): {}", job.url, job.mode, e);
                DownloadOutcome::failed(job, e.to_string())
            }
        }
    }

    /// Record a finished download without blocking the async workers.
    async fn remember(&self, url: &str, path: &Path) {
        let history = Arc::clone(&self.history);
        let url = url.to_string();
        let path = path.to_path_buf();
        let recorded = tokio::task::spawn_blocking(move || {
            if let Err(e) = history.record(&url, &path) {
                warn!("Failed to record history for {}: {}", url, e);
            }
        })
        .await;
        if let Err(e) = recorded {
            warn!("History write task failed: {}", e);
        }
    }

    async fn try_download(
        &self,
        job: &DownloadJob,
        dest: &Path,
        progress: ProgressSink,
    ) -> Result<(PathBuf, bool)> {
        self.tool.check_available(job.mode)?;

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| crate::fs::create_dir_error(dest, e))?;

        let expected = self.tool.probe_output(&job.url, job.mode, dest).await?;
        if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
            info!("Already downloaded {}: {}", job.url, expected.display());
            progress.finished();
            return Ok((expected, true));
        }

        info!("Downloading {} ({})", job.url, job.mode);
        let path = self.tool.transfer(&job.url, job.mode, dest, progress).await?;
        info!("Downloaded {} to {}", job.url, path.display());
        Ok((path, false))
    }
}

impl fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("history", &self.history.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::history::HISTORY_FILE_NAME;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn worker(tool: MockMediaTool, dir: &TempDir) -> DownloadWorker {
        let history = HistoryStore::load(dir.path().join(HISTORY_FILE_NAME)).unwrap();
        DownloadWorker::new(Arc::new(tool), Arc::new(history))
    }

    fn job() -> DownloadJob {
        DownloadJob::new("abc", DownloadMode::VideoAudio)
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("th-progress:1024:4096:NA"),
            Some((1024, Some(4096)))
        );
        assert_eq!(
            parse_progress_line("th-progress:1024:NA:5000.7"),
            Some((1024, Some(5001)))
        );
        assert_eq!(parse_progress_line("th-progress:10:NA:NA"), Some((10, None)));
        assert_eq!(parse_progress_line("th-progress:NA:NA:NA"), None);
        assert_eq!(parse_progress_line("/music/Some_Title.mp4"), None);
    }

    #[test]
    fn test_args_per_mode() {
        let dest = Path::new("/out");
        let joined = |mode| {
            build_args(mode, dest, Some(Path::new("/tools/ffmpeg")))
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        };

        let both = joined(DownloadMode::VideoAudio);
        assert!(both.contains("-f bestvideo+bestaudio/best"));
        assert!(both.contains("--merge-output-format mp4"));
        assert!(both.contains("--no-playlist"));
        assert!(both.contains("--restrict-filenames"));
        assert!(both.contains("--retries 3 --fragment-retries 3"));
        assert!(both.contains("--ffmpeg-location /tools/ffmpeg"));
        assert!(both.contains("%(title)s.%(ext)s"));

        let video = joined(DownloadMode::VideoOnly);
        assert!(video.contains("-f bestvideo "));
        assert!(!video.contains("--merge-output-format"));

        let audio = joined(DownloadMode::AudioOnly);
        assert!(audio.contains("-f bestaudio[ext=m4a]"));
        assert!(audio.contains("--extract-audio --audio-format mp3 --audio-quality 320K"));
    }

    #[test]
    fn test_output_path_helpers() {
        assert_eq!(
            last_output_line("\n/out/A_Title.webm\n\n"),
            Some("/out/A_Title.webm")
        );
        assert_eq!(last_output_line("  \n"), None);
        assert_eq!(
            final_output_path(PathBuf::from("/out/Song.m4a"), DownloadMode::AudioOnly),
            PathBuf::from("/out/Song.mp3")
        );
        assert_eq!(
            final_output_path(PathBuf::from("/out/Clip.mp4"), DownloadMode::VideoAudio),
            PathBuf::from("/out/Clip.mp4")
        );
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (0..20).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("line 19"));
    }

    #[test]
    fn test_progress_sink_forwards_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            ProgressSink::new(move |p| seen.lock().unwrap().push(p))
        };
        sink.report(5, Some(10));
        sink.finished();
        ProgressSink::none().report(1, None);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TransferProgress::Bytes {
                    downloaded: 5,
                    total: Some(10)
                },
                TransferProgress::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_file_skips_transfer() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("Already_Here.mp4");
        std::fs::write(&existing, b"data").unwrap();

        let mut tool = MockMediaTool::new();
        tool.expect_check_available().returning(|_| Ok(()));
        let probed = existing.clone();
        tool.expect_probe_output()
            .returning(move |_, _, _| Ok(probed.clone()));
        tool.expect_transfer().never();
        let worker = worker(tool, &dir);

        let outcome = worker.download(&job(), dir.path(), ProgressSink::none()).await;
        assert!(outcome.success);
        assert!(outcome.already_present);
        assert_eq!(outcome.file_path.as_deref(), Some(existing.as_path()));
        assert_eq!(worker.history().get(&job().url).unwrap().file_path, existing);
    }

    #[tokio::test]
    async fn test_transfer_success_records_history() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("New_Video.mp4");

        let mut tool = MockMediaTool::new();
        tool.expect_check_available().returning(|_| Ok(()));
        let probed = target.clone();
        tool.expect_probe_output()
            .returning(move |_, _, _| Ok(probed.clone()));
        let saved = target.clone();
        tool.expect_transfer()
            .times(1)
            .returning(move |_, _, _, progress| {
                progress.report(50, Some(100));
                progress.finished();
                Ok(saved.clone())
            });
        let worker = worker(tool, &dir);

        let updates = Arc::new(Mutex::new(0));
        let sink = {
            let updates = Arc::clone(&updates);
            ProgressSink::new(move |_| *updates.lock().unwrap() += 1)
        };

        let outcome = worker.download(&job(), dir.path(), sink).await;
        assert!(outcome.success);
        assert!(!outcome.already_present);
        assert_eq!(outcome.file_path, Some(target.clone()));
        assert_eq!(*updates.lock().unwrap(), 2);
        assert_eq!(worker.history().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_history_is_on_disk_when_download_returns() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("On_Disk.mp4");
        std::fs::write(&existing, b"data").unwrap();

        let mut tool = MockMediaTool::new();
        tool.expect_check_available().returning(|_| Ok(()));
        let probed = existing.clone();
        tool.expect_probe_output()
            .returning(move |_, _, _| Ok(probed.clone()));
        let worker = worker(tool, &dir);

        worker.download(&job(), dir.path(), ProgressSink::none()).await;

        let reloaded = HistoryStore::load(dir.path().join(HISTORY_FILE_NAME)).unwrap();
        assert_eq!(reloaded.get(&job().url).unwrap().file_path, existing);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_without_probing() {
        let dir = TempDir::new().unwrap();
        let mut tool = MockMediaTool::new();
        tool.expect_check_available()
            .returning(|_| Err(Error::tool_missing("ffmpeg")));
        tool.expect_probe_output().never();
        tool.expect_transfer().never();
        let worker = worker(tool, &dir);

        let outcome = worker.download(&job(), dir.path(), ProgressSink::none()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("ffmpeg"));
        assert!(worker.history().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut tool = MockMediaTool::new();
        tool.expect_check_available().returning(|_| Ok(()));
        tool.expect_probe_output()
            .returning(|_, _, dest| Ok(dest.join("Missing.mp4")));
        tool.expect_transfer().returning(|_, _, _, _| {
            Err(DownloadError::ProcessFailed {
                code: Some(1),
                stderr: "ERROR: Video unavailable".to_string(),
            }
            .into())
        });
        let worker = worker(tool, &dir);

        let outcome = worker.download(&job(), dir.path(), ProgressSink::none()).await;
        assert!(!outcome.success);
        assert!(outcome.file_path.is_none());
        assert!(outcome.error.unwrap().contains("Video unavailable"));
        assert!(worker.history().is_empty());
    }
}
