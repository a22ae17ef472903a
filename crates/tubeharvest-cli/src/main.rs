//! Tubeharvest - browse a channel's videos and download a selection.
//!
//! This is the command line entry point.

mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tubeharvest_core::{AppConfig, DownloadMode, SortOrder};

use commands::{AppState, CommandStatus, Selection};
use logging::LoggingConfig;

/// Exit code when some items of a command failed.
const PARTIAL_FAILURE_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tubeharvest", version, about)]
struct Cli {
    /// Configuration file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase console log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the videos of a channel, or a single video.
    List {
        /// Channel URL, @handle, channel ID or video URL.
        reference: String,
        /// latest, oldest or popular.
        #[arg(long)]
        sort: Option<SortOrder>,
        /// Only show titles containing this text.
        #[arg(long)]
        search: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Download selected videos.
    Download {
        /// Channel URL, @handle, channel ID or video URL.
        reference: String,
        /// video+audio, video or audio.
        #[arg(long)]
        mode: Option<DownloadMode>,
        /// Output directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Download every listed video.
        #[arg(long, conflicts_with = "select")]
        all: bool,
        /// Video IDs to download.
        #[arg(long, num_args = 1..)]
        select: Vec<String>,
        /// Only consider titles containing this text.
        #[arg(long)]
        search: Option<String>,
    },
    /// Save thumbnails of listed videos.
    Thumbnails {
        /// Channel URL, @handle, channel ID or video URL.
        reference: String,
        /// Directory to save thumbnails into.
        #[arg(short, long)]
        output: PathBuf,
        /// Only consider titles containing this text.
        #[arg(long)]
        search: Option<String>,
    },
    /// Show download history.
    History,
    /// Manage the metadata cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Remove expired entries.
    Purge,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Print the configuration file location.
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init(&LoggingConfig::auto().with_verbosity(cli.verbose)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: file logging disabled: {e}");
            None
        }
    };

    match run(cli).await {
        Ok(CommandStatus::Completed) => ExitCode::SUCCESS,
        Ok(CommandStatus::PartialFailure) => ExitCode::from(PARTIAL_FAILURE_EXIT),
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> tubeharvest_core::Result<CommandStatus> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let config_path = cli.config.unwrap_or_else(AppConfig::config_file_path);
    info!("Starting tubeharvest {}", env!("CARGO_PKG_VERSION"));
    let state = AppState::new(config);

    match cli.command {
        Command::List {
            reference,
            sort,
            search,
            json,
        } => state.list(&reference, sort, search.as_deref(), json).await,
        Command::Download {
            reference,
            mode,
            output,
            all,
            select,
            search,
        } => {
            let selection = if all {
                Selection::All
            } else if select.is_empty() {
                Selection::Unspecified
            } else {
                Selection::Ids(select)
            };
            state
                .download(&reference, mode, output, selection, search.as_deref())
                .await
        }
        Command::Thumbnails {
            reference,
            output,
            search,
        } => state.thumbnails(&reference, output, search.as_deref()).await,
        Command::History => state.history_report(),
        Command::Cache {
            action: CacheAction::Purge,
        } => state.purge_cache(),
        Command::Config {
            action: ConfigAction::Show,
        } => state.show_config(),
        Command::Config {
            action: ConfigAction::Path,
        } => {
            println!("{}", config_path.display());
            Ok(CommandStatus::Completed)
        }
    }
}
