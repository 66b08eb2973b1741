mod cli;
mod commands;
mod config;
mod coordinator;
mod errors;
mod extractor;
mod format;
mod media;
mod state;
mod updater;
mod utils;
mod ytdlp;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::commands::{EXIT_OK, EXIT_STARTUP};
use crate::config::Settings;
use crate::coordinator::{Coordinator, DownloadRequest, TaskStatus};
use crate::extractor::MediaBackend;
use crate::media::Ffmpeg;
use crate::state::StateStore;
use crate::updater::Updater;
use crate::ytdlp::YtDlp;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download
    #[arg(index = 1)]
    urls: Vec<String>,

    /// URL to download (repeatable)
    #[arg(short = 'u', long = "url")]
    url: Vec<String>,

    /// File with one URL per line (`#` starts a comment)
    #[arg(short = 't', long = "tasks-file")]
    tasks_file: Option<PathBuf>,

    /// Directory to save downloads in
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Format selector: best, audio-only, video-only, or yt-dlp format ids like 137+140
    #[arg(short = 'f', long)]
    format: Option<String>,

    /// Download audio only and convert it to mp3
    #[arg(short = 'a', long = "audio-only", conflicts_with = "format")]
    audio_only: bool,

    /// Maximum number of concurrent downloads
    #[arg(short = 'c', long = "max-workers")]
    max_workers: Option<usize>,

    /// Proxy URL passed to yt-dlp
    #[arg(long)]
    proxy: Option<String>,

    /// Netscape-format cookies file passed to yt-dlp
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// Also save thumbnails
    #[arg(long)]
    thumbnail: bool,

    /// Also save subtitles
    #[arg(long)]
    subtitles: bool,

    /// Graphical interface (falls back to the console)
    #[arg(long, conflicts_with = "cli")]
    gui: bool,

    /// Console interface (default)
    #[arg(long)]
    cli: bool,

    /// Continue the unfinished downloads of an earlier session
    #[arg(short = 'r', long)]
    resume: bool,

    /// List unfinished downloads and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// Show the formats available for the given URLs and exit
    #[arg(long = "list-formats")]
    list_formats: bool,

    /// Check whether a newer yt-dlp is available and exit
    #[arg(long = "check-update")]
    check_update: bool,

    /// Upgrade yt-dlp with the configured command and exit
    #[arg(long)]
    upgrade: bool,

    /// Write the effective settings back to the configuration file
    #[arg(long = "save-config")]
    save_config: bool,

    /// Configuration file (default: <config dir>/vdl/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start the async runtime: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match rt.block_on(run(args)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

fn init_logging(path: &Path, verbose: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(file)))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(output) = &args.output {
        settings.output_dir = output.clone();
    }
    if let Some(max_workers) = args.max_workers {
        settings.max_workers = max_workers;
    }
    if let Some(proxy) = &args.proxy {
        settings.proxy = proxy.clone();
    }
    if let Some(cookies) = &args.cookies {
        settings.cookies = cookies.to_string_lossy().into_owned();
    }
    if let Some(format) = &args.format {
        settings.default_format = format.clone();
    }
    if args.thumbnail {
        settings.download_thumbnails = true;
    }
    if args.subtitles {
        settings.download_subtitles = true;
    }
    // Output dir might not exist yet, so resolve it against the current dir.
    if settings.output_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            settings.output_dir = cwd.join(&settings.output_dir);
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Settings::default_path()?,
    };
    // The log location lives in the settings, so they are read once to find it and
    // again once logging is up, which keeps the load warnings in the log.
    let log_path = Settings::load(&config_path)
        .map(|s| s.log_path())
        .unwrap_or_else(|_| Settings::default().log_path());
    init_logging(&log_path, args.verbose)?;
    info!("Starting vdl {}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    apply_overrides(&mut settings, &args);
    settings.validate().context("Invalid settings")?;

    if args.save_config {
        settings
            .save(&config_path)
            .with_context(|| format!("Failed to save configuration to {:?}", config_path))?;
        println!("Saved configuration to {:?}", config_path);
    }
    if args.gui {
        warn!("Graphical interface requested but not available, using the console");
        eprintln!("The graphical interface is not available in this build; using the console.");
    }

    let updater = Updater::new(settings.upgrade_command.clone());
    if args.upgrade {
        commands::upgrade(&updater).await?;
        return Ok(EXIT_OK);
    }

    let ytdlp_path = YtDlp::locate(settings.ytdlp_path.as_deref())?;
    let ffmpeg = Ffmpeg::locate(settings.ffmpeg_path.as_deref());
    match &ffmpeg {
        Some(ffmpeg) => match ffmpeg.probe().await {
            Ok(banner) => info!("Using {} at {:?}", banner, ffmpeg.path()),
            Err(e) => warn!("ffmpeg at {:?} did not run: {}", ffmpeg.path(), e),
        },
        None => {
            warn!("ffmpeg not found; merging and audio conversion will fail");
            eprintln!("Warning: ffmpeg not found; merging formats and audio conversion will fail.");
        }
    }
    let ytdlp = Arc::new(YtDlp::new(ytdlp_path).with_ffmpeg(ffmpeg.map(|f| f.path().to_path_buf())));

    if args.check_update {
        commands::check_update(&updater, &ytdlp).await?;
        return Ok(EXIT_OK);
    }

    let version = ytdlp
        .version()
        .await
        .with_context(|| format!("yt-dlp at {:?} is not usable", ytdlp.program()))?;
    info!("Using yt-dlp {} at {:?}", version, ytdlp.program());

    let mut urls: Vec<String> = args.urls.iter().chain(args.url.iter()).cloned().collect();
    if let Some(tasks_file) = &args.tasks_file {
        urls.extend(commands::read_tasks_file(tasks_file).await?);
    }

    if args.list_formats {
        let options = settings.fetch_options();
        for url in &urls {
            commands::list_formats(&ytdlp, url, &options).await?;
            println!();
        }
        return Ok(EXIT_OK);
    }

    let store = Arc::new(StateStore::new(settings.state_path()));
    let backend: Arc<dyn MediaBackend> = ytdlp.clone();
    let coordinator = Coordinator::open(backend, store, settings.clone())
        .await
        .context("Failed to restore download state")?;

    if args.list {
        commands::list_pending(&coordinator);
        return Ok(EXIT_OK);
    }

    let mut resumed = Vec::new();
    if args.resume {
        resumed = commands::resume_pending(&coordinator).await?;
    } else {
        let pending = coordinator
            .tasks()
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Paused | TaskStatus::Failed))
            .count();
        if pending > 0 {
            println!(
                "{} unfinished downloads from an earlier session. Use --resume to continue them or --list to see them.",
                pending
            );
        }
    }

    if urls.is_empty() && !args.resume {
        println!("Nothing to download. Pass URLs, --tasks-file or --resume.");
        return Ok(EXIT_OK);
    }

    if settings.check_for_updates {
        match updater.check(&ytdlp).await {
            Ok(report) if report.needs_update => println!(
                "Note: yt-dlp {} is available (installed: {}). Run with --upgrade to update.",
                report.latest,
                report.current.as_deref().unwrap_or("unknown")
            ),
            Ok(_) => {}
            Err(e) => warn!("Update check failed: {}", e),
        }
    }

    let format_selector = if args.audio_only {
        "audio-only".to_string()
    } else {
        settings.default_format.clone()
    };
    let requests = urls
        .into_iter()
        .map(|url| DownloadRequest {
            url,
            destination: settings.output_dir.clone(),
            format_selector: format_selector.clone(),
            want_thumbnail: settings.download_thumbnails,
            want_subtitles: settings.download_subtitles,
            playlist_index: None,
        })
        .collect();

    let report = commands::run_downloads(&coordinator, requests, resumed).await?;
    Ok(report.exit_code())
}
