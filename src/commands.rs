use anyhow::{Context, Result};
use indicatif::HumanBytes;
use log::{info, warn};
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::cli::{print_tasks, ConsoleReporter};
use crate::config::FetchOptions;
use crate::coordinator::{Coordinator, DownloadRequest, RunSummary, TaskId, TaskStatus};
use crate::errors::Error;
use crate::extractor::MediaBackend;
use crate::updater::Updater;
use crate::utils::format_duration;
use crate::ytdlp::YtDlp;

pub const EXIT_OK: u8 = 0;
pub const EXIT_STARTUP: u8 = 1;
pub const EXIT_FAILED: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Default)]
pub struct RunReport {
    pub summary: RunSummary,
    pub rejected: usize,
    /// Requested tasks that did not end Completed, whether or not this run touched them.
    pub unfinished: usize,
    pub interrupted: bool,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.summary.failed > 0 || self.rejected > 0 || self.unfinished > 0 {
            EXIT_FAILED
        } else {
            EXIT_OK
        }
    }
}

/// Reads URLs from a file, one per line. Blank lines and `#` comments are skipped.
pub async fn read_tasks_file(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open tasks file: {:?}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut urls = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        urls.push(raw.to_string());
    }
    Ok(urls)
}

/// Expands playlists, queues everything, and drives the coordinator until the queue
/// drains or Ctrl-C arrives. `resumed` holds tasks re-queued before the call; they count
/// towards the outcome like the new requests do.
pub async fn run_downloads(
    coordinator: &Coordinator,
    requests: Vec<DownloadRequest>,
    resumed: Vec<TaskId>,
) -> Result<RunReport> {
    let mut report = RunReport::default();

    let mut expanded = Vec::new();
    for request in requests {
        let url = request.url.clone();
        match coordinator.expand(request).await {
            Ok(members) => expanded.extend(members),
            Err(e) => {
                warn!("Could not resolve {}: {}", url, e);
                eprintln!("Skipping {}: {}", url, e);
                report.rejected += 1;
            }
        }
    }

    let submission = coordinator.submit(expanded);
    for rejection in &submission.rejected {
        eprintln!("Rejected '{}': {}", rejection.url, rejection.error);
    }
    report.rejected += submission.rejected.len();
    let mut requested = resumed;
    for id in submission.task_ids {
        if !requested.contains(&id) {
            requested.push(id);
        }
    }

    let done = CancellationToken::new();
    let reporter = tokio::spawn(ConsoleReporter::new().run(coordinator.subscribe(), done.clone()));

    let run = coordinator.run();
    tokio::pin!(run);
    report.summary = tokio::select! {
        summary = &mut run => summary,
        _ = tokio::signal::ctrl_c() => {
            report.interrupted = true;
            info!("Interrupt received, pausing running downloads");
            eprintln!("Interrupted, saving progress...");
            coordinator.shutdown().await;
            (&mut run).await
        }
    };

    done.cancel();
    if let Err(e) = reporter.await {
        warn!("Progress display task failed: {}", e);
    }
    report.unfinished = count_unfinished(coordinator, &requested);

    println!(
        "Finished: {} completed, {} failed, {} cancelled, {} paused, {} rejected",
        report.summary.completed,
        report.summary.failed,
        report.summary.cancelled,
        report.summary.paused,
        report.rejected
    );
    for task in coordinator.tasks() {
        if task.status == TaskStatus::Failed {
            eprintln!(
                "Failed: {} ({})",
                task.request.url,
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if report.summary.paused > 0 {
        println!(
            "{} downloads were paused. Run again with --resume to continue them.",
            report.summary.paused
        );
    }
    Ok(report)
}

fn count_unfinished(coordinator: &Coordinator, requested: &[TaskId]) -> usize {
    requested
        .iter()
        .filter(|id| {
            coordinator
                .progress(**id)
                .map_or(true, |t| t.status != TaskStatus::Completed)
        })
        .count()
}

/// Re-queues every restored task: from its resume marker when possible, else from scratch.
pub async fn resume_pending(coordinator: &Coordinator) -> Result<Vec<TaskId>> {
    let mut queued = Vec::new();
    for task in coordinator.tasks() {
        if !matches!(task.status, TaskStatus::Paused | TaskStatus::Failed) {
            continue;
        }
        match coordinator.resume(task.id).await {
            Ok(()) => queued.push(task.id),
            Err(Error::NotResumable(_, reason)) => {
                info!("Task {} cannot continue ({}), restarting it", task.id, reason);
                coordinator
                    .retry(task.id)
                    .await
                    .with_context(|| format!("Failed to restart task {}", task.id))?;
                queued.push(task.id);
            }
            Err(e) => return Err(e).context("Failed to resume task"),
        }
    }
    println!("Resuming {} downloads", queued.len());
    Ok(queued)
}

/// Prints the unfinished downloads recorded in the state file.
pub fn list_pending(coordinator: &Coordinator) {
    let tasks = coordinator.tasks();
    if tasks.is_empty() {
        println!("No unfinished downloads.");
        return;
    }
    let downloaded: u64 = tasks.iter().map(|t| t.downloaded_bytes).sum();
    let known: u64 = tasks.iter().filter_map(|t| t.total_bytes).sum();
    println!(
        "Summary: Pending: {} | Downloaded: {} / {}",
        tasks.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();
    print_tasks(&tasks);
}

pub async fn list_formats(backend: &YtDlp, url: &str, options: &FetchOptions) -> Result<()> {
    let resolution = backend
        .resolve(url, options)
        .await
        .with_context(|| format!("Failed to resolve {}", url))?;

    println!("Title: {}", resolution.title);
    if let Some(uploader) = &resolution.uploader {
        println!("Uploader: {}", uploader);
    }
    if resolution.is_playlist {
        println!("Playlist with {} entries:", resolution.member_urls.len());
        for (i, member) in resolution.member_urls.iter().enumerate() {
            println!("{:>4}. {}", i + 1, member);
        }
        return Ok(());
    }
    println!("Duration: {}", format_duration(resolution.duration_seconds));
    println!();

    let mut formats = resolution.available_formats;
    formats.sort_by(|a, b| {
        (b.has_video, b.height.unwrap_or(0), b.has_audio)
            .cmp(&(a.has_video, a.height.unwrap_or(0), a.has_audio))
    });
    for format in &formats {
        println!("  {}", format);
    }
    Ok(())
}

pub async fn check_update(updater: &Updater, ytdlp: &YtDlp) -> Result<bool> {
    let report = updater
        .check(ytdlp)
        .await
        .context("Failed to check for yt-dlp updates")?;
    let current = report.current.as_deref().unwrap_or("unknown");
    if report.needs_update {
        println!(
            "A newer yt-dlp is available: {} (installed: {}). Run with --upgrade to update.",
            report.latest, current
        );
    } else {
        println!("yt-dlp {} is up to date.", current);
    }
    Ok(report.needs_update)
}

pub async fn upgrade(updater: &Updater) -> Result<()> {
    let output = updater.upgrade().await.context("yt-dlp upgrade failed")?;
    if !output.is_empty() {
        println!("{}", output);
    }
    println!("yt-dlp upgrade finished.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::extractor::{FetchJob, FetchOutcome, FetchProgress, Resolution};
    use crate::state::StateStore;
    use std::sync::Arc;

    #[test]
    fn exit_codes() {
        let mut report = RunReport::default();
        assert_eq!(report.exit_code(), EXIT_OK);
        report.rejected = 1;
        assert_eq!(report.exit_code(), EXIT_FAILED);
        report.rejected = 0;
        report.summary.failed = 1;
        assert_eq!(report.exit_code(), EXIT_FAILED);
        report.interrupted = true;
        assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn unfinished_requests_fail_the_run() {
        // Nothing ran, so the summary is clean, but a requested task never completed.
        let report = RunReport {
            unfinished: 1,
            ..Default::default()
        };
        assert_eq!(report.summary, RunSummary::default());
        assert_eq!(report.exit_code(), EXIT_FAILED);
    }

    struct Idle;

    #[async_trait::async_trait]
    impl MediaBackend for Idle {
        fn name(&self) -> &'static str {
            "idle"
        }

        async fn resolve(&self, url: &str, _options: &FetchOptions) -> crate::errors::Result<Resolution> {
            Err(Error::Extraction(format!("{} is not reachable", url)))
        }

        async fn fetch(
            &self,
            job: FetchJob,
            _progress: tokio::sync::mpsc::UnboundedSender<FetchProgress>,
        ) -> crate::errors::Result<FetchOutcome> {
            Err(Error::Extraction(format!("{} is not reachable", job.url)))
        }
    }

    #[tokio::test]
    async fn queued_but_unrun_tasks_count_as_unfinished() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let backend: Arc<dyn MediaBackend> = Arc::new(Idle);
        let coordinator = Coordinator::open(backend, store, Settings::default())
            .await
            .expect("open coordinator");

        let id = coordinator
            .submit_one(DownloadRequest::new("https://video.example.com/watch?v=a", dir.path()))
            .unwrap();
        assert_eq!(count_unfinished(&coordinator, &[id]), 1);
        assert_eq!(count_unfinished(&coordinator, &[]), 0);
    }

    #[tokio::test]
    async fn tasks_file_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("download.txt");
        std::fs::write(
            &path,
            "# talks\nhttps://video.example.com/watch?v=1\n\n  https://video.example.com/watch?v=2  \n",
        )
        .expect("write");

        let urls = read_tasks_file(&path).await.unwrap();
        assert_eq!(
            urls,
            vec![
                "https://video.example.com/watch?v=1".to_string(),
                "https://video.example.com/watch?v=2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn missing_tasks_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_tasks_file(&dir.path().join("absent.txt")).await.is_err());
    }
}
