use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::warn;
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{TaskEvent, TaskId, TaskSnapshot, TaskStatus};

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";
const DONE_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}";
const NAME_WIDTH: usize = 50;

/// Draws one bar per running task plus a summary header.
pub struct ConsoleReporter {
    multi_progress: MultiProgress,
    header_pb: ProgressBar,
    bars: HashMap<TaskId, ProgressBar>,
    bytes: HashMap<TaskId, u64>,
    seen: usize,
    finished: usize,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        let multi_progress = MultiProgress::new();
        multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header_pb = multi_progress.add(ProgressBar::new(0));
        header_pb.set_style(style("{msg}"));

        let reporter = Self {
            multi_progress,
            header_pb,
            bars: HashMap::new(),
            bytes: HashMap::new(),
            seen: 0,
            finished: 0,
        };
        reporter.refresh_header();
        reporter
    }

    /// Consumes events until `done` fires, then drains whatever is left.
    pub async fn run(mut self, mut events: broadcast::Receiver<TaskEvent>, done: CancellationToken) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle(&event),
                    Err(RecvError::Lagged(skipped)) => warn!("Progress display skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = done.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        self.handle(&event);
                    }
                    break;
                }
            }
        }
        self.header_pb.finish();
    }

    pub fn handle(&mut self, event: &TaskEvent) {
        let task = event.snapshot();
        if !self.bytes.contains_key(&task.id) {
            self.seen += 1;
        }
        self.bytes.insert(task.id, task.downloaded_bytes);

        match event {
            TaskEvent::Queued(_) => {}
            TaskEvent::Started(_) | TaskEvent::Progress(_) => {
                let pb = self.bar(task);
                if let Some(total) = task.total_bytes {
                    pb.set_length(total);
                }
                pb.set_position(task.downloaded_bytes);
            }
            TaskEvent::Finished(_) => {
                let pb = self.bar(task).clone();
                self.bars.remove(&task.id);
                pb.set_style(style(DONE_TEMPLATE));
                pb.finish_with_message(format!(
                    "{:>25} {:<10} {}",
                    HumanBytes(task.downloaded_bytes).to_string(),
                    task.status,
                    finished_label(task)
                ));
                if task.status.is_terminal() {
                    self.finished += 1;
                }
            }
        }
        self.refresh_header();
    }

    fn bar(&mut self, task: &TaskSnapshot) -> &ProgressBar {
        let multi_progress = &self.multi_progress;
        self.bars.entry(task.id).or_insert_with(|| {
            let pb = multi_progress.add(ProgressBar::new(task.total_bytes.unwrap_or(0)));
            pb.set_style(style(BAR_TEMPLATE).progress_chars("#>-"));
            pb.set_message(display_name(task));
            pb
        })
    }

    fn refresh_header(&self) {
        let total: u64 = self.bytes.values().sum();
        self.header_pb.set_message(format!(
            "Summary: Files: {}/{} | Downloaded: {}",
            self.finished,
            self.seen,
            HumanBytes(total)
        ));
        self.header_pb.tick();
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let head: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", head)
}

fn display_name(task: &TaskSnapshot) -> String {
    let name = task
        .output_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| task.request.url.clone());
    truncate(&name, NAME_WIDTH)
}

fn finished_label(task: &TaskSnapshot) -> String {
    match (&task.status, &task.error) {
        (TaskStatus::Failed, Some(error)) => format!("{} ({})", display_name(task), error),
        _ => display_name(task),
    }
}

fn progress_label(task: &TaskSnapshot) -> String {
    match task.percent {
        Some(percent) => format!("{:.2}%", percent),
        None if task.downloaded_bytes > 0 => HumanBytes(task.downloaded_bytes).to_string(),
        None => "-".to_string(),
    }
}

/// Prints tasks as a table.
pub fn print_tasks(tasks: &[TaskSnapshot]) {
    println!("{:<50} {:<15} {:<15} {:<15}", "Task", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");
    for task in tasks {
        let size = task
            .total_bytes
            .map(|t| HumanBytes(t).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            display_name(task),
            task.status,
            progress_label(task),
            size
        );
        println!("  id: {}", task.id);
        if let Some(error) = &task.error {
            println!("  error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DownloadRequest;

    fn snapshot(status: TaskStatus, downloaded: u64, total: Option<u64>) -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(),
            request: DownloadRequest::new("https://video.example.com/watch?v=abc", "/tmp"),
            status,
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent: total.map(|t| downloaded as f64 / t as f64 * 100.0),
            error: None,
            output_path: None,
            resumable: false,
        }
    }

    #[test]
    fn long_names_are_truncated() {
        let name = "x".repeat(80);
        let truncated = truncate(&name, NAME_WIDTH);
        assert_eq!(truncated.chars().count(), NAME_WIDTH);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate("short", NAME_WIDTH), "short");
    }

    #[test]
    fn progress_label_prefers_percent() {
        assert_eq!(progress_label(&snapshot(TaskStatus::Running, 50, Some(200))), "25.00%");
        assert_eq!(progress_label(&snapshot(TaskStatus::Paused, 0, None)), "-");
    }

    #[test]
    fn reporter_counts_finished_tasks() {
        let mut reporter = ConsoleReporter::new();
        reporter.multi_progress.set_draw_target(ProgressDrawTarget::hidden());

        let mut task = snapshot(TaskStatus::Running, 10, Some(100));
        reporter.handle(&TaskEvent::Started(task.clone()));
        assert_eq!(reporter.bars.len(), 1);

        task.status = TaskStatus::Completed;
        task.downloaded_bytes = 100;
        reporter.handle(&TaskEvent::Finished(task));
        assert!(reporter.bars.is_empty());
        assert_eq!((reporter.finished, reporter.seen), (1, 1));
    }
}
