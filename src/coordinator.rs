use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{FetchOptions, Settings};
use crate::errors::{Error, Result};
use crate::extractor::{FetchJob, FetchOutcome, FetchProgress, MediaBackend, ResumeMarker};
use crate::format::{ChosenFormat, FormatSelector};
use crate::state::{RecordedStatus, ResumableStateEntry, StateStore};
use crate::utils::{ensure_writable_dir, sanitize_filename, validate_url};

const EVENT_BUFFER: usize = 256;
/// Longest a running task goes without its progress reaching the state file.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub format_selector: String,
    #[serde(default)]
    pub want_thumbnail: bool,
    #[serde(default)]
    pub want_subtitles: bool,
    /// 1-based position inside the playlist this request was expanded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_index: Option<u32>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            format_selector: "best".to_string(),
            want_thumbnail: false,
            want_subtitles: false,
            playlist_index: None,
        }
    }

    fn same_target(&self, other: &DownloadRequest) -> bool {
        self.url == other.url
            && self.destination == other.destination
            && self.format_selector.trim().eq_ignore_ascii_case(other.format_selector.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancel,
    Pause,
    Interrupt,
}

/// Point-in-time copy of a task, safe to hand to presenters.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub request: DownloadRequest,
    pub status: TaskStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub resumable: bool,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Queued(TaskSnapshot),
    Started(TaskSnapshot),
    Progress(TaskSnapshot),
    Finished(TaskSnapshot),
}

impl TaskEvent {
    pub fn snapshot(&self) -> &TaskSnapshot {
        match self {
            Self::Queued(s) | Self::Started(s) | Self::Progress(s) | Self::Finished(s) => s,
        }
    }
}

#[derive(Debug)]
pub struct Rejection {
    pub index: usize,
    pub url: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct Submission {
    pub task_ids: Vec<TaskId>,
    pub rejected: Vec<Rejection>,
}

/// Outcome counts for the tasks a single `run` executed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
}

impl RunSummary {
    fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Queued | TaskStatus::Running => {}
        }
    }
}

struct DownloadTask {
    id: TaskId,
    request: DownloadRequest,
    options: FetchOptions,
    status: TaskStatus,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    error: Option<String>,
    transient_failure: bool,
    resume_marker: Option<ResumeMarker>,
    resolved_format: Option<ChosenFormat>,
    output_path: Option<PathBuf>,
    stop: Option<StopReason>,
    token: CancellationToken,
}

impl DownloadTask {
    fn new(request: DownloadRequest, options: FetchOptions) -> Self {
        Self {
            id: TaskId::new(),
            request,
            options,
            status: TaskStatus::Queued,
            downloaded_bytes: 0,
            total_bytes: None,
            error: None,
            transient_failure: false,
            resume_marker: None,
            resolved_format: None,
            output_path: None,
            stop: None,
            token: CancellationToken::new(),
        }
    }

    fn from_entry(entry: ResumableStateEntry, options: FetchOptions) -> Self {
        let failed = entry.status == RecordedStatus::Failed;
        Self {
            id: entry.task_id,
            request: entry.request,
            options,
            status: if failed { TaskStatus::Failed } else { TaskStatus::Paused },
            downloaded_bytes: entry.downloaded_bytes,
            total_bytes: entry.total_bytes,
            error: entry.error,
            transient_failure: failed,
            resume_marker: entry.resume_marker,
            resolved_format: entry.resolved_format,
            output_path: None,
            stop: None,
            token: CancellationToken::new(),
        }
    }

    /// Puts a stopped task back in line. Keeps its marker only if the partial file survived.
    fn requeue(&mut self) {
        let continues = self
            .resume_marker
            .as_ref()
            .map_or(false, |m| m.partial_path.exists());
        if !continues {
            self.discard_progress();
        }
        self.status = TaskStatus::Queued;
        self.error = None;
        self.transient_failure = false;
    }

    fn discard_progress(&mut self) {
        self.resume_marker = None;
        self.resolved_format = None;
        self.downloaded_bytes = 0;
        self.total_bytes = None;
    }

    fn can_resume(&self) -> bool {
        match self.status {
            TaskStatus::Paused => true,
            TaskStatus::Failed => self.transient_failure,
            _ => false,
        }
    }

    fn percent(&self) -> Option<f64> {
        if self.status == TaskStatus::Completed {
            return Some(100.0);
        }
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            request: self.request.clone(),
            status: self.status,
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            percent: self.percent(),
            error: self.error.clone(),
            output_path: self.output_path.clone(),
            resumable: self.can_resume() && self.resume_marker.is_some(),
        }
    }

    fn to_entry(&self) -> Option<ResumableStateEntry> {
        let status = match self.status {
            TaskStatus::Queued => RecordedStatus::Queued,
            TaskStatus::Running => RecordedStatus::Running,
            TaskStatus::Paused => RecordedStatus::Paused,
            TaskStatus::Failed if self.transient_failure => RecordedStatus::Failed,
            _ => return None,
        };
        Some(ResumableStateEntry {
            task_id: self.id,
            request: self.request.clone(),
            resolved_format: self.resolved_format.clone(),
            resume_marker: self.resume_marker.clone(),
            status,
            error: self.error.clone(),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            saved_at: Utc::now(),
        })
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, DownloadTask>,
    order: Vec<TaskId>,
    queue: VecDeque<TaskId>,
}

impl Registry {
    fn insert(&mut self, task: DownloadTask) {
        let id = task.id;
        if task.status == TaskStatus::Queued {
            self.queue.push_back(id);
        }
        self.order.push(id);
        self.tasks.insert(id, task);
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut DownloadTask> {
        self.tasks.get_mut(&id).ok_or(Error::NotFound(id))
    }

    /// A task the request can join: one still in flight, paused, or failed but resumable.
    fn find_mergeable(&self, request: &DownloadRequest) -> Option<TaskId> {
        self.order.iter().copied().find(|id| {
            self.tasks.get(id).map_or(false, |t| {
                (!t.status.is_terminal() || t.can_resume()) && t.request.same_target(request)
            })
        })
    }

    fn entries(&self) -> Vec<ResumableStateEntry> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter_map(DownloadTask::to_entry)
            .collect()
    }
}

struct Claim {
    id: TaskId,
    request: DownloadRequest,
    options: FetchOptions,
    resolved_format: Option<ChosenFormat>,
    resume: Option<ResumeMarker>,
    token: CancellationToken,
    snapshot: TaskSnapshot,
}

struct Inner {
    backend: Arc<dyn MediaBackend>,
    store: Arc<StateStore>,
    registry: Mutex<Registry>,
    settings: Mutex<Settings>,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<TaskEvent>,
    persist_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    wakeup: Notify,
}

/// Runs download tasks on a bounded pool of workers and keeps their state on disk.
///
/// Cloning is cheap; every clone drives the same registry.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Builds a coordinator and registers every entry found in the state store.
    /// Stored tasks come back Paused (or Failed, for resumable failures); none are started.
    pub async fn open(
        backend: Arc<dyn MediaBackend>,
        store: Arc<StateStore>,
        settings: Settings,
    ) -> Result<Self> {
        settings.validate()?;
        let entries = store.load().await?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut registry = Registry::default();
        let options = settings.fetch_options();
        for entry in entries {
            if registry.tasks.contains_key(&entry.task_id) {
                warn!("Skipping duplicate state entry for task {}", entry.task_id);
                continue;
            }
            registry.insert(DownloadTask::from_entry(entry, options.clone()));
        }
        if !registry.order.is_empty() {
            info!("Restored {} pending downloads from {:?}", registry.order.len(), store.path());
        }

        info!(
            "Coordinator ready: backend={}, max_workers={}",
            backend.name(),
            settings.max_workers
        );
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                store,
                registry: Mutex::new(registry),
                slots: Arc::new(Semaphore::new(settings.max_workers)),
                settings: Mutex::new(settings),
                events,
                persist_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                wakeup: Notify::new(),
            }),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.inner.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// New settings apply to tasks submitted afterwards. The worker count is fixed at `open`.
    pub fn update_settings(&self, settings: Settings) {
        *self.settings() = settings;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn submit(&self, requests: Vec<DownloadRequest>) -> Submission {
        let mut submission = Submission::default();
        for (index, request) in requests.into_iter().enumerate() {
            let url = request.url.clone();
            match self.submit_one(request) {
                Ok(id) => submission.task_ids.push(id),
                Err(error) => {
                    warn!("Rejected request #{} ({}): {}", index, url, error);
                    submission.rejected.push(Rejection { index, url, error });
                }
            }
        }
        submission
    }

    /// Validates and queues one request. A request matching a tracked unfinished task returns
    /// that task's id; a paused or resumable failed match is queued again.
    pub fn submit_one(&self, mut request: DownloadRequest) -> Result<TaskId> {
        request.url = request.url.trim().to_string();
        validate_request(&request)?;
        let options = self.settings().fetch_options();

        let (id, snapshot) = {
            let mut reg = self.registry();
            match reg.find_mergeable(&request) {
                Some(existing) => {
                    let task = reg.get_mut(existing)?;
                    if !matches!(task.status, TaskStatus::Paused | TaskStatus::Failed) {
                        info!("Merged duplicate request for {} into task {}", request.url, existing);
                        return Ok(existing);
                    }
                    task.requeue();
                    let snapshot = task.snapshot();
                    reg.queue.push_back(existing);
                    info!("Merged request for {} into stopped task {}, queued again", request.url, existing);
                    (existing, snapshot)
                }
                None => {
                    let task = DownloadTask::new(request, options);
                    let out = (task.id, task.snapshot());
                    reg.insert(task);
                    info!("Queued task {} for {}", out.0, out.1.request.url);
                    out
                }
            }
        };
        self.inner.wakeup.notify_one();
        self.publish(TaskEvent::Queued(snapshot));
        Ok(id)
    }

    /// Turns a playlist request into one request per member, in playlist order.
    /// Members go to a sub-directory named after the playlist.
    pub async fn expand(&self, request: DownloadRequest) -> Result<Vec<DownloadRequest>> {
        if request.url.trim().is_empty() {
            return Err(Error::InvalidRequest("URL is empty".to_string()));
        }
        let options = self.settings().fetch_options();
        let resolution = self.inner.backend.resolve(request.url.trim(), &options).await?;
        if !resolution.is_playlist {
            return Ok(vec![request]);
        }
        if resolution.member_urls.is_empty() {
            return Err(Error::Extraction(format!("playlist {} has no entries", request.url)));
        }

        let destination = request.destination.join(sanitize_filename(&resolution.title));
        info!(
            "Expanded playlist '{}' into {} downloads",
            resolution.title,
            resolution.member_urls.len()
        );
        Ok(resolution
            .member_urls
            .into_iter()
            .zip(1u32..)
            .map(|(url, index)| DownloadRequest {
                url,
                destination: destination.clone(),
                playlist_index: Some(index),
                ..request.clone()
            })
            .collect())
    }

    pub fn progress(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.registry()
            .tasks
            .get(&id)
            .map(DownloadTask::snapshot)
            .ok_or(Error::NotFound(id))
    }

    /// Every tracked task in submission order.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let reg = self.registry();
        reg.order
            .iter()
            .filter_map(|id| reg.tasks.get(id))
            .map(DownloadTask::snapshot)
            .collect()
    }

    /// Stops a task. Queued tasks never start; running ones stop at the next checkpoint.
    /// Partial files are left where they are.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let stopped_now = {
            let mut reg = self.registry();
            let task = reg.get_mut(id)?;
            match task.status {
                TaskStatus::Queued | TaskStatus::Paused | TaskStatus::Failed => {
                    task.status = TaskStatus::Cancelled;
                    let snapshot = task.snapshot();
                    reg.queue.retain(|queued| *queued != id);
                    Some(snapshot)
                }
                TaskStatus::Running => {
                    task.stop = Some(StopReason::Cancel);
                    task.token.cancel();
                    None
                }
                TaskStatus::Completed | TaskStatus::Cancelled => None,
            }
        };

        if let Some(snapshot) = stopped_now {
            info!("Cancelled task {}", id);
            self.forget(id).await;
            self.publish(TaskEvent::Finished(snapshot));
        } else {
            debug!("Cancellation requested for task {}", id);
        }
        Ok(())
    }

    pub async fn pause(&self, id: TaskId) -> Result<()> {
        let paused_now = {
            let mut reg = self.registry();
            let task = reg.get_mut(id)?;
            match task.status {
                TaskStatus::Queued => {
                    task.status = TaskStatus::Paused;
                    let snapshot = task.snapshot();
                    reg.queue.retain(|queued| *queued != id);
                    Some(snapshot)
                }
                TaskStatus::Running => {
                    task.stop = Some(StopReason::Pause);
                    task.token.cancel();
                    None
                }
                _ => None,
            }
        };

        if let Some(snapshot) = paused_now {
            info!("Paused task {}", id);
            self.persist().await;
            self.publish(TaskEvent::Finished(snapshot));
        }
        Ok(())
    }

    /// Re-queues a paused or transiently failed task, continuing from its resume marker.
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut reg = self.registry();
            let task = reg.get_mut(id)?;
            if !task.can_resume() {
                return Err(Error::NotResumable(id, format!("task is {}", task.status)));
            }
            let marker = task
                .resume_marker
                .as_ref()
                .ok_or_else(|| Error::NotResumable(id, "no resume marker was recorded".to_string()))?;
            if !marker.partial_path.exists() {
                return Err(Error::NotResumable(
                    id,
                    format!("partial file {:?} is missing", marker.partial_path),
                ));
            }
            task.status = TaskStatus::Queued;
            task.error = None;
            task.transient_failure = false;
            let snapshot = task.snapshot();
            reg.queue.push_back(id);
            snapshot
        };
        self.inner.wakeup.notify_one();

        info!("Resuming task {} from {} bytes", id, snapshot.downloaded_bytes);
        self.persist().await;
        self.publish(TaskEvent::Queued(snapshot));
        Ok(())
    }

    /// Re-queues a stopped task from scratch, dropping any partial progress marker.
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut reg = self.registry();
            let task = reg.get_mut(id)?;
            if !matches!(
                task.status,
                TaskStatus::Paused | TaskStatus::Failed | TaskStatus::Cancelled
            ) {
                return Err(Error::InvalidRequest(format!("task {} is {}", id, task.status)));
            }
            task.status = TaskStatus::Queued;
            task.error = None;
            task.transient_failure = false;
            task.discard_progress();
            let snapshot = task.snapshot();
            reg.queue.push_back(id);
            snapshot
        };
        self.inner.wakeup.notify_one();

        info!("Retrying task {} from the start", id);
        self.persist().await;
        self.publish(TaskEvent::Queued(snapshot));
        Ok(())
    }

    /// Drops a finished task from tracking.
    pub fn acknowledge(&self, id: TaskId) -> Result<()> {
        let mut reg = self.registry();
        let status = reg.get_mut(id)?.status;
        if !status.is_terminal() {
            return Err(Error::InvalidRequest(format!("task {} is still {}", id, status)));
        }
        reg.tasks.remove(&id);
        reg.order.retain(|known| *known != id);
        Ok(())
    }

    /// Interrupts every running task; they end Paused and are written to the state file.
    /// A concurrent `run` stops claiming work and returns once the workers have stopped.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let interrupted = {
            let mut reg = self.registry();
            let mut count = 0;
            for task in reg.tasks.values_mut() {
                if task.status == TaskStatus::Running {
                    task.stop = Some(StopReason::Interrupt);
                    task.token.cancel();
                    count += 1;
                }
            }
            count
        };
        info!("Shutting down, interrupting {} running downloads", interrupted);
        self.persist().await;
    }

    /// Drains the queue with at most `max_workers` tasks running at once.
    pub async fn run(&self) -> RunSummary {
        self.persist().await;
        let mut workers: JoinSet<(TaskId, TaskStatus)> = JoinSet::new();
        let mut summary = RunSummary::default();

        loop {
            let permit = match self.inner.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let claim = if self.inner.shutdown.is_cancelled() {
                None
            } else {
                self.claim_next()
            };

            match claim {
                Some(claim) => {
                    let this = self.clone();
                    workers.spawn(async move { this.supervise(claim, permit).await });
                }
                None => {
                    drop(permit);
                    if workers.is_empty() {
                        break;
                    }
                    // Work queued while every claim is taken must not wait for a worker to end.
                    tokio::select! {
                        joined = workers.join_next() => match joined {
                            Some(Ok((id, status))) => {
                                debug!("Worker for task {} ended {}", id, status);
                                summary.record(status);
                            }
                            Some(Err(e)) => error!("Worker join failed: {}", e),
                            None => break,
                        },
                        _ = self.inner.wakeup.notified() => {}
                    }
                }
            }
        }

        info!(
            "Run finished: {} completed, {} failed, {} cancelled, {} paused",
            summary.completed, summary.failed, summary.cancelled, summary.paused
        );
        summary
    }

    fn claim_next(&self) -> Option<Claim> {
        let claim = {
            let mut reg = self.registry();
            let mut claim = None;
            while let Some(id) = reg.queue.pop_front() {
                let Some(task) = reg.tasks.get_mut(&id) else { continue };
                if task.status != TaskStatus::Queued {
                    continue;
                }
                task.status = TaskStatus::Running;
                task.stop = None;
                task.token = CancellationToken::new();
                claim = Some(Claim {
                    id,
                    request: task.request.clone(),
                    options: task.options.clone(),
                    resolved_format: task.resolved_format.clone(),
                    resume: task.resume_marker.clone(),
                    token: task.token.clone(),
                    snapshot: task.snapshot(),
                });
                break;
            }
            claim
        };
        if let Some(claim) = &claim {
            self.publish(TaskEvent::Started(claim.snapshot.clone()));
        }
        claim
    }

    /// Runs the worker on its own task so a panic is contained and recorded as a failure.
    async fn supervise(self, claim: Claim, permit: OwnedSemaphorePermit) -> (TaskId, TaskStatus) {
        let id = claim.id;
        let worker = tokio::spawn(self.clone().work(claim, permit));
        match worker.await {
            Ok(status) => (id, status),
            Err(e) => {
                error!("Worker for task {} crashed: {}", id, e);
                let status = self
                    .finish_failed(id, Error::Extraction(format!("worker crashed: {}", e)))
                    .await;
                (id, status)
            }
        }
    }

    async fn work(self, claim: Claim, _permit: OwnedSemaphorePermit) -> TaskStatus {
        let Claim {
            id,
            request,
            options,
            resolved_format,
            resume,
            token,
            ..
        } = claim;
        info!("Starting task {} ({})", id, request.url);
        self.persist().await;

        let format = match resolved_format {
            Some(format) => format,
            None => {
                let chosen = tokio::select! {
                    _ = token.cancelled() => return self.finish_stopped(id).await,
                    chosen = self.choose_format(&request, &options) => chosen,
                };
                match chosen {
                    Ok(format) => {
                        if let Ok(task) = self.registry().get_mut(id) {
                            task.resolved_format = Some(format.clone());
                        }
                        format
                    }
                    Err(e) => return self.finish_failed(id, e).await,
                }
            }
        };
        debug!("Task {} uses format {}", id, format.spec);

        let job = FetchJob {
            url: request.url.clone(),
            destination: request.destination.clone(),
            format,
            want_thumbnail: request.want_thumbnail,
            want_subtitles: request.want_subtitles,
            playlist_index: request.playlist_index,
            resume,
            options,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetch = self.inner.backend.fetch(job, tx);

        let mut last_saved = Instant::now();
        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break None,
                Some(progress) = rx.recv() => {
                    let marker_moved = self.record_progress(id, progress);
                    if checkpoint_due(marker_moved, last_saved.elapsed()) {
                        self.persist().await;
                        last_saved = Instant::now();
                    }
                    if token.is_cancelled() {
                        break None;
                    }
                }
                result = &mut fetch => break Some(result),
            }
        };
        // Dropping the fetch stops the backend's transfer.
        drop(fetch);
        while let Ok(progress) = rx.try_recv() {
            self.record_progress(id, progress);
        }

        match result {
            None => self.finish_stopped(id).await,
            Some(Ok(outcome)) => self.finish_completed(id, outcome).await,
            Some(Err(e)) => self.finish_failed(id, e).await,
        }
    }

    async fn choose_format(
        &self,
        request: &DownloadRequest,
        options: &FetchOptions,
    ) -> Result<ChosenFormat> {
        let selector: FormatSelector = request.format_selector.parse()?;
        let resolution = self.inner.backend.resolve(&request.url, options).await?;
        if resolution.is_playlist {
            return Err(Error::Extraction(format!(
                "{} is a playlist; expand it before submitting",
                request.url
            )));
        }
        selector.choose(&resolution.available_formats)
    }

    /// Applies a progress report. Returns true when the marker now points at a different partial file.
    fn record_progress(&self, id: TaskId, progress: FetchProgress) -> bool {
        let (snapshot, marker_moved) = {
            let mut reg = self.registry();
            let Ok(task) = reg.get_mut(id) else { return false };
            task.downloaded_bytes = progress.downloaded_bytes;
            if progress.total_bytes.is_some() {
                task.total_bytes = progress.total_bytes;
            }
            let mut marker_moved = false;
            if let Some(marker) = progress.marker {
                marker_moved = task
                    .resume_marker
                    .as_ref()
                    .map_or(true, |current| current.partial_path != marker.partial_path);
                task.resume_marker = Some(marker);
            }
            (task.snapshot(), marker_moved)
        };
        self.publish(TaskEvent::Progress(snapshot));
        marker_moved
    }

    async fn finish_stopped(&self, id: TaskId) -> TaskStatus {
        let snapshot = {
            let mut reg = self.registry();
            let Ok(task) = reg.get_mut(id) else { return TaskStatus::Cancelled };
            task.status = match task.stop.take().unwrap_or(StopReason::Interrupt) {
                StopReason::Cancel => TaskStatus::Cancelled,
                StopReason::Pause | StopReason::Interrupt => TaskStatus::Paused,
            };
            task.snapshot()
        };

        if snapshot.status == TaskStatus::Cancelled {
            info!("Task {} cancelled at {} bytes", id, snapshot.downloaded_bytes);
            self.forget(id).await;
        } else {
            info!("Task {} paused at {} bytes", id, snapshot.downloaded_bytes);
            self.persist().await;
        }
        let status = snapshot.status;
        self.publish(TaskEvent::Finished(snapshot));
        status
    }

    async fn finish_completed(&self, id: TaskId, outcome: FetchOutcome) -> TaskStatus {
        let snapshot = {
            let mut reg = self.registry();
            let Ok(task) = reg.get_mut(id) else { return TaskStatus::Completed };
            task.status = TaskStatus::Completed;
            task.output_path = outcome.output_path;
            task.resume_marker = None;
            if let Some(total) = task.total_bytes {
                task.downloaded_bytes = task.downloaded_bytes.max(total);
            }
            task.snapshot()
        };
        info!("Task {} completed: {}", id, snapshot.request.url);
        self.forget(id).await;
        self.publish(TaskEvent::Finished(snapshot));
        TaskStatus::Completed
    }

    async fn finish_failed(&self, id: TaskId, error: Error) -> TaskStatus {
        let snapshot = {
            let mut reg = self.registry();
            let Ok(task) = reg.get_mut(id) else { return TaskStatus::Failed };
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.transient_failure = error.is_transient()
                && task
                    .resume_marker
                    .as_ref()
                    .map_or(false, |m| m.partial_path.exists());
            task.snapshot()
        };
        error!("Task {} failed: {}", id, error);
        self.persist().await;
        self.publish(TaskEvent::Finished(snapshot));
        TaskStatus::Failed
    }

    /// Writes every unfinished task to the state file. Serialized so snapshots land in order.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let entries = self.registry().entries();
        if let Err(e) = self.inner.store.save(&entries).await {
            warn!("Failed to save download state to {:?}: {}", self.inner.store.path(), e);
        }
    }

    async fn forget(&self, id: TaskId) {
        let _guard = self.inner.persist_lock.lock().await;
        if let Err(e) = self.inner.store.clear(id).await {
            warn!("Failed to clear saved state for task {}: {}", id, e);
        }
    }
}

/// Progress is written out when the partial file changes, and otherwise at most once per interval.
/// Stop and finish paths always write.
fn checkpoint_due(marker_moved: bool, since_last_save: Duration) -> bool {
    marker_moved || since_last_save >= CHECKPOINT_INTERVAL
}

fn validate_request(request: &DownloadRequest) -> Result<()> {
    if request.url.is_empty() {
        return Err(Error::InvalidRequest("URL is empty".to_string()));
    }
    validate_url(&request.url).map_err(Error::InvalidRequest)?;
    request.format_selector.parse::<FormatSelector>()?;
    ensure_writable_dir(&request.destination).map_err(|e| {
        Error::InvalidRequest(format!(
            "destination {:?} is not writable: {}",
            request.destination, e
        ))
    })?;
    Ok(())
}
