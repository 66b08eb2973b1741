use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::coordinator::{DownloadRequest, TaskId};
use crate::errors::{Error, Result};
use crate::extractor::ResumeMarker;
use crate::format::ChosenFormat;

const STATE_VERSION: u32 = 1;

/// Status a task had when it was written out.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordedStatus {
    Queued,
    Running,
    Paused,
    Failed,
}

/// Durable projection of a task that has not finished.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResumableStateEntry {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub request: DownloadRequest,
    pub resolved_format: Option<ChosenFormat>,
    pub resume_marker: Option<ResumeMarker>,
    pub status: RecordedStatus,
    pub error: Option<String>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StateFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<ResumableStateEntry>,
}

pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every stored entry. A missing file is empty; an unreadable one is an error and stays on disk.
    pub async fn load(&self) -> Result<Vec<ResumableStateEntry>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(vec![]);
        }

        let state: StateFile = serde_json::from_str(&content).map_err(|e| Error::CorruptState {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if state.version > STATE_VERSION {
            return Err(Error::CorruptState {
                path: self.path.clone(),
                reason: format!("written by a newer version (format {})", state.version),
            });
        }
        debug!("Loaded {} state entries from {:?}", state.entries.len(), self.path);
        Ok(state.entries)
    }

    /// Replaces the stored entries. Writes a sibling temp file and renames it over the old one.
    pub async fn save(&self, entries: &[ResumableStateEntry]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(entries).await
    }

    pub async fn clear(&self, task_id: TaskId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|e| e.task_id != task_id);
        if entries.len() != before {
            self.write(&entries).await?;
            info!("Cleared saved state for task {}", task_id);
        }
        Ok(())
    }

    async fn write(&self, entries: &[ResumableStateEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let state = StateFile {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            entries: entries.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&state)?;

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, marker: Option<ResumeMarker>) -> ResumableStateEntry {
        ResumableStateEntry {
            task_id: TaskId::new(),
            request: DownloadRequest::new(url, "/tmp/videos"),
            resolved_format: None,
            resume_marker: marker,
            status: RecordedStatus::Paused,
            error: None,
            downloaded_bytes: 10,
            total_bytes: Some(100),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        let entries = vec![
            entry(
                "https://example.com/watch?v=a",
                Some(ResumeMarker {
                    partial_path: dir.path().join("a.mp4.part"),
                    offset: 4096,
                }),
            ),
            entry("https://example.com/watch?v=b", None),
        ];

        store.save(&entries).await.expect("save");
        let reopened = StateStore::new(dir.path().join("state.json"));
        assert_eq!(reopened.load().await.expect("load"), entries);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_and_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").expect("write");

        let store = StateStore::new(path.clone());
        assert!(matches!(store.load().await, Err(Error::CorruptState { .. })));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{ not json");
    }

    #[tokio::test]
    async fn clear_removes_only_the_given_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        let keep = entry("https://example.com/watch?v=keep", None);
        let drop_me = entry("https://example.com/watch?v=drop", None);
        store.save(&[keep.clone(), drop_me.clone()]).await.expect("save");

        store.clear(drop_me.task_id).await.expect("clear");
        assert_eq!(store.load().await.expect("load"), vec![keep]);
    }
}
