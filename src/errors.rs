use std::path::PathBuf;

use thiserror::Error;

use crate::coordinator::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Task {0} cannot be resumed: {1}")]
    NotResumable(TaskId, String),

    #[error("Unknown task: {0}")]
    NotFound(TaskId),

    #[error("Update failed: {0}")]
    UpdateFailed(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State file {path:?} is corrupt ({reason}); it was left untouched")]
    CorruptState { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Network failures can continue from a partial file; everything else restarts.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
