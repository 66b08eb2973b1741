// Boundary to the external extraction/download tool

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::config::FetchOptions;
use crate::errors::Error;
use crate::format::ChosenFormat;

/// One downloadable stream as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub ext: String,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    pub filesize: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    /// Total or audio bitrate in kbps
    pub bitrate: Option<f32>,
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self
            .filesize
            .map(|s| indicatif::HumanBytes(s).to_string())
            .unwrap_or_else(|| "unknown size".to_string());
        if self.has_video {
            let height = self.height.map(|h| format!("{}p", h)).unwrap_or_else(|| "?".to_string());
            let fps = self.fps.map(|v| format!("{:.0}", v)).unwrap_or_else(|| "?".to_string());
            let audio = if self.has_audio { "with audio" } else { "no audio" };
            write!(f, "{}: {}, {} fps, {}, {}, {}", self.format_id, height, fps, self.ext, size, audio)
        } else {
            let bitrate = self.bitrate.unwrap_or(0.0);
            write!(f, "{}: audio {}, {:.0} kbps, {}", self.format_id, self.ext, bitrate, size)
        }
    }
}

/// Everything a URL resolves to.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub title: String,
    pub uploader: Option<String>,
    pub duration_seconds: u64,
    pub available_formats: Vec<FormatDescriptor>,
    pub is_playlist: bool,
    pub member_urls: Vec<String>,
}

/// Where an interrupted fetch left off. Produced and interpreted by the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeMarker {
    pub partial_path: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct FetchJob {
    pub url: String,
    pub destination: PathBuf,
    pub format: ChosenFormat,
    pub want_thumbnail: bool,
    pub want_subtitles: bool,
    /// Position in the source playlist; prefixed to the output file name.
    pub playlist_index: Option<u32>,
    pub resume: Option<ResumeMarker>,
    pub options: FetchOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub marker: Option<ResumeMarker>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub output_path: Option<PathBuf>,
}

/// Extraction/download backend. Implementations report failures as values, never panic,
/// and stop transferring when the `fetch` future is dropped.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    async fn resolve(&self, url: &str, options: &FetchOptions) -> Result<Resolution, Error>;

    async fn fetch(
        &self,
        job: FetchJob,
        progress: mpsc::UnboundedSender<FetchProgress>,
    ) -> Result<FetchOutcome, Error>;
}
