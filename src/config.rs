use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// User settings persisted as JSON. Fields map one-to-one onto the recognized keys.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub max_workers: usize,
    pub proxy: String,
    pub cookies: String,
    pub default_format: String,
    pub merge_format: String,
    pub audio_quality: String,
    pub retry_count: u32,
    pub socket_timeout: u32,
    pub rate_limit: String,
    pub sleep_interval: u32,
    pub download_thumbnails: bool,
    pub download_subtitles: bool,
    pub subtitle_languages: Vec<String>,
    pub check_for_updates: bool,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub upgrade_command: Vec<String>,
    pub state_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,

    #[serde(flatten, skip_serializing)]
    unknown: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: dirs::download_dir()
                .map(|d| d.join("vdl"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            max_workers: DEFAULT_MAX_WORKERS,
            proxy: String::new(),
            cookies: String::new(),
            default_format: "best".to_string(),
            merge_format: "mp4".to_string(),
            audio_quality: "192".to_string(),
            retry_count: 10,
            socket_timeout: 30,
            rate_limit: String::new(),
            sleep_interval: 3,
            download_thumbnails: false,
            download_subtitles: false,
            subtitle_languages: vec!["en".to_string()],
            check_for_updates: true,
            ytdlp_path: None,
            ffmpeg_path: None,
            upgrade_command: vec!["yt-dlp".to_string(), "-U".to_string()],
            state_file: None,
            log_file: None,
            unknown: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not find a config directory".to_string()))?;
        Ok(config_dir.join("vdl").join("config.json"))
    }

    fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("vdl"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Loads settings from `path`, writing defaults there first if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Settings::default();
            settings.save(path)?;
            info!("Created default configuration at {:?}", path);
            return Ok(settings);
        }

        let content = std::fs::read_to_string(path)?;
        let mut settings: Settings = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{:?}: {}", path, e)))?;
        for key in std::mem::take(&mut settings.unknown).keys() {
            warn!("Ignoring unknown configuration key '{}' in {:?}", key, path);
        }
        settings.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be a positive integer".to_string()));
        }
        if self.default_format.trim().is_empty() {
            return Err(Error::Config("default_format must not be empty".to_string()));
        }
        if !self.proxy.is_empty() {
            url::Url::parse(&self.proxy)
                .map_err(|e| Error::Config(format!("proxy '{}' is not a URL: {}", self.proxy, e)))?;
        }
        if self.upgrade_command.is_empty() {
            return Err(Error::Config("upgrade_command must name a program".to_string()));
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("state.json"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("vdl.log"))
    }

    /// The subset of settings a task carries from submission to completion.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            proxy: non_empty(&self.proxy),
            cookies: non_empty(&self.cookies).map(PathBuf::from),
            merge_format: self.merge_format.clone(),
            audio_quality: self.audio_quality.clone(),
            retry_count: self.retry_count,
            socket_timeout: self.socket_timeout,
            rate_limit: non_empty(&self.rate_limit),
            sleep_interval: self.sleep_interval,
            subtitle_languages: self.subtitle_languages.clone(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Pass-through options handed to the extraction backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub proxy: Option<String>,
    pub cookies: Option<PathBuf>,
    pub merge_format: String,
    pub audio_quality: String,
    pub retry_count: u32,
    pub socket_timeout: u32,
    pub rate_limit: Option<String>,
    /// Seconds yt-dlp waits before each download; 0 disables the pause.
    pub sleep_interval: u32,
    pub subtitle_languages: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Settings::default().fetch_options()
    }
}
