use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;

use crate::errors::{Error, Result};
use crate::utils::clean_ansi;
use crate::ytdlp::{run_output_with_timeout, YtDlp};

pub const LATEST_RELEASE_URL: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";
const UPGRADE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReport {
    /// `None` when the installed version could not be determined.
    pub current: Option<String>,
    pub latest: String,
    pub needs_update: bool,
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

pub struct Updater {
    client: Client,
    upgrade_command: Vec<String>,
}

impl Updater {
    pub fn new(upgrade_command: Vec<String>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("vdl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            upgrade_command,
        }
    }

    pub async fn latest_version(&self) -> Result<String> {
        let release: Release = self
            .client
            .get(LATEST_RELEASE_URL)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(release.tag_name.trim().trim_start_matches('v').to_string())
    }

    pub async fn check(&self, ytdlp: &YtDlp) -> Result<VersionReport> {
        let current = match ytdlp.version().await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("Could not determine installed yt-dlp version: {}", e);
                None
            }
        };
        let latest = self.latest_version().await?;
        let needs_update = needs_update(current.as_deref(), &latest);
        info!(
            "yt-dlp version check: installed {}, latest {}",
            current.as_deref().unwrap_or("unknown"),
            latest
        );
        Ok(VersionReport {
            current,
            latest,
            needs_update,
        })
    }

    /// Runs the configured upgrade command and returns its output.
    pub async fn upgrade(&self) -> Result<String> {
        let (program, args) = self
            .upgrade_command
            .split_first()
            .ok_or_else(|| Error::UpdateFailed("no upgrade command configured".to_string()))?;
        info!("Upgrading yt-dlp: {}", self.upgrade_command.join(" "));

        let output = run_output_with_timeout(&PathBuf::from(program), args, UPGRADE_TIMEOUT_SECS)
            .await
            .map_err(|e| {
                Error::UpdateFailed(format!("could not run '{}': {}", self.upgrade_command.join(" "), e))
            })?;
        let stdout = clean_ansi(&String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            let stderr = clean_ansi(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::UpdateFailed(format!(
                "'{}' exited with {}: {}",
                self.upgrade_command.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(stdout.trim().to_string())
    }
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split(|c| c == '.' || c == '-')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compares release versions component by component. Missing components count as zero.
pub fn needs_update(current: Option<&str>, latest: &str) -> bool {
    let Some(current) = current else { return true };
    let mut current = version_key(current);
    let mut latest = version_key(latest);
    let len = current.len().max(latest.len());
    current.resize(len, 0);
    latest.resize(len, 0);
    latest > current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_release_needs_update() {
        assert!(needs_update(Some("2024.08.06"), "2024.10.22"));
        assert!(needs_update(Some("2023.12.30"), "v2024.01.01"));
    }

    #[test]
    fn same_or_older_release_is_current() {
        assert!(!needs_update(Some("2024.08.06"), "2024.08.06"));
        assert!(!needs_update(Some("2024.10.22"), "2024.08.06"));
        assert!(!needs_update(Some("2024.08.06.1"), "2024.08.06"));
    }

    #[test]
    fn components_compare_numerically() {
        assert!(needs_update(Some("2024.8.6"), "2024.10.1"));
        assert!(needs_update(Some("2024.08.06"), "2024.08.06.232908"));
    }

    #[test]
    fn unknown_current_needs_update() {
        assert!(needs_update(None, "2024.08.06"));
    }

    #[tokio::test]
    async fn empty_upgrade_command_fails() {
        let updater = Updater::new(vec![]);
        assert!(matches!(updater.upgrade().await, Err(Error::UpdateFailed(_))));
    }

    #[tokio::test]
    async fn missing_upgrade_program_is_an_update_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = dir.path().join("no-such-updater");
        let updater = Updater::new(vec![program.to_string_lossy().into_owned(), "-U".to_string()]);
        match updater.upgrade().await {
            Err(Error::UpdateFailed(msg)) => assert!(msg.contains("no-such-updater")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_upgrade_is_reported() {
        let updater = Updater::new(vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 3".to_string()]);
        match updater.upgrade().await {
            Err(Error::UpdateFailed(msg)) => assert!(msg.contains("nope")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_upgrade_returns_output() {
        let updater = Updater::new(vec!["sh".to_string(), "-c".to_string(), "echo Updated yt-dlp".to_string()]);
        assert_eq!(updater.upgrade().await.unwrap(), "Updated yt-dlp");
    }
}
