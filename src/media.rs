use log::debug;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};
use crate::ytdlp::run_output_with_timeout;

const PROBE_TIMEOUT_SECS: u64 = 15;

const COMMON_PATHS: &[&str] = &[
    "/opt/homebrew/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/usr/bin/ffmpeg",
];

/// The media tool yt-dlp hands merging and audio conversion to.
pub struct Ffmpeg {
    path: PathBuf,
}

impl Ffmpeg {
    /// A configured path wins. Otherwise common install locations, then `PATH`.
    pub fn locate(configured: Option<&Path>) -> Option<Self> {
        if let Some(path) = configured {
            return path.exists().then(|| Self {
                path: path.to_path_buf(),
            });
        }

        if let Some(path) = COMMON_PATHS.iter().map(Path::new).find(|p| p.exists()) {
            return Some(Self {
                path: path.to_path_buf(),
            });
        }

        let output = std::process::Command::new("which").arg("ffmpeg").output().ok()?;
        let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !found.is_empty()).then(|| Self {
            path: PathBuf::from(found),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `ffmpeg -version`. Success is decided by exit status alone.
    pub async fn probe(&self) -> Result<String> {
        let output = run_output_with_timeout(&self.path, &["-version".to_string()], PROBE_TIMEOUT_SECS).await?;
        if !output.status.success() {
            return Err(Error::ToolNotFound(format!(
                "{:?} -version exited with {}",
                self.path, output.status
            )));
        }
        let banner = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        debug!("ffmpeg probe: {}", banner);
        Ok(banner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_configured_path_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Ffmpeg::locate(Some(&dir.path().join("ffmpeg"))).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_follows_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("ffmpeg-good");
        std::fs::write(&good, "#!/bin/sh\necho 'ffmpeg version 6.1'\n").expect("write");
        std::fs::set_permissions(&good, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let bad = dir.path().join("ffmpeg-bad");
        std::fs::write(&bad, "#!/bin/sh\nexit 1\n").expect("write");
        std::fs::set_permissions(&bad, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let ffmpeg = Ffmpeg::locate(Some(&good)).expect("configured path exists");
        assert_eq!(ffmpeg.probe().await.unwrap(), "ffmpeg version 6.1");

        let broken = Ffmpeg::locate(Some(&bad)).expect("configured path exists");
        assert!(matches!(broken.probe().await, Err(Error::ToolNotFound(_))));
    }
}
