// yt-dlp subprocess backend

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::FetchOptions;
use crate::errors::{Error, Result};
use crate::extractor::{
    FetchJob, FetchOutcome, FetchProgress, FormatDescriptor, MediaBackend, Resolution, ResumeMarker,
};
use crate::utils::clean_ansi;

const RESOLVE_TIMEOUT_SECS: u64 = 120;
const VERSION_TIMEOUT_SECS: u64 = 30;
const STDERR_TAIL_LINES: usize = 40;

const PROGRESS_PREFIX: &str = "vdl-progress ";
const OUTPUT_PREFIX: &str = "vdl-output ";
const PROGRESS_TEMPLATE: &str = "download:vdl-progress %(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.tmpfilename)s";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

const COMMON_PATHS: &[&str] = &[
    "/opt/homebrew/bin/yt-dlp",
    "/usr/local/bin/yt-dlp",
    "/usr/bin/yt-dlp",
];

pub struct YtDlp {
    program: PathBuf,
    ffmpeg: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            ffmpeg: None,
        }
    }

    pub fn with_ffmpeg(mut self, ffmpeg: Option<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Finds the yt-dlp executable. A configured path must exist; otherwise common
    /// install locations are tried before falling back to `PATH`.
    pub fn locate(configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = configured {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(Error::ToolNotFound(format!("yt-dlp not found at {:?}", path)));
        }

        for path in COMMON_PATHS {
            if Path::new(path).exists() {
                return Ok(PathBuf::from(path));
            }
        }

        if let Ok(output) = std::process::Command::new("which").arg("yt-dlp").output() {
            if output.status.success() {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    return Ok(PathBuf::from(found));
                }
            }
        }

        // Last resort: let the OS search PATH at spawn time.
        Ok(PathBuf::from("yt-dlp"))
    }

    /// Installed version as printed by `yt-dlp --version`.
    pub async fn version(&self) -> Result<String> {
        let output = run_output_with_timeout(
            &self.program,
            &["--version".to_string()],
            VERSION_TIMEOUT_SECS,
        )
        .await?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            return Err(Error::Extraction("yt-dlp printed no version".to_string()));
        }
        Ok(version)
    }

    fn network_args(options: &FetchOptions) -> Vec<String> {
        let mut args = vec![
            "--socket-timeout".to_string(),
            options.socket_timeout.to_string(),
        ];
        if let Some(proxy) = &options.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &options.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args
    }

    fn resolve_args(url: &str, options: &FetchOptions) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(Self::network_args(options));
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    fn fetch_args(&self, job: &FetchJob) -> Vec<String> {
        let options = &job.options;
        let output_template = match job.playlist_index {
            Some(index) => format!("{} - {}", index, OUTPUT_TEMPLATE),
            None => OUTPUT_TEMPLATE.to_string(),
        };
        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-colors".to_string(),
            "--no-playlist".to_string(),
            "--continue".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--no-simulate".to_string(),
            "--print".to_string(),
            format!("after_move:{}%(filepath)s", OUTPUT_PREFIX),
            "-f".to_string(),
            job.format.spec.clone(),
            "-P".to_string(),
            job.destination.to_string_lossy().into_owned(),
            "-o".to_string(),
            output_template,
            "--retries".to_string(),
            options.retry_count.to_string(),
        ];
        args.extend(Self::network_args(options));

        if job.format.merge {
            args.push("--merge-output-format".to_string());
            args.push(options.merge_format.clone());
        }
        if job.format.extract_audio {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                options.audio_quality.clone(),
            ]);
        }
        if job.want_thumbnail {
            args.push("--write-thumbnail".to_string());
        }
        if job.want_subtitles {
            args.push("--write-subs".to_string());
            args.push("--write-auto-subs".to_string());
            if !options.subtitle_languages.is_empty() {
                args.push("--sub-langs".to_string());
                args.push(options.subtitle_languages.join(","));
            }
        }
        if let Some(limit) = &options.rate_limit {
            args.push("--limit-rate".to_string());
            args.push(limit.clone());
        }
        if options.sleep_interval > 0 {
            args.push("--sleep-interval".to_string());
            args.push(options.sleep_interval.to_string());
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }

        args.push("--".to_string());
        args.push(job.url.clone());
        args
    }
}

#[async_trait]
impl MediaBackend for YtDlp {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn resolve(&self, url: &str, options: &FetchOptions) -> Result<Resolution> {
        let args = Self::resolve_args(url, options);
        debug!("Resolving {} with {:?} {}", url, self.program, args.join(" "));
        let output = run_output_with_timeout(&self.program, &args, RESOLVE_TIMEOUT_SECS).await?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        let resolution = parse_resolution(&output.stdout)?;
        info!(
            "Resolved '{}' ({} formats{})",
            resolution.title,
            resolution.available_formats.len(),
            if resolution.is_playlist {
                format!(", playlist of {}", resolution.member_urls.len())
            } else {
                String::new()
            }
        );
        Ok(resolution)
    }

    async fn fetch(
        &self,
        job: FetchJob,
        progress: mpsc::UnboundedSender<FetchProgress>,
    ) -> Result<FetchOutcome> {
        let args = self.fetch_args(&job);
        if let Some(marker) = &job.resume {
            info!("Continuing {} from {} bytes in {:?}", job.url, marker.offset, marker.partial_path);
        }
        debug!("Running {:?} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Extraction("failed to capture yt-dlp stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Extraction("failed to capture yt-dlp stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("yt-dlp: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        });

        let mut output_path = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(report) = parse_progress_line(&line) {
                let marker = report.partial_path.map(|partial_path| ResumeMarker {
                    partial_path,
                    offset: report.downloaded_bytes,
                });
                // The receiver is gone once the task stops; the kill follows when we are dropped.
                let _ = progress.send(FetchProgress {
                    downloaded_bytes: report.downloaded_bytes,
                    total_bytes: report.total_bytes,
                    marker,
                });
            } else if let Some(path) = parse_output_line(&line) {
                output_path = Some(path);
            } else if !line.trim().is_empty() {
                debug!("yt-dlp: {}", line);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(FetchOutcome { output_path })
        } else {
            warn!("yt-dlp exited with {} for {}", status, job.url);
            Err(classify_failure(&stderr))
        }
    }
}

/// Runs a command to completion, killing it if it outlives `timeout_secs`.
pub async fn run_output_with_timeout(
    program: &Path,
    args: &[String],
    timeout_secs: u64,
) -> Result<Output> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(Error::Network(format!(
            "{:?} timed out after {}s",
            program, timeout_secs
        ))),
    }
}

fn spawn_error(program: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ToolNotFound(format!("{:?} could not be started: {}", program, e))
    } else {
        Error::Io(e)
    }
}

#[derive(Debug, PartialEq)]
struct ProgressReport {
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    partial_path: Option<PathBuf>,
}

fn parse_number(field: &str) -> Option<u64> {
    let field = field.trim();
    if field.is_empty() || field == "NA" || field == "None" {
        return None;
    }
    field
        .parse::<u64>()
        .ok()
        .or_else(|| field.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

fn parse_progress_line(line: &str) -> Option<ProgressReport> {
    let rest = line.trim_end().strip_prefix(PROGRESS_PREFIX)?;
    // The temp path is last and may itself contain '|'.
    let mut fields = rest.splitn(4, '|');
    let downloaded_bytes = parse_number(fields.next()?)?;
    let total = fields.next().and_then(parse_number);
    let estimate = fields.next().and_then(parse_number);
    let partial_path = fields
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "NA")
        .map(PathBuf::from);
    Some(ProgressReport {
        downloaded_bytes,
        total_bytes: total.or(estimate),
        partial_path,
    })
}

fn parse_output_line(line: &str) -> Option<PathBuf> {
    let path = line.trim_end().strip_prefix(OUTPUT_PREFIX)?.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

fn parse_resolution(stdout: &[u8]) -> Result<Resolution> {
    let json: Value = serde_json::from_slice(stdout)
        .map_err(|e| Error::Extraction(format!("invalid JSON from yt-dlp: {}", e)))?;

    let title = json["title"].as_str().unwrap_or("Unknown").to_string();
    let uploader = json["uploader"].as_str().map(str::to_string);

    if json["_type"].as_str() == Some("playlist") {
        let member_urls = json["entries"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e["url"].as_str().or_else(|| e["webpage_url"].as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        return Ok(Resolution {
            title,
            uploader,
            is_playlist: true,
            member_urls,
            ..Default::default()
        });
    }

    Ok(Resolution {
        title,
        uploader,
        duration_seconds: json["duration"].as_f64().unwrap_or(0.0) as u64,
        available_formats: parse_formats(&json),
        is_playlist: false,
        member_urls: Vec::new(),
    })
}

fn parse_formats(json: &Value) -> Vec<FormatDescriptor> {
    let Some(formats) = json["formats"].as_array() else {
        return Vec::new();
    };
    formats
        .iter()
        .filter_map(|f| {
            let format_id = f["format_id"].as_str()?.to_string();
            let vcodec = f["vcodec"].as_str();
            let acodec = f["acodec"].as_str();
            let has_video = vcodec.map_or(f["height"].is_u64(), |v| v != "none");
            let has_audio = acodec.map_or(false, |a| a != "none");
            Some(FormatDescriptor {
                format_id,
                ext: f["ext"].as_str().unwrap_or("").to_string(),
                height: f["height"].as_u64().map(|h| h as u32),
                fps: f["fps"].as_f64().map(|v| v as f32),
                filesize: f["filesize"].as_u64().or_else(|| f["filesize_approx"].as_u64()),
                has_video,
                has_audio,
                bitrate: f["abr"]
                    .as_f64()
                    .filter(|_| !has_video)
                    .or_else(|| f["tbr"].as_f64())
                    .map(|v| v as f32),
            })
        })
        .collect()
}

const NETWORK_HINTS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection aborted",
    "temporary failure",
    "network is unreachable",
    "name or service not known",
    "remote end closed",
    "incompleteread",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
];

/// Maps yt-dlp's stderr to an error kind. Only network trouble is worth resuming.
pub fn classify_failure(stderr: &str) -> Error {
    let text = clean_ansi(stderr);
    let message = text
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .or_else(|| text.lines().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| "yt-dlp exited with an error".to_string());

    let lower = message.to_lowercase();
    if lower.contains("unsupported url") {
        Error::UnsupportedUrl(message)
    } else if NETWORK_HINTS.iter().any(|hint| lower.contains(hint)) {
        Error::Network(message)
    } else {
        Error::Extraction(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChosenFormat;

    fn job(dir: &Path) -> FetchJob {
        FetchJob {
            url: "https://video.example.com/watch?v=abc".to_string(),
            destination: dir.to_path_buf(),
            format: ChosenFormat {
                spec: "137+140".to_string(),
                merge: true,
                extract_audio: false,
            },
            want_thumbnail: true,
            want_subtitles: true,
            playlist_index: None,
            resume: None,
            options: FetchOptions::default(),
        }
    }

    #[test]
    fn progress_line_with_estimate_and_path() {
        let report = parse_progress_line("vdl-progress 1024|NA|4096.5|/tmp/a b/clip.f137.mp4.part").unwrap();
        assert_eq!(
            report,
            ProgressReport {
                downloaded_bytes: 1024,
                total_bytes: Some(4096),
                partial_path: Some(PathBuf::from("/tmp/a b/clip.f137.mp4.part")),
            }
        );
    }

    #[test]
    fn progress_line_without_known_sizes() {
        let report = parse_progress_line("vdl-progress 10|NA|NA|NA").unwrap();
        assert_eq!(report.total_bytes, None);
        assert_eq!(report.partial_path, None);
        assert!(parse_progress_line("[download]  42.0% of 10MiB").is_none());
        assert!(parse_progress_line("vdl-progress NA|NA|NA|NA").is_none());
    }

    #[test]
    fn output_line_is_recognised() {
        assert_eq!(
            parse_output_line("vdl-output /videos/clip.mp4\n"),
            Some(PathBuf::from("/videos/clip.mp4"))
        );
        assert_eq!(parse_output_line("vdl-output "), None);
    }

    #[test]
    fn single_video_json() {
        let json = br#"{
            "title": "Clip", "uploader": "someone", "duration": 125.0,
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 2000},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080, "fps": 30},
                {"ext": "mp4"}
            ]
        }"#;
        let resolution = parse_resolution(json).unwrap();
        assert_eq!(resolution.title, "Clip");
        assert_eq!(resolution.duration_seconds, 125);
        assert!(!resolution.is_playlist);
        assert_eq!(resolution.available_formats.len(), 2);

        let audio = &resolution.available_formats[0];
        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.bitrate, Some(129.5));
        let video = &resolution.available_formats[1];
        assert!(video.has_video && !video.has_audio);
        assert_eq!(video.height, Some(1080));
    }

    #[test]
    fn playlist_json_lists_members_in_order() {
        let json = br#"{
            "_type": "playlist", "title": "Talks",
            "entries": [
                {"url": "https://video.example.com/watch?v=1"},
                {"id": "skipped"},
                {"url": "https://video.example.com/watch?v=2"}
            ]
        }"#;
        let resolution = parse_resolution(json).unwrap();
        assert!(resolution.is_playlist);
        assert_eq!(
            resolution.member_urls,
            vec![
                "https://video.example.com/watch?v=1".to_string(),
                "https://video.example.com/watch?v=2".to_string()
            ]
        );
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(
            classify_failure("\x1b[0;31mERROR:\x1b[0m Unsupported URL: https://example.com"),
            Error::UnsupportedUrl(_)
        ));
        assert!(matches!(
            classify_failure("WARNING: retrying\nERROR: Read timed out."),
            Error::Network(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: [youtube] abc: Video unavailable"),
            Error::Extraction(_)
        ));
        assert!(matches!(classify_failure(""), Error::Extraction(_)));
    }

    #[test]
    fn fetch_args_carry_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut job = job(dir.path());
        job.options.proxy = Some("socks5://127.0.0.1:1080".to_string());
        job.options.rate_limit = Some("1M".to_string());

        let backend = YtDlp::new(PathBuf::from("yt-dlp")).with_ffmpeg(Some(PathBuf::from("/opt/ffmpeg")));
        let args = backend.fetch_args(&job);
        let joined = args.join(" ");

        assert!(joined.contains("-f 137+140"));
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(joined.contains("--proxy socks5://127.0.0.1:1080"));
        assert!(joined.contains("--limit-rate 1M"));
        assert!(joined.contains("--sub-langs en"));
        assert!(joined.contains("--write-thumbnail"));
        assert!(joined.contains("--ffmpeg-location /opt/ffmpeg"));
        assert!(joined.contains("--sleep-interval 3"));
        assert!(joined.contains("-o %(title)s.%(ext)s"));
        assert!(!args.contains(&"-x".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://video.example.com/watch?v=abc"));
    }

    #[test]
    fn playlist_members_are_numbered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut job = job(dir.path());
        job.playlist_index = Some(7);
        job.options.sleep_interval = 0;

        let args = YtDlp::new(PathBuf::from("yt-dlp")).fetch_args(&job);
        let template = args
            .iter()
            .position(|a| a == "-o")
            .and_then(|i| args.get(i + 1))
            .expect("output template");
        assert_eq!(template, "7 - %(title)s.%(ext)s");
        assert!(!args.contains(&"--sleep-interval".to_string()));
    }

    #[test]
    fn audio_extraction_args() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut job = job(dir.path());
        job.format = ChosenFormat {
            spec: "bestaudio/best".to_string(),
            merge: false,
            extract_audio: true,
        };
        let args = YtDlp::new(PathBuf::from("yt-dlp")).fetch_args(&job).join(" ");
        assert!(args.contains("-x --audio-format mp3 --audio-quality 192"));
        assert!(!args.contains("--merge-output-format"));
    }

    #[test]
    fn configured_path_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("yt-dlp");
        assert!(matches!(YtDlp::locate(Some(&missing)), Err(Error::ToolNotFound(_))));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_reports_progress_and_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let part = dir.path().join("clip.mp4.part");
        let out = dir.path().join("clip.mp4");
        let tool = fake_tool(
            dir.path(),
            &format!(
                "echo 'vdl-progress 50|100|NA|{}'\necho 'vdl-progress 100|100|NA|{}'\necho 'vdl-output {}'",
                part.display(),
                part.display(),
                out.display()
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = YtDlp::new(tool).fetch(job(dir.path()), tx).await.expect("fetch");
        assert_eq!(outcome.output_path, Some(out));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.downloaded_bytes, 50);
        assert_eq!(first.total_bytes, Some(100));
        assert_eq!(
            first.marker,
            Some(ResumeMarker {
                partial_path: part,
                offset: 50
            })
        );
        assert_eq!(rx.recv().await.unwrap().downloaded_bytes, 100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_failure_uses_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = fake_tool(dir.path(), "echo 'ERROR: Unsupported URL: nope' >&2\nexit 1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = YtDlp::new(tool).fetch(job(dir.path()), tx).await;
        assert!(matches!(result, Err(Error::UnsupportedUrl(_))));
    }

    #[tokio::test]
    async fn missing_program_is_tool_not_found() {
        let result = run_output_with_timeout(
            Path::new("/nonexistent/yt-dlp-for-tests"),
            &["--version".to_string()],
            5,
        )
        .await;
        assert!(matches!(result, Err(Error::ToolNotFound(_))));
    }
}
