use regex::Regex;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use url::Url;

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_FILENAME_CHARS: usize = 200;

/// Checks that a request URL is something yt-dlp can be pointed at.
pub fn validate_url(url_str: &str) -> Result<Url, String> {
    let url = Url::parse(url_str).map_err(|e| format!("{}: {}", url_str, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("{}: unsupported scheme '{}'", url_str, other)),
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();

    if cleaned.chars().count() > MAX_FILENAME_CHARS {
        let head: String = cleaned.chars().take(MAX_FILENAME_CHARS - 3).collect();
        return format!("{}...", head);
    }
    if cleaned.is_empty() {
        return "untitled".to_string();
    }
    cleaned
}

/// Creates `dir` if needed and proves it is writable by dropping a probe file in it.
pub fn ensure_writable_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{:?} is not a directory", dir),
        ));
    }
    let probe = dir.join(format!(".vdl-probe-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "unknown".to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

pub fn clean_ansi(text: &str) -> String {
    static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();
    let re = ANSI_ESCAPE.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("static regex")
    });
    re.replace_all(text, "").into_owned()
}
