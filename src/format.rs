use log::warn;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::Error;
use crate::extractor::FormatDescriptor;

/// What the user asked for, before it is matched against a video's formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    Best,
    AudioOnly,
    VideoOnly,
    Explicit(String),
}

impl FromStr for FormatSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "" => Err(Error::InvalidRequest("format selector is empty".to_string())),
            "best" => Ok(Self::Best),
            "audio-only" | "audio" => Ok(Self::AudioOnly),
            "video-only" | "video" => Ok(Self::VideoOnly),
            _ => Ok(Self::Explicit(s.to_string())),
        }
    }
}

/// Concrete yt-dlp format choice for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChosenFormat {
    /// Value for yt-dlp's `-f`.
    pub spec: String,
    /// Streams are muxed into the configured container.
    pub merge: bool,
    /// Audio is extracted and converted to mp3.
    pub extract_audio: bool,
}

impl ChosenFormat {
    fn best() -> Self {
        Self {
            spec: "bestvideo+bestaudio/best".to_string(),
            merge: true,
            extract_audio: false,
        }
    }
}

impl FormatSelector {
    /// Matches the selector against the formats a URL reported. An empty list is not checked.
    pub fn choose(&self, available: &[FormatDescriptor]) -> Result<ChosenFormat, Error> {
        let known = !available.is_empty();
        match self {
            Self::Best => Ok(ChosenFormat::best()),
            Self::AudioOnly => {
                if known && !available.iter().any(|f| f.has_audio) {
                    return Err(Error::Extraction("no format with an audio stream".to_string()));
                }
                Ok(ChosenFormat {
                    spec: "bestaudio/best".to_string(),
                    merge: false,
                    extract_audio: true,
                })
            }
            Self::VideoOnly => {
                if known && !available.iter().any(|f| f.has_video) {
                    return Err(Error::Extraction("no format with a video stream".to_string()));
                }
                Ok(ChosenFormat {
                    spec: "bestvideo".to_string(),
                    merge: false,
                    extract_audio: false,
                })
            }
            Self::Explicit(spec) => {
                let ids: Vec<&str> = spec.split('+').map(str::trim).collect();
                let missing: Vec<&str> = ids
                    .iter()
                    .copied()
                    .filter(|id| !available.iter().any(|f| f.format_id == *id))
                    .collect();
                if known && !missing.is_empty() {
                    warn!("Format {} is not available (missing {:?}), falling back to best", spec, missing);
                    return Ok(ChosenFormat::best());
                }
                Ok(ChosenFormat {
                    spec: ids.join("+"),
                    merge: ids.len() > 1,
                    extract_audio: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(id: &str, video: bool, audio: bool) -> FormatDescriptor {
        FormatDescriptor {
            format_id: id.to_string(),
            ext: "mp4".to_string(),
            height: video.then_some(720),
            fps: None,
            filesize: None,
            has_video: video,
            has_audio: audio,
            bitrate: None,
        }
    }

    #[test]
    fn parses_named_selectors() {
        assert_eq!("best".parse::<FormatSelector>().unwrap(), FormatSelector::Best);
        assert_eq!("Audio-Only".parse::<FormatSelector>().unwrap(), FormatSelector::AudioOnly);
        assert_eq!("video".parse::<FormatSelector>().unwrap(), FormatSelector::VideoOnly);
        assert_eq!(
            "137+140".parse::<FormatSelector>().unwrap(),
            FormatSelector::Explicit("137+140".to_string())
        );
        assert!(matches!("  ".parse::<FormatSelector>(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn explicit_pair_is_merged_when_both_exist() {
        let formats = vec![fmt("137", true, false), fmt("140", false, true)];
        let chosen = FormatSelector::Explicit("137+140".to_string()).choose(&formats).unwrap();
        assert_eq!(chosen.spec, "137+140");
        assert!(chosen.merge);
    }

    #[test]
    fn missing_explicit_id_falls_back_to_best() {
        let formats = vec![fmt("18", true, true)];
        let chosen = FormatSelector::Explicit("999".to_string()).choose(&formats).unwrap();
        assert_eq!(chosen, ChosenFormat::best());
    }

    #[test]
    fn unknown_formats_pass_through() {
        let chosen = FormatSelector::Explicit("22".to_string()).choose(&[]).unwrap();
        assert_eq!(chosen.spec, "22");
        assert!(!chosen.merge);
    }

    #[test]
    fn audio_only_requires_an_audio_stream() {
        let video_only = vec![fmt("137", true, false)];
        assert!(matches!(
            FormatSelector::AudioOnly.choose(&video_only),
            Err(Error::Extraction(_))
        ));

        let chosen = FormatSelector::AudioOnly.choose(&[fmt("140", false, true)]).unwrap();
        assert!(chosen.extract_audio);
    }
}
