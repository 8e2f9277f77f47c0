use std::{collections::BTreeSet, str::FromStr};

use crate::{catalog::FormatDescriptor, error::DownloadError};

pub const AUTO_SELECTOR: &str = "bestvideo+bestaudio/best";
pub const AUDIO_SELECTOR: &str = "bestaudio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualitySelection {
    Auto,
    SpecificHeight(u32),
    AudioOnly,
}

impl QualitySelection {
    pub fn selector(self) -> String {
        match self {
            Self::Auto => AUTO_SELECTOR.to_string(),
            Self::AudioOnly => AUDIO_SELECTOR.to_string(),
            Self::SpecificHeight(height) => {
                format!("bestvideo[height={height}]+bestaudio/best[height={height}]")
            }
        }
    }
}

impl FromStr for QualitySelection {
    type Err = DownloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "" | "best" | "auto" => Ok(Self::Auto),
            "audio" => Ok(Self::AudioOnly),
            other => other
                .strip_suffix('p')
                .unwrap_or(other)
                .parse::<u32>()
                .ok()
                .filter(|height| *height > 0)
                .map(Self::SpecificHeight)
                .ok_or_else(|| DownloadError::InvalidInput(format!("Unknown quality: {value}"))),
        }
    }
}

/// Distinct heights of the video tracks in a catalog, highest first.
pub fn available_heights(formats: &[FormatDescriptor]) -> Vec<u32> {
    formats
        .iter()
        .filter(|format| format.has_video())
        .filter_map(|format| format.height)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Chooses the selector for a download request.
///
/// A raw `format_id` wins, except that an empty one or `best` means the
/// automatic selector. Otherwise `quality` is parsed; no input at all is Auto.
pub fn resolve_selector(
    format_id: Option<&str>,
    quality: Option<&str>,
) -> Result<String, DownloadError> {
    match format_id.map(str::trim).filter(|value| !value.is_empty()) {
        Some("best") => Ok(AUTO_SELECTOR.to_string()),
        Some(raw) => Ok(raw.to_string()),
        None => Ok(quality
            .map(str::parse::<QualitySelection>)
            .transpose()?
            .unwrap_or(QualitySelection::Auto)
            .selector()),
    }
}
