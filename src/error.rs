use std::{io, path::PathBuf, time::Duration};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::supervisor::JobStatus;

/// Every way a metadata fetch or download job can end badly.
///
/// Errors are translated into [`ApiError`] at the request boundary; the
/// `Display` text is meant for logs, [`DownloadError::user_message`] for
/// clients.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("metadata fetch failed: {0}")]
    MetadataFetch(String),

    #[error("metadata fetch exceeded {}s", .0.as_secs_f32())]
    MetadataTimeout(Duration),

    #[error("could not start yt-dlp: {0}")]
    Spawn(#[source] io::Error),

    #[error("yt-dlp exited with status {code:?}: {diagnostics}")]
    ToolExit {
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("downloaded file is empty")]
    EmptyOutput,

    #[error("no downloaded file found in {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("download exceeded {}s", .0.as_secs())]
    DownloadTimeout(Duration),

    #[error("download aborted after client disconnect")]
    Aborted,

    #[error("job is {0:?}, nothing to deliver")]
    NotSucceeded(JobStatus),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::MetadataFetch(_) => "METADATA_FETCH_FAILED",
            Self::MetadataTimeout(_) => "METADATA_TIMEOUT",
            Self::Spawn(_) => "SPAWN_FAILED",
            Self::ToolExit { .. } => "TOOL_EXIT",
            Self::EmptyOutput => "EMPTY_OUTPUT",
            Self::OutputMissing(_) => "OUTPUT_MISSING",
            Self::DownloadTimeout(_) => "DOWNLOAD_TIMEOUT",
            Self::Aborted => "ABORTED",
            Self::NotSucceeded(_) | Self::Io(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing text. Paths, io errors and raw process output stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(message) => message.clone(),
            Self::MetadataFetch(_) => "Failed to retrieve video info".to_string(),
            Self::MetadataTimeout(_) => "Timed out retrieving video info".to_string(),
            Self::Spawn(_) => "The download tool could not be started".to_string(),
            Self::ToolExit { diagnostics, .. } => {
                format!("Download failed: {}", describe_tool_failure(diagnostics))
            }
            Self::EmptyOutput => "Downloaded file is empty".to_string(),
            Self::OutputMissing(_) => "File not found after download".to_string(),
            Self::DownloadTimeout(_) => "Download exceeded the configured time limit".to_string(),
            Self::Aborted => "Download aborted".to_string(),
            Self::NotSucceeded(_) | Self::Io(_) => "Download failed".to_string(),
        }
    }
}

/// Picks the line of yt-dlp's stderr worth showing to a user.
pub fn describe_tool_failure(diagnostics: &str) -> String {
    let message = diagnostics
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation");
    let message = message.strip_prefix("ERROR:").map_or(message, str::trim);
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "unsupported or invalid URL".to_string()
    } else if lower.contains("nonetype") {
        "could not extract metadata from the URL".to_string()
    } else {
        message.to_string()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("INVALID_INPUT"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        let status = error.status();
        match &error {
            DownloadError::InvalidInput(_) => {}
            DownloadError::Aborted => warn!(code = error.code(), "{error}"),
            _ => error!(code = error.code(), "{error}"),
        }

        Self {
            status,
            message: error.user_message(),
            code: Some(error.code()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
