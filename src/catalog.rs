use std::{
    path::Path,
    process::ExitStatus,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{io::AsyncReadExt, process::Child, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    error::{DownloadError, describe_tool_failure},
    selector,
    ytdlp::{self, ToolConfig},
};

const DEFAULT_TITLE: &str = "video";

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration_string: Option<String>,
    uploader: Option<String>,
    age_limit: Option<u32>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    #[serde(default)]
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub height: Option<u32>,
    /// `"none"` for audio-only tracks.
    pub vcodec: Option<String>,
    pub ext: Option<String>,
}

impl FormatDescriptor {
    pub fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(value) if value != "none")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration_string: Option<String>,
    pub uploader: Option<String>,
    pub age_limit: u32,
    pub formats: Vec<FormatDescriptor>,
}

impl VideoMetadata {
    pub fn from_json(raw: &[u8]) -> Result<Self, DownloadError> {
        let info: YtDlpVideoInfo = serde_json::from_slice(raw)
            .map_err(|error| DownloadError::MetadataFetch(format!("malformed yt-dlp JSON: {error}")))?;

        Ok(Self {
            title: info
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            thumbnail: info.thumbnail,
            duration_string: info.duration_string,
            uploader: info.uploader,
            age_limit: info.age_limit.unwrap_or_default(),
            formats: info
                .formats
                .into_iter()
                .map(|format| FormatDescriptor {
                    format_id: format.format_id,
                    height: format.height,
                    vcodec: format.vcodec,
                    ext: format.ext,
                })
                .collect(),
        })
    }

    pub fn is_age_restricted(&self) -> bool {
        self.age_limit > 0
    }

    pub fn available_heights(&self) -> Vec<u32> {
        selector::available_heights(&self.formats)
    }
}

/// Runs yt-dlp in metadata-only mode under a watchdog.
#[derive(Debug, Clone)]
pub struct CatalogResolver {
    tool: ToolConfig,
    timeout: Duration,
}

impl CatalogResolver {
    pub fn new(tool: ToolConfig, timeout: Duration) -> Self {
        Self { tool, timeout }
    }

    pub async fn resolve(
        &self,
        url: &str,
        cookies: Option<&Path>,
    ) -> Result<VideoMetadata, DownloadError> {
        let started = Instant::now();
        let child = self
            .tool
            .command(self.tool.metadata_args(url, cookies))
            .spawn()
            .map_err(DownloadError::Spawn)?;

        let (status, stdout, stderr) = collect_with_watchdog(child, self.timeout).await?;
        if !status.success() {
            let diagnostics = String::from_utf8_lossy(&stderr);
            warn!(
                "yt-dlp metadata fetch for {url:?} failed ({status}): {}",
                describe_tool_failure(&diagnostics)
            );
            return Err(DownloadError::MetadataFetch(format!(
                "yt-dlp exited with {status}"
            )));
        }

        let metadata = VideoMetadata::from_json(&stdout)?;
        info!(
            "metadata for {url:?} resolved in {:?}: {:?}, {} formats",
            started.elapsed(),
            metadata.title,
            metadata.formats.len()
        );
        Ok(metadata)
    }
}

async fn collect_with_watchdog(
    mut child: Child,
    limit: Duration,
) -> Result<(ExitStatus, Vec<u8>, Vec<u8>), DownloadError> {
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        ytdlp::terminate(&mut child).await;
        return Err(DownloadError::MetadataFetch(
            "yt-dlp output was not captured".to_string(),
        ));
    };

    let finished = timeout(limit, async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (read_out, read_err) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        read_out?;
        read_err?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out, err))
    })
    .await;

    match finished {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => {
            ytdlp::terminate(&mut child).await;
            Err(DownloadError::MetadataFetch(format!(
                "reading yt-dlp output failed: {error}"
            )))
        }
        Err(_) => {
            debug!("metadata watchdog fired after {limit:?}, killing yt-dlp");
            ytdlp::terminate(&mut child).await;
            Err(DownloadError::MetadataTimeout(limit))
        }
    }
}
