use std::{path::PathBuf, time::Duration};

use url::Url;

use crate::{error::ApiError, ytdlp::ToolConfig};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 90;
const DEFAULT_STALE_SCRATCH_SECONDS: u64 = 2 * 60 * 60;

/// Settings read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub tool: ToolConfig,
    pub scratch_dir: PathBuf,
    pub metadata_timeout: Duration,
    pub download_timeout: Option<Duration>,
    pub max_concurrent_downloads: Option<usize>,
    pub stale_scratch_after: Duration,
    /// Normalized `scheme://host[:port]` values; empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let text = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string));
        let seconds = |name: &str| text(name).and_then(|value| value.parse::<u64>().ok());

        let mut tool = ToolConfig::from_command_line(
            text("YT_DLP_BIN").as_deref().unwrap_or("yt-dlp"),
        );
        tool.js_runtime = text("YT_DLP_JS_RUNTIME");
        tool.ffmpeg_location = text("FFMPEG_LOCATION");

        let allowed_origins = text("ALLOWED_ORIGINS")
            .map(|value| parse_origins(&value))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            bind_addr: resolve_bind_addr(text("APP_ADDR"), text("PORT")),
            tool,
            scratch_dir: text("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("temp")),
            metadata_timeout: Duration::from_secs(
                seconds("METADATA_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_METADATA_TIMEOUT_SECONDS),
            ),
            download_timeout: seconds("DOWNLOAD_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs),
            max_concurrent_downloads: text("MAX_CONCURRENT_DOWNLOADS")
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0),
            stale_scratch_after: Duration::from_secs(
                seconds("STALE_SCRATCH_SECONDS").unwrap_or(DEFAULT_STALE_SCRATCH_SECONDS),
            ),
            allowed_origins,
        })
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_origins(value: &str) -> Result<Vec<String>, ApiError> {
    let mut origins = Vec::new();
    for origin in value.split(',').map(str::trim).filter(|origin| !origin.is_empty()) {
        let normalized = normalize_origin(origin).ok_or_else(|| {
            ApiError::internal(format!(
                "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected values like https://example.com"
            ))
        })?;
        if !origins.contains(&normalized) {
            origins.push(normalized);
        }
    }
    Ok(origins)
}

/// Reduces an origin to `scheme://host[:port]`, dropping default ports.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "chrome-extension" | "moz-extension" => None,
        _ => return None,
    };

    if !matches!(parsed.path(), "" | "/") || parsed.query().is_some() || parsed.fragment().is_some()
    {
        return None;
    }

    match parsed.port() {
        Some(port) if Some(port) != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
