//! Command lines for the external yt-dlp binary.
//!
//! Nothing else in the crate knows yt-dlp flag names; the catalog resolver and
//! the download supervisor only ask this module for a ready [`Command`].

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};
use tracing::warn;

/// Container yt-dlp merges separate video and audio streams into.
pub const MERGE_OUTPUT_FORMAT: &str = "mp4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub program: PathBuf,
    /// Arguments placed before anything else, e.g. `-m yt_dlp` when `program` is python.
    pub leading_args: Vec<String>,
    /// Value for `--js-runtimes`, e.g. `node:/usr/bin/node`.
    pub js_runtime: Option<String>,
    pub ffmpeg_location: Option<String>,
}

impl ToolConfig {
    /// Parses a whitespace separated command such as `yt-dlp` or `python3 -m yt_dlp`.
    pub fn from_command_line(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(ToString::to_string);
        let program = parts.next().unwrap_or_else(|| "yt-dlp".to_string());

        Self {
            program: PathBuf::from(program),
            leading_args: parts.collect(),
            js_runtime: None,
            ffmpeg_location: None,
        }
    }

    pub fn metadata_args(&self, url: &str, cookies: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--prefer-free-formats".to_string(),
            "--extractor-args".to_string(),
            "youtube:skip=dash".to_string(),
        ];
        self.push_runtime_args(&mut args);
        push_cookie_args(&mut args, cookies);
        args.push(url.to_string());
        args
    }

    pub fn download_args(
        &self,
        url: &str,
        selector: &str,
        output: &Path,
        cookies: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "-f".to_string(),
            selector.to_string(),
            "--merge-output-format".to_string(),
            MERGE_OUTPUT_FORMAT.to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.clone());
        }
        self.push_runtime_args(&mut args);
        push_cookie_args(&mut args, cookies);
        args.push(url.to_string());
        args
    }

    /// A command with piped output that kills the child if the handle is dropped.
    pub fn command(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn push_runtime_args(&self, args: &mut Vec<String>) {
        if let Some(runtime) = &self.js_runtime {
            args.push("--js-runtimes".to_string());
            args.push(runtime.clone());
        }
    }
}

fn push_cookie_args(args: &mut Vec<String>, cookies: Option<&Path>) {
    if let Some(path) = cookies {
        args.push("--cookies".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
}

/// Kills and reaps a child, logging instead of failing.
pub async fn terminate(child: &mut Child) {
    if let Err(error) = child.kill().await {
        warn!("could not terminate yt-dlp (pid {:?}): {error}", child.id());
    }
}
