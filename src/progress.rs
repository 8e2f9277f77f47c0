//! Turning yt-dlp's line-oriented output into progress events.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

/// `[download]  42.3% of 10.00MiB at 1.20MiB/s ETA 00:07`
static DOWNLOAD_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%").expect("progress pattern is valid")
});

/// Extracts a completion percentage from one complete output line.
pub trait ProgressParser: Send + Sync {
    fn parse_percent(&self, line: &str) -> Option<f64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YtDlpProgressParser;

impl ProgressParser for YtDlpProgressParser {
    fn parse_percent(&self, line: &str) -> Option<f64> {
        let captures = DOWNLOAD_PERCENT.captures(line.trim_start())?;
        let percent = captures.get(1)?.as_str().parse::<f64>().ok()?;
        percent.is_finite().then(|| percent.clamp(0.0, 100.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub percent: f64,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Reassembles lines from arbitrarily split output chunks.
///
/// Both `\n` and `\r` end a line, since progress bars redraw with carriage
/// returns. Bytes are kept until their line is complete so a multi-byte
/// character split across chunks survives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    const MAX_PENDING: usize = 64 * 1024;

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                lines.extend(self.take_line());
            } else {
                self.pending.push(byte);
                if self.pending.len() >= Self::MAX_PENDING {
                    lines.extend(self.take_line());
                }
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        (!line.is_empty()).then_some(line)
    }
}
