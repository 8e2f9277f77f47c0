//! Owns one yt-dlp download subprocess per job, from spawn to exit.
//!
//! A client disconnect terminates the subprocess. Two signals trigger this:
//! the request future being dropped (the child is spawned with kill-on-drop)
//! and the job's cancellation token, which the progress bus fires when the
//! client's progress session closes.

use std::{
    collections::VecDeque,
    path::PathBuf,
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Child,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    bus::ProgressBus,
    error::DownloadError,
    progress::{LineBuffer, ProgressEvent, ProgressParser},
    ytdlp::{self, ToolConfig},
};

const STDERR_TAIL_LINES: usize = 20;
const READ_CHUNK_BYTES: usize = 8 * 1024;
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug)]
pub struct DownloadJob {
    pub id: Uuid,
    pub url: String,
    pub selector: String,
    pub output_path: PathBuf,
    pub cookie_path: Option<PathBuf>,
    pub session_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    status: JobStatus,
    progress: f64,
    sequence: u64,
}

impl DownloadJob {
    pub fn new(id: Uuid, url: String, selector: String, output_path: PathBuf) -> Self {
        Self {
            id,
            url,
            selector,
            output_path,
            cookie_path: None,
            session_id: None,
            started_at: Utc::now(),
            status: JobStatus::Pending,
            progress: 0.0,
            sequence: 0,
        }
    }

    pub fn with_cookies(mut self, cookie_path: Option<PathBuf>) -> Self {
        self.cookie_path = cookie_path;
        self
    }

    pub fn with_session(mut self, session_id: Option<Uuid>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Accepts a parsed percentage and returns an event only if progress moved forward.
    ///
    /// yt-dlp restarts at 0% for each stream of a merged download; such
    /// regressions are swallowed so clients only ever see progress grow.
    pub fn record_progress(&mut self, percent: f64, at: DateTime<Utc>) -> Option<ProgressEvent> {
        let percent = percent.clamp(0.0, 100.0);
        if percent <= self.progress && self.sequence > 0 {
            return None;
        }

        self.progress = percent;
        self.sequence += 1;
        Some(ProgressEvent {
            job_id: self.id,
            percent,
            sequence: self.sequence,
            emitted_at: at,
        })
    }

    pub(crate) fn transition(&mut self, next: JobStatus) {
        debug_assert!(!self.status.is_terminal(), "job {} already finished", self.id);
        debug!(job = %self.id, "status {:?} -> {:?}", self.status, next);
        self.status = next;
    }
}

enum Step {
    Chunk(usize),
    StdoutClosed,
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    DeadlineReached(Duration),
}

pub struct DownloadSupervisor {
    tool: ToolConfig,
    parser: Arc<dyn ProgressParser>,
    max_duration: Option<Duration>,
}

impl DownloadSupervisor {
    pub fn new(
        tool: ToolConfig,
        parser: Arc<dyn ProgressParser>,
        max_duration: Option<Duration>,
    ) -> Self {
        Self {
            tool,
            parser,
            max_duration,
        }
    }

    /// Spawns yt-dlp for `job` and marks it running.
    pub fn start(&self, job: &mut DownloadJob) -> Result<Child, DownloadError> {
        let args = self.tool.download_args(
            &job.url,
            &job.selector,
            &job.output_path,
            job.cookie_path.as_deref(),
        );

        match self.tool.command(args).spawn() {
            Ok(child) => {
                info!(
                    job = %job.id,
                    "yt-dlp started (pid {:?}) for {} with selector {:?}",
                    child.id(),
                    job.url,
                    job.selector
                );
                job.transition(JobStatus::Running);
                Ok(child)
            }
            Err(error) => {
                job.transition(JobStatus::Failed);
                Err(DownloadError::Spawn(error))
            }
        }
    }

    /// Starts the job and supervises it to a terminal state.
    pub async fn run(
        &self,
        job: &mut DownloadJob,
        bus: &ProgressBus,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let child = self.start(job)?;
        self.supervise(job, child, bus, cancel).await
    }

    pub async fn supervise(
        &self,
        job: &mut DownloadJob,
        mut child: Child,
        bus: &ProgressBus,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let Some(mut stdout) = child.stdout.take() else {
            ytdlp::terminate(&mut child).await;
            job.transition(JobStatus::Failed);
            return Err(DownloadError::Io(std::io::Error::other(
                "yt-dlp stdout was not captured",
            )));
        };
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, job.id)));

        let max_duration = self.max_duration;
        let deadline = async move {
            match max_duration {
                Some(limit) => {
                    sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut lines = LineBuffer::default();
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut stdout_open = true;

        let status = loop {
            let step = tokio::select! {
                () = cancel.cancelled() => Step::Cancelled,
                limit = &mut deadline => Step::DeadlineReached(limit),
                read = stdout.read(&mut chunk), if stdout_open => match read {
                    Ok(0) => Step::StdoutClosed,
                    Ok(count) => Step::Chunk(count),
                    Err(error) => {
                        warn!(job = %job.id, "reading yt-dlp stdout failed: {error}");
                        Step::StdoutClosed
                    }
                },
                status = child.wait(), if !stdout_open => Step::Exited(status),
            };

            match step {
                Step::Chunk(count) => {
                    for line in lines.push(&chunk[..count]) {
                        self.handle_line(job, &line, bus);
                    }
                }
                Step::StdoutClosed => {
                    stdout_open = false;
                    if let Some(line) = lines.finish() {
                        self.handle_line(job, &line, bus);
                    }
                }
                Step::Exited(status) => break status,
                Step::Cancelled => {
                    info!(
                        job = %job.id,
                        "client disconnected at {:.1}%, terminating yt-dlp",
                        job.progress()
                    );
                    ytdlp::terminate(&mut child).await;
                    abort_drain(stderr_tail);
                    job.transition(JobStatus::Aborted);
                    return Err(DownloadError::Aborted);
                }
                Step::DeadlineReached(limit) => {
                    warn!(job = %job.id, "download exceeded {limit:?}, terminating yt-dlp");
                    ytdlp::terminate(&mut child).await;
                    abort_drain(stderr_tail);
                    job.transition(JobStatus::Failed);
                    return Err(DownloadError::DownloadTimeout(limit));
                }
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(error) => {
                abort_drain(stderr_tail);
                job.transition(JobStatus::Failed);
                return Err(DownloadError::Io(error));
            }
        };

        let tail = match stderr_tail {
            Some(handle) => match timeout(STDERR_DRAIN_GRACE, handle).await {
                Ok(Ok(tail)) => tail,
                _ => Vec::new(),
            },
            None => Vec::new(),
        };

        if status.success() {
            job.transition(JobStatus::Succeeded);
            info!(
                job = %job.id,
                "yt-dlp finished in {}s",
                (Utc::now() - job.started_at).num_seconds()
            );
            Ok(())
        } else {
            job.transition(JobStatus::Failed);
            let diagnostics = tail.join("\n");
            warn!(job = %job.id, "yt-dlp failed ({status}):\n{diagnostics}");
            Err(DownloadError::ToolExit {
                code: status.code(),
                diagnostics,
            })
        }
    }

    fn handle_line(&self, job: &mut DownloadJob, line: &str, bus: &ProgressBus) {
        let Some(percent) = self.parser.parse_percent(line) else {
            debug!(job = %job.id, "yt-dlp: {line}");
            return;
        };

        let Some(event) = job.record_progress(percent, bus.now()) else {
            return;
        };
        if let Some(session_id) = job.session_id {
            bus.publish(session_id, event);
        }
    }
}

async fn drain_stderr(mut stderr: impl AsyncRead + Unpin, job_id: Uuid) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = LineBuffer::default();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    let mut keep = |line: String| {
        debug!(job = %job_id, "yt-dlp stderr: {line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(count) => lines.push(&chunk[..count]).into_iter().for_each(&mut keep),
        }
    }
    lines.finish().into_iter().for_each(&mut keep);

    tail.into_iter().collect()
}

fn abort_drain(handle: Option<tokio::task::JoinHandle<Vec<String>>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}
