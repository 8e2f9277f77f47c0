//! Streams a finished download to the client and owns its cleanup.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cookies::StagedCookies,
    error::{ApiError, DownloadError},
    scratch::discard_path,
    supervisor::{DownloadJob, JobStatus},
};

const MAX_TITLE_CHARS: usize = 120;
const FALLBACK_TITLE: &str = "video";
const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

/// Everything a job leaves on disk. Dropping the guard removes it all.
#[derive(Debug)]
pub struct JobArtifacts {
    job_dir: PathBuf,
    cookies: Option<StagedCookies>,
}

impl JobArtifacts {
    pub fn new(job_dir: PathBuf, cookies: Option<StagedCookies>) -> Self {
        Self { job_dir, cookies }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn cookie_path(&self) -> Option<&Path> {
        self.cookies.as_ref().map(StagedCookies::path)
    }
}

impl Drop for JobArtifacts {
    fn drop(&mut self) {
        discard_path(std::mem::take(&mut self.job_dir));
    }
}

/// Filesystem-safe stem for a video title.
pub fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .map(|character| {
            if character.is_ascii_alphanumeric() {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        sanitized
    }
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// A verified output file, ready to be sent as an attachment.
#[derive(Debug)]
pub struct Delivery {
    stream: DeliveryStream,
    title: String,
    extension: String,
    content_length: u64,
}

impl Delivery {
    pub fn filename(&self) -> String {
        format!("{}.{}", sanitize_title(&self.title), self.extension)
    }

    fn content_disposition(&self) -> String {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}.{}",
            self.filename(),
            urlencoding::encode(&self.title),
            self.extension
        )
    }

    fn headers(&self) -> Result<HeaderMap, ApiError> {
        let filename = self.filename();
        let invalid = |_| ApiError::internal("Could not build download headers");

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(content_type_for_filename(&filename)),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.content_length));
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_str(&self.content_disposition()).map_err(invalid)?,
        );
        headers.insert(
            HeaderName::from_static("x-download-filename"),
            HeaderValue::from_str(&filename).map_err(invalid)?,
        );
        Ok(headers)
    }
}

impl IntoResponse for Delivery {
    fn into_response(self) -> Response {
        match self.headers() {
            Ok(headers) => (headers, Body::from_stream(self.stream)).into_response(),
            Err(error) => error.into_response(),
        }
    }
}

/// Checks the job's output and opens it for streaming.
///
/// On any error `artifacts` is dropped here, which removes the job's files.
pub async fn deliver(
    job: &DownloadJob,
    artifacts: JobArtifacts,
    title: &str,
) -> Result<Delivery, DownloadError> {
    if job.status() != JobStatus::Succeeded {
        return Err(DownloadError::NotSucceeded(job.status()));
    }

    let path = resolve_output(artifacts.job_dir(), &job.output_path).await?;
    let file = File::open(&path).await?;
    let content_length = file.metadata().await?.len();
    if content_length == 0 {
        return Err(DownloadError::EmptyOutput);
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| crate::ytdlp::MERGE_OUTPUT_FORMAT.to_string());
    let title = match title.trim() {
        "" => FALLBACK_TITLE.to_string(),
        trimmed => trimmed.chars().take(MAX_TITLE_CHARS).collect(),
    };

    info!(job = %job.id, "delivering {content_length} bytes from {:?}", path);
    Ok(Delivery {
        stream: DeliveryStream {
            inner: ReaderStream::new(file),
            job_id: job.id,
            sent: 0,
            finished: false,
            artifacts,
        },
        title,
        extension,
        content_length,
    })
}

/// The expected path first, then whatever finished file the tool left in the job dir.
async fn resolve_output(job_dir: &Path, expected: &Path) -> Result<PathBuf, DownloadError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await?;

    if let Some(path) = resolve_candidate(&canonical_job_dir, expected).await? {
        return Ok(path);
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)));
        if is_partial {
            continue;
        }

        if let Some(path) = resolve_candidate(&canonical_job_dir, &path).await? {
            return Ok(path);
        }
    }

    Err(DownloadError::OutputMissing(job_dir.to_path_buf()))
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, DownloadError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_job_dir) {
        warn!("ignoring output outside the job dir: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}

/// The response body. Owns the job's artifacts until the transfer ends.
#[derive(Debug)]
pub struct DeliveryStream {
    inner: ReaderStream<File>,
    job_id: Uuid,
    sent: u64,
    finished: bool,
    artifacts: JobArtifacts,
}

impl Stream for DeliveryStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);

        match &polled {
            Poll::Ready(Some(Ok(bytes))) => this.sent += bytes.len() as u64,
            Poll::Ready(Some(Err(error))) => {
                warn!(job = %this.job_id, "reading output failed mid-transfer: {error}");
            }
            Poll::Ready(None) => this.finished = true,
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        if self.finished {
            info!(job = %self.job_id, "delivered {} bytes", self.sent);
        } else {
            warn!(
                job = %self.job_id,
                dir = ?self.artifacts.job_dir(),
                "stream aborted after {} bytes",
                self.sent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    use super::*;
    use crate::{cookies::CookieStaging, scratch::ScratchDir, testing::{entry_count, settled_entry_count}};

    struct Fixture {
        _dir: TempDir,
        scratch: ScratchDir,
        job: DownloadJob,
        artifacts: JobArtifacts,
    }

    async fn fixture(output: Option<&[u8]>, status: JobStatus) -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let scratch = ScratchDir::new(dir.path().join("scratch"));
        let cookies = CookieStaging::new(scratch.clone())
            .stage(Some("# Netscape HTTP Cookie File\n.a.com\tTRUE\t/\tTRUE\t0\tk\tv"))
            .await
            .expect("stage");
        let id = Uuid::new_v4();
        let job_dir = scratch.create_job_dir(id).await.expect("job dir");
        let output_path = job_dir.join("My_clip.mp4");
        if let Some(bytes) = output {
            std::fs::write(&output_path, bytes).expect("write output");
        }

        let mut job = DownloadJob::new(
            id,
            "https://example/video".to_string(),
            "best".to_string(),
            output_path,
        );
        job.transition(status);

        Fixture {
            _dir: dir,
            scratch,
            job,
            artifacts: JobArtifacts::new(job_dir, cookies),
        }
    }

    #[test]
    fn titles_are_sanitized_for_headers() {
        assert_eq!(sanitize_title("My clip: part 1"), "My_clip__part_1");
        assert_eq!(sanitize_title("Caf\u{e9}"), "Caf_");
        assert_eq!(sanitize_title("   "), "video");
        assert_eq!(sanitize_title(&"a".repeat(500)).len(), MAX_TITLE_CHARS);
    }

    #[tokio::test]
    async fn long_titles_are_bounded_in_both_filename_forms() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(Some(b"video-bytes".as_slice()), JobStatus::Succeeded).await;

        let delivery = deliver(&job, artifacts, &"\u{e9}".repeat(500))
            .await
            .expect("delivery");
        let response = delivery.into_response();
        let disposition = response.headers()[CONTENT_DISPOSITION]
            .to_str()
            .expect("ascii header")
            .to_string();

        let encoded = format!("filename*=UTF-8''{}.mp4", "%C3%A9".repeat(MAX_TITLE_CHARS));
        assert!(disposition.ends_with(&encoded), "{disposition}");
        assert!(disposition.contains(&format!("filename=\"{}.mp4\"", "_".repeat(MAX_TITLE_CHARS))));

        drop(response);
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for_filename("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.WEBM"), "video/webm");
        assert_eq!(content_type_for_filename("a"), "application/octet-stream");
    }

    #[tokio::test]
    async fn empty_output_fails_and_cleans_up() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(Some(b"".as_slice()), JobStatus::Succeeded).await;

        let result = deliver(&job, artifacts, "clip").await;

        assert!(matches!(result, Err(DownloadError::EmptyOutput)));
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }

    #[tokio::test]
    async fn missing_output_fails_and_cleans_up() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(None, JobStatus::Succeeded).await;
        std::fs::write(artifacts.job_dir().join("My_clip.mp4.part"), b"half").expect("write");

        let result = deliver(&job, artifacts, "clip").await;

        assert!(matches!(result, Err(DownloadError::OutputMissing(_))));
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }

    #[tokio::test]
    async fn unfinished_jobs_are_not_delivered() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(Some(b"bytes".as_slice()), JobStatus::Failed).await;

        let result = deliver(&job, artifacts, "clip").await;

        assert!(matches!(
            result,
            Err(DownloadError::NotSucceeded(JobStatus::Failed))
        ));
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }

    #[tokio::test]
    async fn finds_output_written_with_another_extension() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(None, JobStatus::Succeeded).await;
        std::fs::write(artifacts.job_dir().join("My_clip.webm"), b"webm-bytes").expect("write");

        let delivery = deliver(&job, artifacts, "My clip").await.expect("delivery");
        assert_eq!(delivery.filename(), "My_clip.webm");

        drop(delivery);
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }

    #[tokio::test]
    async fn streams_file_as_attachment_then_cleans_up() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(Some(b"video-bytes".as_slice()), JobStatus::Succeeded).await;

        let delivery = deliver(&job, artifacts, "Caf\u{e9} clip")
            .await
            .expect("delivery");
        let response = delivery.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[CONTENT_LENGTH], "11");
        assert_eq!(
            headers[CONTENT_DISPOSITION],
            "attachment; filename=\"Caf__clip.mp4\"; filename*=UTF-8''Caf%C3%A9%20clip.mp4"
        );
        assert_eq!(entry_count(scratch.root()), 2);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"video-bytes");
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }

    #[tokio::test]
    async fn aborted_transfer_still_cleans_up() {
        let Fixture {
            _dir,
            scratch,
            job,
            artifacts,
        } = fixture(Some(vec![7u8; 200_000].as_slice()), JobStatus::Succeeded).await;

        let mut delivery = deliver(&job, artifacts, "clip").await.expect("delivery");
        let first = delivery.stream.next().await.expect("chunk").expect("read");
        assert!(!first.is_empty());
        assert!(!delivery.stream.finished);

        drop(delivery);
        assert_eq!(settled_entry_count(scratch.root()).await, 0);
    }
}
