use std::{path::Path, sync::Arc};

use axum::{
    Form, Json, Router,
    extract::{
        FromRequest, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{
        HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    bus::ProgressBus,
    catalog::{CatalogResolver, VideoMetadata},
    config::{Config, normalize_origin},
    cookies::{CookieStaging, StagedCookies},
    delivery::{JobArtifacts, deliver, sanitize_title},
    error::{ApiError, DownloadError},
    progress::{ProgressEvent, YtDlpProgressParser},
    scratch::ScratchDir,
    selector::resolve_selector,
    supervisor::{DownloadJob, DownloadSupervisor},
    ytdlp::MERGE_OUTPUT_FORMAT,
};

#[derive(Clone)]
pub struct AppState {
    catalog: Arc<CatalogResolver>,
    supervisor: Arc<DownloadSupervisor>,
    bus: ProgressBus,
    scratch: ScratchDir,
    cookies: CookieStaging,
    download_slots: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        let scratch = ScratchDir::new(config.scratch_dir.clone());

        Self {
            catalog: Arc::new(CatalogResolver::new(
                config.tool.clone(),
                config.metadata_timeout,
            )),
            supervisor: Arc::new(DownloadSupervisor::new(
                config.tool.clone(),
                Arc::new(YtDlpProgressParser),
                config.download_timeout,
            )),
            bus: ProgressBus::default(),
            cookies: CookieStaging::new(scratch.clone()),
            scratch,
            download_slots: config
                .max_concurrent_downloads
                .map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/health", get(health))
        .route("/info", post(fetch_info))
        .route("/api/info", post(fetch_info))
        .route("/download", post(start_download))
        .route("/api/download", post(start_download))
        .route("/progress", get(progress_socket))
        .route("/api/progress", get(progress_socket))
        .with_state(state)
}

/// An empty allow-list accepts any origin.
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.is_empty() {
        warn!("ALLOWED_ORIGINS is not set, accepting requests from any origin");
        AllowOrigin::from(Any)
    } else {
        info!("CORS allow-list: {:?}", allowed_origins);
        let allowed_origins = allowed_origins.to_vec();
        AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!("CORS origin {:?} allowed={}", origin, allowed);
            allowed
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static("x-download-filename"),
        ])
}

/// A request body sent either as JSON or as an HTML form.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned + 'static,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
            Ok(Self(value))
        } else {
            let Json(value) = Json::<T>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
            Ok(Self(value))
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: Option<String>,
    cookies: Option<String>,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    #[serde(flatten)]
    metadata: VideoMetadata,
    age_restricted: bool,
    available_heights: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    #[serde(alias = "format")]
    format_id: Option<String>,
    quality: Option<String>,
    title: Option<String>,
    cookies: Option<String>,
    #[serde(alias = "socketId")]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ChannelMessage {
    Session { session_id: Uuid },
    Progress(ProgressEvent),
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Accepts absolute http(s) URLs only.
fn validate_url(raw: Option<&str>) -> Result<String, DownloadError> {
    let url = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DownloadError::InvalidInput("Missing URL".to_string()))?;

    let parsed = Url::parse(url)
        .map_err(|_| DownloadError::InvalidInput("Invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(DownloadError::InvalidInput(
            "Only http and https URLs are supported".to_string(),
        ));
    }

    Ok(url.to_string())
}

async fn fetch_info(
    State(state): State<AppState>,
    Payload(request): Payload<InfoRequest>,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = validate_url(request.url.as_deref())?;
    let cookies = state.cookies.stage(request.cookies.as_deref()).await?;

    let metadata = state
        .catalog
        .resolve(&url, cookies.as_ref().map(StagedCookies::path))
        .await?;

    Ok(Json(InfoResponse {
        age_restricted: metadata.is_age_restricted(),
        available_heights: metadata.available_heights(),
        metadata,
    }))
}

async fn start_download(
    State(state): State<AppState>,
    Payload(request): Payload<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = validate_url(request.url.as_deref())?;
    let selector = resolve_selector(request.format_id.as_deref(), request.quality.as_deref())?;
    let session_id = request
        .session_id
        .as_deref()
        .and_then(|value| Uuid::parse_str(value.trim()).ok());
    if request.session_id.is_some() && session_id.is_none() {
        debug!("ignoring malformed session id {:?}", request.session_id);
    }

    let _download_slot = match &state.download_slots {
        Some(slots) => Some(
            Arc::clone(slots)
                .acquire_owned()
                .await
                .map_err(|_| ApiError::internal("Download capacity is unavailable"))?,
        ),
        None => None,
    };

    let cookies = state.cookies.stage(request.cookies.as_deref()).await?;
    let job_id = Uuid::new_v4();
    let job_dir = state
        .scratch
        .create_job_dir(job_id)
        .await
        .map_err(DownloadError::Io)?;
    let artifacts = JobArtifacts::new(job_dir, cookies);

    let title = request.title.unwrap_or_default();
    let output_path = artifacts
        .job_dir()
        .join(format!("{}.{MERGE_OUTPUT_FORMAT}", sanitize_title(&title)));
    let mut job = DownloadJob::new(job_id, url, selector, output_path)
        .with_cookies(artifacts.cookie_path().map(Path::to_path_buf))
        .with_session(session_id);

    let cancel = match session_id.and_then(|id| state.bus.cancellation(id)) {
        Some(token) => token,
        None => {
            if let Some(id) = session_id {
                debug!(session = %id, "progress session not connected, job runs unobserved");
            }
            CancellationToken::new()
        }
    };

    state.supervisor.run(&mut job, &state.bus, &cancel).await?;
    let delivery = deliver(&job, artifacts, &title).await?;

    Ok(delivery.into_response())
}

async fn progress_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_progress(socket, state.bus))
}

async fn stream_progress(mut socket: WebSocket, bus: ProgressBus) {
    let mut subscription = bus.register();
    info!(
        session = %subscription.id(),
        "progress client connected ({} sessions)",
        bus.session_count()
    );
    let greeting = ChannelMessage::Session {
        session_id: subscription.id(),
    };
    if send_message(&mut socket, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if send_message(&mut socket, &ChannelMessage::Progress(event)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_message(socket: &mut WebSocket, message: &ChannelMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
