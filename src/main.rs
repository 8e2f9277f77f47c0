mod api;
mod bus;
mod catalog;
mod config;
mod cookies;
mod delivery;
mod error;
mod progress;
mod scratch;
mod selector;
mod supervisor;
#[cfg(test)]
mod testing;
mod ytdlp;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    api::{AppState, build_cors_layer, router},
    config::Config,
    error::ApiError,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidpull=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env()?;
    let state = AppState::from_config(&config);

    state.scratch().ensure().await.map_err(|error| {
        ApiError::internal(format!(
            "Could not create scratch dir {:?}: {error}",
            state.scratch().root()
        ))
    })?;
    state.scratch().sweep_stale(config.stale_scratch_after).await;

    info!(
        "yt-dlp command: {:?} {:?}, metadata timeout {:?}, download timeout {:?}",
        config.tool.program,
        config.tool.leading_args,
        config.metadata_timeout,
        config.download_timeout
    );
    match config.max_concurrent_downloads {
        Some(limit) => info!("at most {limit} concurrent downloads"),
        None => warn!("MAX_CONCURRENT_DOWNLOADS is not set, downloads are unbounded"),
    }
    if config.tool.js_runtime.is_none() {
        warn!("YT_DLP_JS_RUNTIME is not set, yt-dlp picks its own JavaScript runtime");
    }

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&config.allowed_origins));

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("could not listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
