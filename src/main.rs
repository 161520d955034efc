use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use yt_mp3_gateway::{
    AppState, build_cors_layer, build_router,
    config::Config,
    error::ApiError,
    extractor::{Extractor, YtDlpExtractor},
    store::ArtifactStore,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "yt_mp3_gateway=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    let store = ArtifactStore::open(&config.artifact_dir, config.artifact_prefix.clone())
        .await
        .map_err(|error| ApiError::internal(format!("Could not prepare artifact storage: {error}")))?;
    let store = Arc::new(store);

    let swept = store.sweep_expired(config.artifact_max_age).await;
    let adopted = store.adopt_existing().await.map_err(|error| {
        ApiError::internal(format!("Could not index existing artifacts: {error}"))
    })?;
    info!(
        "Artifact store at {:?}: {swept} expired file(s) removed, {adopted} kept",
        store.dir()
    );
    if let Some(every) = config.sweep_interval {
        store.spawn_sweeper(every, config.artifact_max_age);
    } else {
        warn!("SWEEP_INTERVAL_SECONDS=0: expired artifacts are only removed at startup.");
    }

    let yt_dlp = YtDlpExtractor::from_config(&config);
    match yt_dlp.version().await {
        Ok(version) => info!("Using {} {version}", config.yt_dlp_bin),
        Err(error) => warn!(
            "{} is not usable, conversions will fail: {}",
            config.yt_dlp_bin,
            error.detail()
        ),
    }
    let extractor: Arc<dyn Extractor> = Arc::new(yt_dlp);

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(AppState::from_config(&config, store, extractor), cors);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("YouTube MP3 gateway listening on http://{}", config.bind_addr);
    info!(
        "Convert: http://{}/api/convert?url=YOUTUBE_URL",
        config.public_host
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
