use std::{any::Any, collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    http::{HeaderValue, Method, StatusCode, header::CONTENT_DISPOSITION},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{self, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};
use url::Url;

use crate::{
    config::Config, error::ApiError, extractor::Extractor, routes, store::ArtifactStore,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub extractor: Arc<dyn Extractor>,
    pub download_grace: Duration,
    pub trust_proxy_headers: bool,
    pub public_host: String,
}

impl AppState {
    pub fn from_config(
        config: &Config,
        store: Arc<ArtifactStore>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            store,
            extractor,
            download_grace: config.download_grace,
            trust_proxy_headers: config.trust_proxy_headers,
            public_host: config.public_host.clone(),
        }
    }
}

pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(routes::service_descriptor))
        .route("/api/convert", get(routes::convert))
        .route("/download/{file_id}", get(routes::download))
        .fallback(routes::not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    error!("Unhandled error while serving request: {detail}");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "Internal server error",
            "message": "Something went wrong on the server",
        })),
    )
        .into_response()
}

/// Any origin when `origins` is empty, otherwise an exact allow-list.
pub fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(cors::Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if origins.is_empty() {
        info!("ALLOWED_ORIGINS not set, accepting requests from any origin.");
        return Ok(layer.allow_origin(cors::Any));
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });

    Ok(layer.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
