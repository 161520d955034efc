use std::{
    io::{self, ErrorKind},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{fs::File, time::Duration};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    app::AppState,
    config::non_empty,
    error::ApiError,
    extractor::VideoMetadata,
    store::ArtifactStore,
    youtube::{extract_video_id, validate_url, watch_url},
};

pub const EXTRACTION_METHOD: &str = "yt-dlp";

#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    success: bool,
    title: String,
    duration: Option<u64>,
    duration_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    download_url: String,
    video_id: String,
    #[serde(rename = "fileSizeMB")]
    file_size_mb: f64,
    method: &'static str,
    status: &'static str,
}

pub async fn service_descriptor() -> Json<Value> {
    Json(json!({
        "name": "YouTube to MP3 Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "method": EXTRACTION_METHOD,
        "endpoints": {
            "convert": "/api/convert?url={youtube_url}",
            "download": "/download/{fileId}",
        },
    }))
}

pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "available": ["/", "/api/convert", "/download/:fileId"],
        })),
    )
}

pub async fn convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConvertQuery>,
) -> Result<Json<ConversionResult>, ApiError> {
    let url = query
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("YouTube URL parameter is required"))?;
    if !validate_url(url) {
        return Err(ApiError::bad_request("Invalid YouTube URL format"));
    }
    let video_id = extract_video_id(url)
        .ok_or_else(|| ApiError::bad_request("Could not extract video ID from URL"))?;

    info!("Converting {video_id} from {url:?}");
    let source_url = watch_url(&video_id);
    let reservation = state.store.reserve(&video_id).await;

    let (extraction, metadata) = tokio::join!(
        state
            .extractor
            .extract_audio(&source_url, &reservation.stem),
        state.extractor.fetch_metadata(&source_url),
    );

    let path = match extraction {
        Ok(path) => path,
        Err(error) => {
            warn!("Extraction failed for {video_id}: {error} ({})", error.detail());
            state.store.discard(reservation).await;
            return Err(error.into());
        }
    };
    let artifact = state.store.commit(reservation, &path).await?;

    let metadata = metadata.unwrap_or_else(|error| {
        warn!(
            "Metadata unavailable for {video_id}, using fallback title: {error} ({})",
            error.detail()
        );
        VideoMetadata::default()
    });
    let title = metadata
        .title
        .unwrap_or_else(|| format!("YouTube Audio {video_id}"));
    let download_url = format!(
        "{}/download/{}",
        public_base_url(&state, &headers),
        artifact.file_key
    );

    info!(
        "Converted {video_id}: {:?} ({} bytes) -> {}",
        title, artifact.size, artifact.file_key
    );

    Ok(Json(ConversionResult {
        success: true,
        title,
        duration: metadata.duration_seconds,
        duration_text: metadata.duration_seconds.map(format_duration),
        channel: metadata.channel,
        download_url,
        video_id,
        file_size_mb: artifact.size_mb(),
        method: EXTRACTION_METHOD,
        status: "ready",
    }))
}

pub async fn download(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::not_found("File not found or expired");
    let artifact = state.store.find(&file_id).await.ok_or_else(not_found)?;

    let file = match File::open(&artifact.path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            warn!("Indexed artifact {:?} is missing on disk", artifact.path);
            state.store.remove(&artifact.file_key).await;
            return Err(not_found());
        }
        Err(error) => {
            return Err(ApiError::internal("Failed to read audio file").with_details(&error.to_string()));
        }
    };
    let content_length = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(_) => artifact.size,
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&download_filename(&file_id)))
            .map_err(|_| ApiError::internal("Failed to build download headers"))?,
    );

    info!(
        "Streaming {} ({content_length} bytes) for {file_id:?}",
        artifact.file_key
    );
    let body = Body::from_stream(ServedArtifact::new(
        ReaderStream::new(file),
        Arc::clone(&state.store),
        artifact.file_key,
        content_length,
        state.download_grace,
    ));

    Ok((headers, body).into_response())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Transfer {
    Streaming,
    Completed,
    Failed,
}

/// Response body over an artifact file. Handing out the last of the
/// advertised `Content-Length` bytes schedules the artifact's deletion; a
/// failed or abandoned transfer keeps it for a retry until the sweep
/// collects it.
///
/// Completion is decided by byte count because hyper stops polling a body
/// once `Content-Length` bytes are written, so end of stream is never seen
/// on a real connection.
struct ServedArtifact {
    inner: ReaderStream<File>,
    store: Arc<ArtifactStore>,
    file_key: String,
    expected: u64,
    grace: Duration,
    sent: u64,
    transfer: Transfer,
}

impl ServedArtifact {
    fn new(
        inner: ReaderStream<File>,
        store: Arc<ArtifactStore>,
        file_key: String,
        expected: u64,
        grace: Duration,
    ) -> Self {
        Self {
            inner,
            store,
            file_key,
            expected,
            grace,
            sent: 0,
            transfer: Transfer::Streaming,
        }
    }

    fn complete(&mut self) {
        self.transfer = Transfer::Completed;
        info!("Download of {} completed ({} bytes)", self.file_key, self.sent);
        self.store
            .delete_after_serve(self.file_key.clone(), self.grace);
    }
}

impl Stream for ServedArtifact {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.transfer != Transfer::Streaming {
            return Poll::Ready(None);
        }

        let poll = Pin::new(&mut this.inner).poll_next(cx);
        match &poll {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                if this.sent >= this.expected {
                    this.complete();
                }
            }
            Poll::Ready(Some(Err(error))) => {
                warn!(
                    "Read error while streaming {} after {} bytes: {error}",
                    this.file_key, this.sent
                );
                this.transfer = Transfer::Failed;
            }
            Poll::Ready(None) => {
                if this.sent >= this.expected {
                    this.complete();
                } else {
                    warn!(
                        "Artifact {} ended after {} of {} bytes, keeping it",
                        this.file_key, this.sent, this.expected
                    );
                    this.transfer = Transfer::Failed;
                }
            }
            Poll::Pending => {}
        }
        poll
    }
}

impl Drop for ServedArtifact {
    fn drop(&mut self) {
        if self.transfer == Transfer::Streaming {
            info!(
                "Download of {} aborted by the client after {} of {} bytes, keeping artifact",
                self.file_key, self.sent, self.expected
            );
        }
    }
}

/// Attachment name: the part of the file id before the first underscore.
pub fn download_filename(file_id: &str) -> String {
    let base = file_id.split('_').next().unwrap_or_default();
    let base = sanitize_ascii_filename(base);
    if base.is_empty() {
        "audio.mp3".to_string()
    } else {
        format!("{base}.mp3")
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// `m:ss` below an hour, `h:mm:ss` above.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn public_base_url(state: &AppState, headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(non_empty)
            .map(ToString::to_string)
    };

    let (forwarded_proto, forwarded_host) = if state.trust_proxy_headers {
        (header("x-forwarded-proto"), header("x-forwarded-host"))
    } else {
        (None, None)
    };

    let scheme = forwarded_proto
        .filter(|value| matches!(value.as_str(), "http" | "https"))
        .unwrap_or_else(|| "http".to_string());
    let host = forwarded_host
        .or_else(|| header("host"))
        .unwrap_or_else(|| state.public_host.clone());

    format!("{scheme}://{host}")
}
