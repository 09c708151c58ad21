pub mod auth;
pub mod cues;
pub mod error;
pub mod fetcher;
pub mod lrc;
pub mod metrics;
pub mod range;
pub mod remote;
pub mod stream;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use auth::Authorizer;
use cues::{ActiveCue, LyricTrack};
use lrc::LineCue;
use stream::{MediaKind, MediaStreamer};

struct AppState {
    streamer: MediaStreamer,
    authorizer: Arc<dyn Authorizer>,
}

pub fn create_app(streamer: MediaStreamer, authorizer: Arc<dyn Authorizer>) -> Router {
    let state = Arc::new(AppState {
        streamer,
        authorizer,
    });

    Router::new()
        .route(
            "/stream/audio/{id}",
            get(audio_get_handler).head(audio_head_handler),
        )
        .route(
            "/stream/image/{id}",
            get(image_get_handler).head(image_head_handler),
        )
        .route("/api/lyrics/preview", post(lyrics_preview_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method,
        uri,
        user_agent(&headers)
    );
    (StatusCode::NOT_FOUND, "Not found")
}

fn unauthorized(state: &AppState, kind: MediaKind, headers: &HeaderMap) -> Option<Response> {
    if kind.requires_auth() && !state.authorizer.authorize(headers) {
        return Some((StatusCode::UNAUTHORIZED, "Unauthorized").into_response());
    }
    None
}

async fn serve_head(state: &AppState, kind: MediaKind, id: &str, headers: &HeaderMap) -> Response {
    if let Some(denied) = unauthorized(state, kind, headers) {
        return denied;
    }
    info!("HTTP {} probe: id={} UA=\"{}\"", kind.route(), id, user_agent(headers));
    state.streamer.head(kind, id).await
}

async fn serve_get(state: &AppState, kind: MediaKind, id: &str, headers: &HeaderMap) -> Response {
    if let Some(denied) = unauthorized(state, kind, headers) {
        return denied;
    }
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    info!(
        "HTTP {} request: id={} Range=\"{}\" UA=\"{}\"",
        kind.route(),
        id,
        range.unwrap_or("<none>"),
        user_agent(headers)
    );
    state.streamer.get(kind, id, range).await
}

async fn audio_head_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    serve_head(&state, MediaKind::Audio, &id, &headers).await
}

async fn audio_get_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    serve_get(&state, MediaKind::Audio, &id, &headers).await
}

async fn image_head_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    serve_head(&state, MediaKind::Image, &id, &headers).await
}

async fn image_get_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    serve_get(&state, MediaKind::Image, &id, &headers).await
}

#[derive(Deserialize)]
struct LyricsPreviewRequest {
    text: String,
    #[serde(default)]
    position: Option<f64>,
}

#[derive(Serialize)]
struct LyricsPreview {
    synced: bool,
    lines: Vec<LineCue>,
    active: Option<ActiveCue>,
}

async fn lyrics_preview_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<LyricsPreviewRequest>,
) -> Response {
    if !state.authorizer.authorize(&headers) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let track = LyricTrack::parse(&payload.text);
    let active = payload.position.and_then(|t| track.active_at(t));
    info!(
        "Lyrics preview: lines={} synced={} active={:?}",
        track.lines().len(),
        track.is_synced(),
        active
    );

    Json(LyricsPreview {
        synced: track.is_synced(),
        lines: track.lines().to_vec(),
        active,
    })
    .into_response()
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
