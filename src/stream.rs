use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, response::Builder, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::Stream;
use serde::Deserialize;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, FetchError, UpstreamError};
use crate::fetcher::ResilientFetcher;
use crate::metrics::{BYTES_SERVED, RESPONSES};
use crate::range::{parse_range, ByteRange, RangeRequest};
use crate::remote::{ByteStream, RemoteFileLocator};

const CACHE_CONTROL: &str = "private, max-age=0, must-revalidate";
const BANDWIDTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Image,
}

impl MediaKind {
    pub fn route(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        }
    }

    /// Audio is private to signed-in users; cover art is public.
    pub fn requires_auth(self) -> bool {
        matches!(self, MediaKind::Audio)
    }

    fn reports_rate_limit(self) -> bool {
        matches!(self, MediaKind::Audio)
    }

    pub fn content_type(self, name: &str) -> &'static str {
        match self {
            MediaKind::Audio => "audio/mpeg",
            MediaKind::Image => {
                let lower = name.to_ascii_lowercase();
                if lower.ends_with(".png") {
                    "image/png"
                } else if lower.ends_with(".gif") {
                    "image/gif"
                } else {
                    "image/jpeg"
                }
            }
        }
    }

    fn download_name(self, name: &str, id: &str) -> String {
        let name = if name.is_empty() { id } else { name };
        let has_extension = std::path::Path::new(name).extension().is_some();
        match self {
            MediaKind::Audio if !has_extension => format!("{name}.mp3"),
            _ => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// `Retry-After` sent with 429 responses.
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    /// Upper bound for resolving the file and opening the upstream stream.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

fn default_retry_after_secs() -> u64 {
    10
}

fn default_open_timeout_secs() -> u64 {
    30
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_after_secs: default_retry_after_secs(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

enum StreamFailure {
    NotFound,
    Unsatisfiable { size: u64 },
    Lookup(UpstreamError),
    Fetch(FetchError),
    TimedOut,
}

struct Opened {
    size: u64,
    name: String,
    range: Option<ByteRange>,
    stream: ByteStream,
}

/// Builds media responses on top of the remote store.
#[derive(Clone)]
pub struct MediaStreamer {
    locator: Arc<dyn RemoteFileLocator>,
    fetcher: ResilientFetcher,
    config: StreamConfig,
}

impl MediaStreamer {
    pub fn new(
        locator: Arc<dyn RemoteFileLocator>,
        fetcher: ResilientFetcher,
        config: StreamConfig,
    ) -> Self {
        Self {
            locator,
            fetcher,
            config,
        }
    }

    /// Metadata probe: headers for the whole file, no body.
    pub async fn head(&self, kind: MediaKind, id: &str) -> Response {
        let response = match self.locator.lookup(id).await {
            Ok(Some(file)) if file.size() > 0 => respond(
                media_headers(Response::builder().status(StatusCode::OK), kind, file.name(), id)
                    .header(header::CONTENT_LENGTH, file.size()),
                Body::empty(),
            ),
            Ok(_) => self.failure_response(kind, id, StreamFailure::NotFound),
            Err(e) => self.failure_response(kind, id, StreamFailure::Lookup(e)),
        };
        record(kind, &response);
        response
    }

    /// Full or ranged transfer, piping the upstream bytes straight through.
    pub async fn get(&self, kind: MediaKind, id: &str, range_header: Option<&str>) -> Response {
        let cancel = CancellationToken::new();
        // Dropping this (handler future dropped on disconnect, or the body
        // going away) cancels whatever is still waiting on the store.
        let guard = cancel.clone().drop_guard();
        let open_timeout = Duration::from_secs(self.config.open_timeout_secs);

        let opened = tokio::select! {
            res = self.open(id, range_header, &cancel) => res,
            _ = tokio::time::sleep(open_timeout) => {
                cancel.cancel();
                Err(StreamFailure::TimedOut)
            }
        };

        let response = match opened {
            Ok(opened) => self.body_response(kind, id, opened, guard),
            Err(failure) => self.failure_response(kind, id, failure),
        };
        record(kind, &response);
        response
    }

    async fn open(
        &self,
        id: &str,
        range_header: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Opened, StreamFailure> {
        let file = self
            .locator
            .lookup(id)
            .await
            .map_err(StreamFailure::Lookup)?
            .ok_or(StreamFailure::NotFound)?;

        let size = file.size();
        if size == 0 {
            return Err(StreamFailure::NotFound);
        }

        let range = match parse_range(range_header, size) {
            RangeRequest::Full => None,
            RangeRequest::Partial(r) => Some(r),
            RangeRequest::Unsatisfiable => return Err(StreamFailure::Unsatisfiable { size }),
        };

        let stream = self
            .fetcher
            .open(file.as_ref(), range, cancel)
            .await
            .map_err(StreamFailure::Fetch)?;

        Ok(Opened {
            size,
            name: file.name().to_string(),
            range,
            stream,
        })
    }

    fn body_response(
        &self,
        kind: MediaKind,
        id: &str,
        opened: Opened,
        guard: DropGuard,
    ) -> Response {
        let Opened {
            size,
            name,
            range,
            stream,
        } = opened;

        let (builder, length) = match range {
            Some(r) => (
                Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::CONTENT_RANGE, r.content_range(size)),
                r.len(),
            ),
            None => (Response::builder().status(StatusCode::OK), size),
        };

        info!(
            "Streaming {}: id={} range={} length={}",
            kind.route(),
            id,
            range.map(|r| r.header_value()).unwrap_or_else(|| "full".to_string()),
            length
        );

        let body = GuardedStream {
            _cancel_on_drop: guard,
            inner: stream,
            id: id.to_string(),
            kind,
            expected: length,
            sent: 0,
            finished: false,
            last_log_time: Instant::now(),
            bytes_since_last_log: 0,
        };

        respond(
            media_headers(builder, kind, &name, id).header(header::CONTENT_LENGTH, length),
            Body::from_stream(body),
        )
    }

    fn failure_response(&self, kind: MediaKind, id: &str, failure: StreamFailure) -> Response {
        match failure {
            StreamFailure::NotFound => {
                info!("Media not found: kind={} id={}", kind.route(), id);
                (StatusCode::NOT_FOUND, "File not found").into_response()
            }
            StreamFailure::Unsatisfiable { size } => {
                info!("Unsatisfiable range: kind={} id={} size={}", kind.route(), id, size);
                respond(
                    common_headers(Response::builder().status(StatusCode::RANGE_NOT_SATISFIABLE))
                        .header(header::CONTENT_RANGE, format!("bytes */{size}")),
                    Body::empty(),
                )
            }
            StreamFailure::Fetch(FetchError::Cancelled) => {
                debug!("Request cancelled before streaming: kind={} id={}", kind.route(), id);
                // Nobody is left to read this.
                StatusCode::from_u16(499)
                    .unwrap_or(StatusCode::BAD_REQUEST)
                    .into_response()
            }
            StreamFailure::TimedOut => {
                error!(
                    "Timed out opening upstream after {}s: kind={} id={}",
                    self.config.open_timeout_secs,
                    kind.route(),
                    id
                );
                (StatusCode::GATEWAY_TIMEOUT, "Upstream timed out").into_response()
            }
            StreamFailure::Lookup(err) => {
                error!("Lookup failed: kind={} id={} err={}", kind.route(), id, err);
                self.upstream_response(kind, err.kind)
            }
            StreamFailure::Fetch(err @ FetchError::Upstream { .. }) => {
                error!("Upstream fetch failed: kind={} id={} err={}", kind.route(), id, err);
                self.upstream_response(kind, err.kind().unwrap_or(FailureKind::Fatal))
            }
        }
    }

    fn upstream_response(&self, kind: MediaKind, failure: FailureKind) -> Response {
        match failure {
            FailureKind::RateLimited if kind.reports_rate_limit() => respond(
                Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .header(header::RETRY_AFTER, self.config.retry_after_secs),
                Body::from("Storage rate limited, try again later"),
            ),
            FailureKind::RateLimited | FailureKind::Transient => {
                (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
            }
            FailureKind::Fatal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

fn common_headers(builder: Builder) -> Builder {
    builder
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .header(header::ACCEPT_RANGES, "bytes")
        .header("X-Accel-Buffering", "no")
}

fn media_headers(builder: Builder, kind: MediaKind, name: &str, id: &str) -> Builder {
    let filename = urlencoding::encode(&kind.download_name(name, id)).into_owned();
    common_headers(builder)
        .header(header::CONTENT_TYPE, kind.content_type(name))
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{filename}\""),
        )
}

fn respond(builder: Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|e| {
        error!("Failed to build response: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn record(kind: MediaKind, response: &Response) {
    RESPONSES
        .with_label_values(&[kind.route(), response.status().as_str()])
        .inc();
}

/// Response body that owns the request's cancellation guard.
///
/// Dropping it (client disconnect) cancels the token, which tears down
/// anything still tied to the request.
struct GuardedStream {
    _cancel_on_drop: DropGuard,
    inner: ByteStream,
    id: String,
    kind: MediaKind,
    expected: u64,
    sent: u64,
    finished: bool,
    last_log_time: Instant,
    bytes_since_last_log: usize,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        match &res {
            Poll::Ready(Some(Ok(bytes))) => {
                let len = bytes.len();
                self.sent += len as u64;
                self.bytes_since_last_log += len;
                BYTES_SERVED
                    .with_label_values(&[self.kind.route()])
                    .inc_by(len as u64);

                let elapsed = self.last_log_time.elapsed();
                if elapsed >= BANDWIDTH_LOG_INTERVAL {
                    let rate_kb = (self.bytes_since_last_log as f64 / elapsed.as_secs_f64()) / 1024.0;
                    debug!("Stream bandwidth: id={} rate={:.2} KB/s", self.id, rate_kb);
                    self.last_log_time = Instant::now();
                    self.bytes_since_last_log = 0;
                }
            }
            Poll::Ready(Some(Err(e))) => {
                warn!("Upstream stream error: id={} sent={} err={}", self.id, self.sent, e);
            }
            Poll::Ready(None) => {
                self.finished = true;
                if self.sent < self.expected {
                    warn!(
                        "Stream ended early: id={} sent={} expected={}",
                        self.id, self.sent, self.expected
                    );
                }
            }
            Poll::Pending => {}
        }
        res
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Client disconnected: id={} sent={} expected={}",
                self.id, self.sent, self.expected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn guarded(cancel: &CancellationToken, inner: ByteStream) -> GuardedStream {
        GuardedStream {
            _cancel_on_drop: cancel.clone().drop_guard(),
            inner,
            id: "t".to_string(),
            kind: MediaKind::Audio,
            expected: 10,
            sent: 0,
            finished: false,
            last_log_time: Instant::now(),
            bytes_since_last_log: 0,
        }
    }

    #[tokio::test]
    async fn test_dropping_body_cancels_request() {
        let cancel = CancellationToken::new();
        let pending = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let body = guarded(&cancel, Box::pin(pending));
        drop(body);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_body_passes_chunks_through() {
        let cancel = CancellationToken::new();
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"hello")), Ok(Bytes::from_static(b"world"))];
        let body = guarded(&cancel, Box::pin(futures::stream::iter(chunks)));
        let got: Vec<Bytes> = body.map(|c| c.unwrap()).collect().await;
        assert_eq!(got, vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(MediaKind::Audio.content_type("a.flac"), "audio/mpeg");
        assert_eq!(MediaKind::Image.content_type("cover.PNG"), "image/png");
        assert_eq!(MediaKind::Image.content_type("anim.gif"), "image/gif");
        assert_eq!(MediaKind::Image.content_type("photo.webp"), "image/jpeg");
        assert_eq!(MediaKind::Image.content_type(""), "image/jpeg");
    }

    #[test]
    fn test_download_names() {
        assert_eq!(MediaKind::Audio.download_name("song.mp3", "id1"), "song.mp3");
        assert_eq!(MediaKind::Audio.download_name("song", "id1"), "song.mp3");
        assert_eq!(MediaKind::Audio.download_name("", "id1"), "id1.mp3");
        assert_eq!(MediaKind::Image.download_name("", "id2"), "id2");
    }

    #[test]
    fn test_disposition_is_percent_encoded() {
        let builder = media_headers(Response::builder(), MediaKind::Audio, "Tên bài hát.mp3", "x");
        let response = respond(builder, Body::empty());
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"T%C3%AAn%20b%C3%A0i%20h%C3%A1t.mp3\""
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], CACHE_CONTROL);
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    }
}
