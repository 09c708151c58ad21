use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::error::UpstreamError;
use crate::range::ByteRange;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// How aggressively the store may parallelize a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Normal,
    /// Single connection; requested on retries to back off from rate limits.
    Conservative,
}

/// A file in the remote store, resolved for the lifetime of one request.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    fn id(&self) -> &str;
    fn size(&self) -> u64;
    fn name(&self) -> &str;

    /// Open `range` (or the whole file for `None`) as a byte stream.
    async fn open_range(
        &self,
        range: Option<ByteRange>,
        mode: TransferMode,
    ) -> Result<ByteStream, UpstreamError>;
}

#[async_trait]
pub trait RemoteFileLocator: Send + Sync {
    /// `Ok(None)` means the id is unknown to the store.
    async fn lookup(&self, id: &str) -> Result<Option<Box<dyn RemoteFile>>, UpstreamError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpStoreConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    15
}

#[derive(Deserialize)]
struct NodeMetadata {
    size: u64,
    #[serde(default)]
    name: Option<String>,
}

/// Blob gateway spoken over HTTP.
///
/// `GET {base}/nodes/{id}` answers with `{"size": .., "name": ..}`, and
/// `GET {base}/nodes/{id}/content` serves the bytes, honoring `Range`.
#[derive(Clone)]
pub struct HttpBlobStore {
    inner: Arc<HttpStoreInner>,
}

struct HttpStoreInner {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    request_timeout: Duration,
}

impl HttpBlobStore {
    pub fn new(config: &HttpStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            inner: Arc::new(HttpStoreInner {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_token: config.api_token.clone(),
                request_timeout: Duration::from_secs(config.request_timeout_secs),
            }),
        })
    }
}

impl HttpStoreInner {
    fn node_url(&self, id: &str) -> String {
        format!("{}/nodes/{}", self.base_url, urlencoding::encode(id))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteFileLocator for HttpBlobStore {
    async fn lookup(&self, id: &str) -> Result<Option<Box<dyn RemoteFile>>, UpstreamError> {
        let inner = &self.inner;
        let req = inner
            .client
            .get(inner.node_url(id))
            .timeout(inner.request_timeout);
        let resp = inner.authorize(req).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(UpstreamError::from_status(resp.status(), "metadata lookup"));
        }

        let body = resp.bytes().await?;
        let meta: NodeMetadata = serde_json::from_slice(&body)
            .map_err(|e| UpstreamError::transient(format!("invalid response: {e}")))?;

        Ok(Some(Box::new(HttpRemoteFile {
            store: Arc::clone(&self.inner),
            id: id.to_string(),
            size: meta.size,
            name: meta.name.unwrap_or_default(),
        })))
    }
}

struct HttpRemoteFile {
    store: Arc<HttpStoreInner>,
    id: String,
    size: u64,
    name: String,
}

#[async_trait]
impl RemoteFile for HttpRemoteFile {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn open_range(
        &self,
        range: Option<ByteRange>,
        mode: TransferMode,
    ) -> Result<ByteStream, UpstreamError> {
        let mut req = self
            .store
            .client
            .get(format!("{}/content", self.store.node_url(&self.id)));
        if let Some(range) = range {
            req = req.header(reqwest::header::RANGE, range.header_value());
        }
        if mode == TransferMode::Conservative {
            req = req.query(&[("connections", "1")]);
        }

        let resp = self.store.authorize(req).send().await?;
        let status = resp.status();
        debug!("Upstream open: id={} status={} mode={:?}", self.id, status, mode);

        let body: ByteStream = Box::pin(
            resp.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        match (range, status) {
            (Some(_), StatusCode::PARTIAL_CONTENT) | (None, StatusCode::OK) => Ok(body),
            (Some(range), StatusCode::OK) => {
                debug!(
                    "Upstream ignored Range, slicing locally: id={} range={}",
                    self.id,
                    range.header_value()
                );
                Ok(slice_full_body(body, range))
            }
            _ => Err(UpstreamError::from_status(status, "content download")),
        }
    }
}

/// Cut `range` out of a stream carrying the whole file.
fn slice_full_body(body: ByteStream, range: ByteRange) -> ByteStream {
    let state = (body, range.start(), range.len());
    Box::pin(stream::unfold(state, |(mut body, mut skip, mut remaining)| async move {
        while remaining > 0 {
            let mut bytes = match body.next().await? {
                Ok(bytes) => bytes,
                Err(e) => return Some((Err(e), (body, 0, 0))),
            };
            let dropped = skip.min(bytes.len() as u64);
            let _ = bytes.split_to(dropped as usize);
            skip -= dropped;

            let kept = remaining.min(bytes.len() as u64);
            bytes.truncate(kept as usize);
            if bytes.is_empty() {
                continue;
            }
            remaining -= kept;
            return Some((Ok(bytes), (body, skip, remaining)));
        }
        None
    }))
}

const MEMORY_CHUNK_SIZE: usize = 64 * 1024;

/// In-process store, mostly for local runs and tests.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    files: Arc<HashMap<String, Arc<MemoryFile>>>,
}

struct MemoryFile {
    name: String,
    data: Bytes,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let file = Arc::new(MemoryFile {
            name: name.into(),
            data: data.into(),
        });
        Arc::make_mut(&mut self.files).insert(id.into(), file);
        self
    }
}

#[async_trait]
impl RemoteFileLocator for MemoryBlobStore {
    async fn lookup(&self, id: &str) -> Result<Option<Box<dyn RemoteFile>>, UpstreamError> {
        Ok(self.files.get(id).map(|file| {
            Box::new(MemoryRemoteFile {
                id: id.to_string(),
                file: Arc::clone(file),
            }) as Box<dyn RemoteFile>
        }))
    }
}

struct MemoryRemoteFile {
    id: String,
    file: Arc<MemoryFile>,
}

#[async_trait]
impl RemoteFile for MemoryRemoteFile {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.file.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.file.name
    }

    async fn open_range(
        &self,
        range: Option<ByteRange>,
        _mode: TransferMode,
    ) -> Result<ByteStream, UpstreamError> {
        let data = match range {
            Some(r) => {
                let (start, end) = (r.start() as usize, r.end() as usize);
                if end >= self.file.data.len() {
                    return Err(UpstreamError::fatal(format!(
                        "range {}-{} outside of {} bytes",
                        start,
                        end,
                        self.file.data.len()
                    )));
                }
                self.file.data.slice(start..=end)
            }
            None => self.file.data.clone(),
        };

        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..data.len())
            .step_by(MEMORY_CHUNK_SIZE)
            .map(|offset| Ok(data.slice(offset..(offset + MEMORY_CHUNK_SIZE).min(data.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}
