//! Ranged HTTP GETs of texture assets.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::runtime::Runtime;

use crate::error::TransportError;

pub const HTTP_PARTIAL_CONTENT: u16 = 206;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;
pub const HTTP_SERVICE_UNAVAILABLE: u16 = 503;

const TEXTURE_MIME: &str = "image/x-j2c";

pub type HttpCallback = Box<dyn FnOnce(Result<HttpReply, TransportError>) + Send + 'static>;

/// GET of `size` bytes starting at `offset`, or of everything after `offset` without a size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub url: String,
    pub offset: usize,
    pub size: Option<usize>,
}

impl RangeRequest {
    /// Value of the `Range` header, if the request needs one.
    pub fn header_value(&self) -> Option<String> {
        match self.size {
            Some(0) => None,
            Some(size) => Some(format!("bytes={}-{}", self.offset, self.offset + size - 1)),
            None if self.offset > 0 => Some(format!("bytes={}-", self.offset)),
            None => None,
        }
    }
}

/// Parsed `Content-Range: bytes first-last/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub first: usize,
    pub last: usize,
    /// Full length of the asset, if the server knows it.
    pub total: Option<usize>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let range = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = range.split_once('/')?;
        let (first, last) = span.split_once('-')?;
        let first = first.trim().parse().ok()?;
        let last = last.trim().parse().ok()?;
        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        };
        if last < first || total.is_some_and(|total| last >= total) {
            return None;
        }
        Some(Self { first, last, total })
    }

    /// Number of bytes the range covers.
    pub fn length(&self) -> usize {
        self.last - self.first + 1
    }
}

/// Successful reply. Error statuses come back as [`TransportError::Status`].
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub content_range: Option<ContentRange>,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_partial(&self) -> bool {
        self.status == HTTP_PARTIAL_CONTENT
    }
}

/// Issues ranged GETs and reports each outcome through a callback, from any thread.
pub trait HttpTransport: Send + Sync {
    fn get(&self, request: RangeRequest, on_done: HttpCallback);
}

/// [`HttpTransport`] on a reqwest client driven by its own runtime.
pub struct ReqwestTransport {
    runtime: Option<Runtime>,
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(worker_threads: usize, timeout: Duration) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("texture-http")
            .enable_all()
            .build()
            .map_err(|err| TransportError::Connection(format!("HTTP runtime: {err}")))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            runtime: Some(runtime),
            client,
        })
    }

    async fn fetch(
        client: reqwest::Client,
        request: RangeRequest,
    ) -> Result<HttpReply, TransportError> {
        let mut builder = client.get(&request.url).header(ACCEPT, TEXTURE_MIME);
        if let Some(range) = request.header_value() {
            builder = builder.header(RANGE, range);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                retry_after: retry_after(response.headers()),
            });
        }

        let content_range = if status == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(ContentRange::parse)
        } else {
            None
        };
        let body = response.bytes().await?;
        Ok(HttpReply {
            status: status.as_u16(),
            content_range,
            body,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, request: RangeRequest, on_done: HttpCallback) {
        let Some(runtime) = self.runtime.as_ref() else {
            on_done(Err(TransportError::Cancelled));
            return;
        };
        let client = self.client.clone();
        runtime.spawn(async move {
            log::trace!("GET {} {:?}", request.url, request.header_value());
            on_done(Self::fetch(client, request).await);
        });
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Delay from a `Retry-After: <seconds>` header.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse().ok().map(Duration::from_secs)
}
