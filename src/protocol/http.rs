//! Reference HTTP(S) binding.
//!
//! Resume uses `Range: bytes=<offset>-`; ranged-resume support is read from
//! the `Accept-Ranges: bytes` response header.

use super::{Connection, Protocol};
use crate::downloader::TransferError;
use crate::models::RequestSpec;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_RANGE, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};

const MAX_REDIRECTS: usize = 10;

/// HTTP hook-set. Every connection gets its own client; nothing is pooled
/// across transfers.
#[derive(Debug, Clone)]
pub struct HttpProtocol {
    user_agent: String,
    system_proxy: bool,
}

impl HttpProtocol {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            system_proxy: true,
        }
    }

    /// Connects directly, ignoring proxies configured in the environment.
    pub fn without_system_proxy(mut self) -> Self {
        self.system_proxy = false;
        self
    }
}

impl Default for HttpProtocol {
    fn default() -> Self {
        Self::new(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
    }
}

/// One HTTP exchange. The request is sent lazily on first use.
pub struct HttpConnection {
    request: Option<RequestBuilder>,
    resume_offset: Option<u64>,
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    content_length: Option<u64>,
    accepts_ranges: bool,
    pending: Bytes,
}

impl HttpConnection {
    fn new(request: RequestBuilder) -> Self {
        Self {
            request: Some(request),
            resume_offset: None,
            body: None,
            content_length: None,
            accepts_ranges: false,
            pending: Bytes::new(),
        }
    }

    /// Sends the request if that has not happened yet.
    async fn connect(&mut self) -> Result<(), TransferError> {
        if let Some(request) = self.request.take() {
            let response = request.send().await?;
            self.accept(response)?;
        }
        Ok(())
    }

    fn accept(&mut self, response: Response) -> Result<(), TransferError> {
        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && self.resumes_at_end(response.headers()) {
            tracing::debug!(offset = ?self.resume_offset, "Nothing left to fetch");
            self.body = Some(stream::empty::<reqwest::Result<Bytes>>().boxed());
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransferError::Status(status));
        }
        let resumed = self.resume_offset.filter(|offset| *offset > 0);
        if let Some(offset) = resumed {
            if status != StatusCode::PARTIAL_CONTENT {
                return Err(TransferError::RangeIgnored { offset });
            }
            if let Some(start) = content_range(response.headers()).and_then(|r| r.start) {
                if start != offset {
                    return Err(TransferError::RangeIgnored { offset });
                }
            }
        }
        // A validated 206 proves range support even when Accept-Ranges is absent.
        self.accepts_ranges = resumed.is_some() || accepts_byte_ranges(response.headers());
        self.content_length = response.content_length();
        tracing::debug!(
            url = %response.url(),
            %status,
            content_length = ?self.content_length,
            accepts_ranges = self.accepts_ranges,
            "HTTP response received"
        );
        self.body = Some(response.bytes_stream().boxed());
        Ok(())
    }

    /// Whether a refused range asked for exactly the end of the resource.
    fn resumes_at_end(&self, headers: &HeaderMap) -> bool {
        match (self.resume_offset, content_range(headers)) {
            (Some(offset), Some(range)) => range.total == Some(offset),
            _ => false,
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn content_length(&mut self) -> Result<Option<u64>, TransferError> {
        self.connect().await?;
        Ok(self.content_length)
    }

    async fn read_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransferError> {
        self.connect().await?;
        while self.pending.is_empty() {
            let body = self
                .body
                .as_mut()
                .ok_or_else(|| TransferError::Protocol("connection already closed".into()))?;
            match body.next().await {
                Some(chunk) => self.pending = chunk?,
                None => return Ok(None),
            }
        }
        let len = max_len.max(1).min(self.pending.len());
        Ok(Some(self.pending.split_to(len)))
    }
}

#[async_trait]
impl Protocol for HttpProtocol {
    type Connection = HttpConnection;

    async fn open(&self, spec: &RequestSpec) -> Result<HttpConnection, TransferError> {
        let redirect = if spec.follow_redirects() {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        };
        let mut builder = Client::builder()
            .user_agent(self.user_agent.as_str())
            .connect_timeout(spec.connection_timeout())
            .redirect(redirect);
        if !self.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        Ok(HttpConnection::new(client.get(spec.url().clone())))
    }

    fn supports_ranged_resume(&self, conn: &HttpConnection) -> bool {
        conn.accepts_ranges
    }

    fn apply_resume_offset(&self, conn: &mut HttpConnection, offset: u64) {
        match conn.request.take() {
            Some(request) => {
                conn.request = Some(request.header(RANGE, range_header(offset)));
                conn.resume_offset = Some(offset);
            }
            None => tracing::warn!(offset, "Resume offset ignored: request already sent"),
        }
    }

    async fn close(&self, mut conn: HttpConnection) {
        conn.request = None;
        conn.body = None;
        conn.pending = Bytes::new();
        tracing::debug!("HTTP connection closed");
    }
}

fn range_header(offset: u64) -> String {
    format!("bytes={}-", offset)
}

fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
}

/// Parsed `Content-Range: bytes <start>-<end>/<total>` (or `bytes */<total>`).
#[derive(Debug, PartialEq, Eq)]
struct ContentRange {
    start: Option<u64>,
    total: Option<u64>,
}

fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse().ok());
    Some(ContentRange {
        start,
        total: total.trim().parse().ok(),
    })
}
