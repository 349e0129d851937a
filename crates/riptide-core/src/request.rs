//! Request value types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::HttpResult;
use crate::headers::Headers;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
}

impl Method {
    /// The wire form of the method token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version for the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    #[default]
    Http11,
}

impl HttpVersion {
    /// The wire form of the version token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket protocol versions the handshaker can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebSocketVersion {
    /// hybi-10 (`Sec-WebSocket-Version: 8`).
    V8,
    /// RFC 6455 (`Sec-WebSocket-Version: 13`), the most recent known.
    #[default]
    V13,
}

impl WebSocketVersion {
    /// The numeric value sent in `Sec-WebSocket-Version`.
    pub fn number(self) -> u8 {
        match self {
            Self::V8 => 8,
            Self::V13 => 13,
        }
    }
}

/// A producer of request body chunks, pulled one at a time.
///
/// `call_count` is the number of chunks already produced; returning
/// `Ok(None)` signals the end of the body, after which a zero-length
/// terminal chunk is written on the wire.
pub trait ChunkedBody: Send + Sync {
    /// Produces the next chunk, or `None` when the body is complete.
    fn next_chunk(&self, call_count: usize) -> HttpResult<Option<Bytes>>;
}

impl<F> ChunkedBody for F
where
    F: Fn(usize) -> HttpResult<Option<Bytes>> + Send + Sync,
{
    fn next_chunk(&self, call_count: usize) -> HttpResult<Option<Bytes>> {
        self(call_count)
    }
}

/// The body of a request.
#[derive(Clone, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// A fixed byte payload, sent with `Content-Length`.
    Bytes(Bytes),
    /// A pull-based producer, sent with `Transfer-Encoding: chunked`.
    Chunked(Arc<dyn ChunkedBody>),
}

impl Body {
    /// Whether the request carries any body at all.
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Empty) && !matches!(self, Self::Bytes(b) if b.is_empty())
    }

    /// The fixed length of the body, if it has one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(bytes) => Some(bytes.len()),
            Self::Chunked(_) => None,
        }
    }

    /// Whether the body is empty or absent.
    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Self::Chunked(_) => f.write_str("Body::Chunked(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// An HTTP request, immutable once submitted.
///
/// Built by the client crate's request builder; cloned as a snapshot for
/// each connection attempt. Header order (and same-name duplicates) is
/// preserved on the wire.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Protocol version for the request line.
    pub version: HttpVersion,
    /// Target URL.
    pub url: Url,
    /// Header multimap, in insertion order.
    pub headers: Headers,
    /// Request body variant.
    pub body: Body,
    /// Requested WebSocket upgrade version, when the request should
    /// negotiate an upgrade.
    pub websocket_version: Option<WebSocketVersion>,
    /// Per-request deadline, overriding the client default.
    pub timeout: Option<Duration>,
    /// Whether response chunks are aggregated into a single buffer.
    pub aggregate_response: bool,
    /// Whether bodied requests carry `Expect: 100-continue`.
    pub send_100_continue: bool,
    /// Whether a `Host` header is added automatically.
    pub include_host_header: bool,
    /// Whether a default `Connection` header is added.
    pub include_connection_header: bool,
    /// Whether a `Date` header is added automatically.
    pub include_date_header: bool,
}

impl Request {
    /// Creates a request with default flags for `method` and `url`.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            version: HttpVersion::Http11,
            url,
            headers: Headers::new(),
            body: Body::Empty,
            websocket_version: None,
            timeout: None,
            aggregate_response: true,
            send_100_continue: true,
            include_host_header: true,
            include_connection_header: true,
            include_date_header: true,
        }
    }

    /// The `host[:port]` form used for the `Host` header, omitting the
    /// default port for the URL's scheme.
    pub fn host_header_value(&self) -> Option<String> {
        let host = self.url.host_str()?;
        match self.url.port() {
            Some(port) => Some(format!("{host}:{port}")),
            None => Some(host.to_string()),
        }
    }
}
