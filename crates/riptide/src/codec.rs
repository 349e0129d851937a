//! HTTP/1.1 wire codec.
//!
//! Encodes outgoing requests (request line, ordered headers, fixed or
//! chunked bodies) and decodes responses into a stream of
//! [`HttpFrame`]s: one `Head` per response head, then zero or more
//! `Chunk`s, the final one carrying `last = true`. Fixed-length,
//! chunked, and EOF-delimited bodies are supported; decoding is bounded
//! by the configured initial-line, header, and chunk size limits.

use std::cmp;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use riptide_core::{Body, Headers, HttpError, HttpResult, HttpVersion, Method, Request, ResponseHead};

/// Upper bound on the number of headers a response may carry.
const MAX_HEADER_COUNT: usize = 128;

/// A decoded piece of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFrame {
    /// A decoded status line and headers.
    Head(ResponseHead),
    /// A piece of the response body.
    Chunk {
        /// Decoded bytes, possibly empty for the terminal marker.
        data: Bytes,
        /// Whether this is the last content for the response.
        last: bool,
    },
}

/// An item written to the connection.
#[derive(Debug, Clone)]
pub enum OutboundHttp {
    /// A full request head plus any fixed body.
    Request(Arc<Request>),
    /// One chunk of a chunked request body.
    BodyChunk(Bytes),
    /// The zero-length terminal chunk.
    LastBodyChunk,
    /// Bytes written verbatim (deferred sends).
    Raw(Bytes),
}

#[derive(Debug)]
enum DecodeState {
    Head,
    FixedBody { remaining: u64 },
    ChunkedSize,
    ChunkedData { remaining: u64 },
    ChunkedCrlf,
    ChunkedTrailers,
    EofBody,
    Upgraded,
}

/// The HTTP/1.1 request encoder / response decoder.
#[derive(Debug)]
pub struct Http1Codec {
    max_initial_line_length: usize,
    max_headers_size: usize,
    max_chunk_size: usize,
    state: DecodeState,
    request_method: Option<Method>,
    failed: bool,
}

impl Http1Codec {
    /// Creates a codec with the given decode bounds.
    pub fn new(max_initial_line_length: usize, max_headers_size: usize, max_chunk_size: usize) -> Self {
        Self {
            max_initial_line_length,
            max_headers_size,
            max_chunk_size,
            state: DecodeState::Head,
            request_method: None,
            failed: false,
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> HttpError {
        self.failed = true;
        HttpError::Codec(message.into())
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> HttpResult<Option<ResponseHead>> {
        // The status line must terminate within its bound.
        let line_end = find_crlf(src);
        match line_end {
            Some(end) if end > self.max_initial_line_length => {
                return Err(self.fail(format!(
                    "status line of {end} bytes exceeds limit of {}",
                    self.max_initial_line_length
                )));
            }
            None if src.len() > self.max_initial_line_length => {
                return Err(self.fail(format!(
                    "status line exceeds limit of {}",
                    self.max_initial_line_length
                )));
            }
            _ => {}
        }

        // The header block, measured from past the status line, has its
        // own bound.
        let headers_start = line_end.map(|end| end + 2);
        let Some(head_end) = find_double_crlf(src) else {
            if let Some(start) = headers_start {
                if src.len() - start > self.max_headers_size {
                    return Err(self.fail(format!(
                        "response headers exceed limit of {}",
                        self.max_headers_size
                    )));
                }
            }
            return Ok(None);
        };
        let headers_len = head_end - headers_start.unwrap_or(0);
        if headers_len > self.max_headers_size {
            return Err(self.fail(format!(
                "response headers of {headers_len} bytes exceed limit of {}",
                self.max_headers_size
            )));
        }

        let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut parsed = httparse::Response::new(&mut header_slots);
        let consumed = match parsed.parse(&src[..head_end]) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(self.fail("malformed response head"));
            }
            Err(e) => return Err(self.fail(format!("malformed response head: {e}"))),
        };

        let version = match parsed.version {
            Some(0) => HttpVersion::Http10,
            _ => HttpVersion::Http11,
        };
        let status = parsed
            .code
            .ok_or_else(|| HttpError::Codec("response head missing status code".into()))?;
        let reason = parsed.reason.unwrap_or("").to_string();
        let headers: Headers = parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        src.advance(consumed);
        Ok(Some(ResponseHead::new(version, status, reason, headers)))
    }

    /// Selects the body framing for a freshly decoded head.
    fn body_state(&self, head: &ResponseHead) -> DecodeState {
        if head.status == 101 && head.is_websocket_upgrade() {
            return DecodeState::Upgraded;
        }
        if head.is_informational()
            || head.status == 204
            || head.status == 304
            || self.request_method == Some(Method::Head)
        {
            return DecodeState::Head;
        }
        if head.is_chunked() {
            return DecodeState::ChunkedSize;
        }
        match head.content_length() {
            Some(length) => DecodeState::FixedBody { remaining: length },
            None => DecodeState::EofBody,
        }
    }
}

impl Decoder for Http1Codec {
    type Item = HttpFrame;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> HttpResult<Option<HttpFrame>> {
        if self.failed {
            // One error has been surfaced; idle until the peer closes.
            src.clear();
            return Ok(None);
        }

        loop {
            match &mut self.state {
                DecodeState::Head => {
                    let Some(head) = self.decode_head(src)? else {
                        return Ok(None);
                    };
                    self.state = self.body_state(&head);
                    // A bodyless status yields its terminal chunk on the
                    // next decode pass, except heads that never carry one.
                    if head.is_informational() && !matches!(self.state, DecodeState::Upgraded) {
                        self.state = DecodeState::Head;
                        return Ok(Some(HttpFrame::Head(head)));
                    }
                    if matches!(self.state, DecodeState::Head) {
                        self.state = DecodeState::FixedBody { remaining: 0 };
                    }
                    return Ok(Some(HttpFrame::Head(head)));
                }

                DecodeState::FixedBody { remaining } => {
                    if *remaining == 0 {
                        self.state = DecodeState::Head;
                        return Ok(Some(HttpFrame::Chunk {
                            data: Bytes::new(),
                            last: true,
                        }));
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = cmp::min(
                        cmp::min(src.len() as u64, *remaining),
                        self.max_chunk_size as u64,
                    ) as usize;
                    let data = src.split_to(take).freeze();
                    *remaining -= take as u64;
                    let last = *remaining == 0;
                    if last {
                        self.state = DecodeState::Head;
                    }
                    return Ok(Some(HttpFrame::Chunk { data, last }));
                }

                DecodeState::ChunkedSize => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > 128 {
                            return Err(self.fail("malformed chunk size line"));
                        }
                        return Ok(None);
                    };
                    let line = src.split_to(line_end + 2);
                    let text = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| self.fail("non-ASCII chunk size line"))?;
                    let size_text = text.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_text, 16)
                        .map_err(|_| self.fail(format!("invalid chunk size {size_text:?}")))?;
                    if size > self.max_chunk_size as u64 {
                        return Err(self.fail(format!(
                            "chunk of {size} bytes exceeds limit of {}",
                            self.max_chunk_size
                        )));
                    }
                    self.state = if size == 0 {
                        DecodeState::ChunkedTrailers
                    } else {
                        DecodeState::ChunkedData { remaining: size }
                    };
                }

                DecodeState::ChunkedData { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = cmp::min(src.len() as u64, *remaining) as usize;
                    let data = src.split_to(take).freeze();
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = DecodeState::ChunkedCrlf;
                    }
                    return Ok(Some(HttpFrame::Chunk { data, last: false }));
                }

                DecodeState::ChunkedCrlf => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(self.fail("missing CRLF after chunk data"));
                    }
                    src.advance(2);
                    self.state = DecodeState::ChunkedSize;
                }

                DecodeState::ChunkedTrailers => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > self.max_headers_size {
                            return Err(self.fail("trailers exceed header limit"));
                        }
                        return Ok(None);
                    };
                    let line = src.split_to(line_end + 2);
                    if line_end == 0 {
                        // Empty line ends the trailers and the response.
                        self.state = DecodeState::Head;
                        return Ok(Some(HttpFrame::Chunk {
                            data: Bytes::new(),
                            last: true,
                        }));
                    }
                    drop(line);
                }

                DecodeState::EofBody => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = cmp::min(src.len(), self.max_chunk_size);
                    let data = src.split_to(take).freeze();
                    return Ok(Some(HttpFrame::Chunk { data, last: false }));
                }

                DecodeState::Upgraded => {
                    // Remaining bytes belong to the WebSocket codec that
                    // replaces this one.
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<OutboundHttp> for Http1Codec {
    type Error = HttpError;

    fn encode(&mut self, item: OutboundHttp, dst: &mut BytesMut) -> HttpResult<()> {
        match item {
            OutboundHttp::Request(request) => {
                self.request_method = Some(request.method);
                let target = request_target(&request.url);
                dst.extend_from_slice(
                    format!("{} {} {}\r\n", request.method, target, request.version).as_bytes(),
                );
                for (name, value) in request.headers.iter() {
                    dst.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
                }
                dst.extend_from_slice(b"\r\n");
                if let Body::Bytes(bytes) = &request.body {
                    dst.extend_from_slice(bytes);
                }
            }
            OutboundHttp::BodyChunk(data) => {
                if !data.is_empty() {
                    dst.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    dst.extend_from_slice(&data);
                    dst.extend_from_slice(b"\r\n");
                }
            }
            OutboundHttp::LastBodyChunk => {
                dst.extend_from_slice(b"0\r\n\r\n");
            }
            OutboundHttp::Raw(data) => {
                dst.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

/// The request target: path plus optional query.
fn request_target(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
