//! Response value types.

use bytes::Bytes;

use crate::headers::Headers;
use crate::request::HttpVersion;

/// Status codes that trigger redirect handling.
const REDIRECT_STATUSES: [u16; 6] = [300, 301, 302, 303, 305, 307];

/// A decoded response status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Protocol version from the status line.
    pub version: HttpVersion,
    /// Numeric status code.
    pub status: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Response headers, in wire order.
    pub headers: Headers,
}

impl ResponseHead {
    /// Creates a head with the given status and headers.
    pub fn new(version: HttpVersion, status: u16, reason: impl Into<String>, headers: Headers) -> Self {
        Self {
            version,
            status,
            reason: reason.into(),
            headers,
        }
    }

    /// Whether the status is informational (1xx).
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Whether the status participates in redirect handling.
    pub fn is_redirect(&self) -> bool {
        REDIRECT_STATUSES.contains(&self.status)
    }

    /// The declared `Content-Length`, if present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the body uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .contains_token("Transfer-Encoding", "chunked")
    }

    /// The declared `Content-Encoding`, lowercased, if any.
    pub fn content_encoding(&self) -> Option<String> {
        self.headers
            .get("Content-Encoding")
            .map(|v| v.trim().to_ascii_lowercase())
    }

    /// Whether the response requests a protocol upgrade to WebSocket:
    /// `Connection: Upgrade` together with `Upgrade: websocket`.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.contains_token("Connection", "Upgrade")
            && self.headers.contains_token("Upgrade", "websocket")
    }
}

/// A complete response: head plus aggregated body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status line and headers.
    pub head: ResponseHead,
    /// Aggregated body bytes; empty when aggregation was disabled or the
    /// response had no content.
    pub body: Bytes,
}

impl Response {
    /// Creates a response from its parts.
    pub fn new(head: ResponseHead, body: Bytes) -> Self {
        Self { head, body }
    }

    /// Numeric status code.
    pub fn status(&self) -> u16 {
        self.head.status
    }

    /// Response headers.
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// The body interpreted as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with(status: u16, headers: &[(&str, &str)]) -> ResponseHead {
        let map = headers
            .iter()
            .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
            .collect();
        ResponseHead::new(HttpVersion::Http11, status, "", map)
    }

    #[test]
    fn redirect_statuses() {
        for status in [300, 301, 302, 303, 305, 307] {
            assert!(head_with(status, &[]).is_redirect(), "{status}");
        }
        for status in [200, 201, 304, 308, 404] {
            assert!(!head_with(status, &[]).is_redirect(), "{status}");
        }
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(
            head_with(200, &[("Content-Length", "10")]).content_length(),
            Some(10)
        );
        assert_eq!(
            head_with(200, &[("content-length", " 42 ")]).content_length(),
            Some(42)
        );
        assert_eq!(head_with(200, &[("Content-Length", "x")]).content_length(), None);
        assert_eq!(head_with(200, &[]).content_length(), None);
    }

    #[test]
    fn upgrade_detection_needs_both_headers() {
        assert!(head_with(
            101,
            &[("Connection", "Upgrade"), ("Upgrade", "websocket")]
        )
        .is_websocket_upgrade());
        assert!(head_with(
            101,
            &[("Connection", "keep-alive, Upgrade"), ("Upgrade", "WebSocket")]
        )
        .is_websocket_upgrade());
        assert!(!head_with(101, &[("Upgrade", "websocket")]).is_websocket_upgrade());
        assert!(!head_with(101, &[("Connection", "Upgrade")]).is_websocket_upgrade());
    }

    #[test]
    fn informational_range() {
        assert!(head_with(100, &[]).is_informational());
        assert!(head_with(101, &[]).is_informational());
        assert!(!head_with(200, &[]).is_informational());
    }

    #[test]
    fn response_text() {
        let response = Response::new(head_with(200, &[]), Bytes::from_static(b"Okey dokey"));
        assert_eq!(response.text(), "Okey dokey");
        assert_eq!(response.status(), 200);
    }
}
