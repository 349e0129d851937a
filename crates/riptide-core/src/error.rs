//! Client error types.

use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for client operations.
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// Represents errors surfaced by the client.
///
/// Transport outcomes are delivered as `Error` state events on the
/// response future, never as panics. The only error returned directly
/// from submission is [`HttpError::InvalidInput`], for programmer errors
/// such as unparseable URLs or illegal builder state.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HttpError {
    /// The destination host could not be resolved.
    #[error("Host resolution failed: {0}")]
    Resolve(String),

    /// The socket connect failed or was refused.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The response could not be decoded: malformed status line, headers
    /// too large, or chunk size exceeded.
    #[error("Protocol decode error: {0}")]
    Codec(String),

    /// The per-request deadline elapsed.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// A `Location` header could not be parsed into a URL.
    #[error("Invalid redirect URL: {0}")]
    InvalidRedirectUrl(String),

    /// The redirect count exceeded the configured maximum.
    #[error("Redirect loop detected after {0} redirects")]
    RedirectLoop(u32),

    /// The request was cancelled before completion.
    #[error("Request cancelled")]
    Cancelled,

    /// The connection closed before a terminal condition was reached.
    #[error("Connection closed unexpectedly")]
    UnexpectedClose,

    /// The WebSocket upgrade handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    WebSocketHandshake(String),

    /// A response body could not be marshalled to the requested type.
    #[error("Marshalling failed: {0}")]
    Marshal(String),

    /// A user observer callback panicked during dispatch.
    #[error("Observer callback failed: {0}")]
    Observer(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),

    /// A programmer error: invalid URL or illegal builder/future state.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl HttpError {
    /// Whether this is one of the redirect error kinds that is surfaced
    /// even after cancellation.
    pub fn is_redirect_error(&self) -> bool {
        matches!(self, Self::InvalidRedirectUrl(_) | Self::RedirectLoop(_))
    }
}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<url::ParseError> for HttpError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Marshal(err.to_string())
    }
}
