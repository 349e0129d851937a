//! Request lifecycle state tags.

use std::fmt;

/// Identifies a point in the lifecycle of a submitted request.
///
/// Each tag has a fixed payload type, carried by the `State` enum in the
/// client crate. Within one response cycle, events are emitted in the
/// order the variants are declared here; a redirect restarts the sequence
/// at [`StateType::Connecting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    /// A connection attempt has started. No payload.
    Connecting,
    /// The socket is connected; payload is the channel handle.
    Connected,
    /// The serialized request is about to be written; payload is the
    /// request snapshot.
    SendRequest,
    /// The request (and any body) has been fully written. No payload.
    AwaitingResponse,
    /// A response head was decoded; payload is the response head.
    HeadersReceived,
    /// A body chunk was decoded; payload is the chunk bytes.
    ContentReceived,
    /// The response is a redirect that will be followed; payload is the
    /// resolved next URL.
    Redirect,
    /// All content for the final response has been aggregated; payload is
    /// the aggregate buffer.
    FullContentReceived,
    /// The final response is complete; payload is the full response.
    Finished,
    /// The connection is closed. Terminal; emitted exactly once per
    /// submission. No payload.
    Closed,
    /// A failure occurred; payload is the cause.
    Error,
    /// The per-request deadline elapsed; payload is the elapsed duration.
    Timeout,
    /// The request was cancelled. No payload.
    Cancelled,
    /// The WebSocket upgrade handshake completed; payload is the
    /// handshaker handle.
    WebsocketHandshakeComplete,
    /// A WebSocket frame arrived after the handshake; payload is the frame.
    WebSocketFrameReceived,
}

impl StateType {
    /// Whether this tag represents a failure outcome.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Timeout | Self::Cancelled)
    }

    /// Whether deferred sends may be registered against this tag.
    ///
    /// Pre-connect and terminal tags cannot trigger writes: by the time
    /// they are observed there is either no channel yet or no channel
    /// left.
    pub fn allows_deferred_send(self) -> bool {
        !matches!(self, Self::Connecting | Self::Closed) && !self.is_failure()
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SendRequest => "send-request",
            Self::AwaitingResponse => "awaiting-response",
            Self::HeadersReceived => "headers-received",
            Self::ContentReceived => "content-received",
            Self::Redirect => "redirect",
            Self::FullContentReceived => "full-content-received",
            Self::Finished => "finished",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::WebsocketHandshakeComplete => "websocket-handshake-complete",
            Self::WebSocketFrameReceived => "websocket-frame-received",
        };
        f.write_str(name)
    }
}
