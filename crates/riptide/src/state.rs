//! Lifecycle events with payloads.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use riptide_core::{HttpError, Request, Response, ResponseHead, StateType};

use crate::channel::ChannelHandle;
use crate::websocket::{Handshaker, WsFrame};

/// A concrete lifecycle event: a [`StateType`] tag plus its payload.
///
/// Payload-free tags (`Connecting`, `AwaitingResponse`, `Closed`,
/// `Cancelled`) have unit variants; every other variant carries the
/// payload listed in the tag's documentation.
#[derive(Debug, Clone)]
pub enum State {
    /// A connection attempt has started.
    Connecting,
    /// The socket is connected.
    Connected(ChannelHandle),
    /// The request is about to be written.
    SendRequest(Arc<Request>),
    /// The request has been fully written.
    AwaitingResponse,
    /// A response head was decoded.
    HeadersReceived(Arc<ResponseHead>),
    /// A body chunk was decoded.
    ContentReceived(Bytes),
    /// A redirect will be followed to the carried URL.
    Redirect(Url),
    /// The aggregated response body.
    FullContentReceived(Bytes),
    /// The final, complete response.
    Finished(Arc<Response>),
    /// The connection is closed.
    Closed,
    /// A failure occurred.
    Error(Arc<HttpError>),
    /// The per-request deadline elapsed after the carried duration.
    Timeout(Duration),
    /// The request was cancelled.
    Cancelled,
    /// The WebSocket upgrade completed.
    WebsocketHandshakeComplete(Arc<Handshaker>),
    /// A WebSocket frame arrived.
    WebSocketFrameReceived(WsFrame),
}

impl State {
    /// The tag identifying this event.
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Connecting => StateType::Connecting,
            Self::Connected(_) => StateType::Connected,
            Self::SendRequest(_) => StateType::SendRequest,
            Self::AwaitingResponse => StateType::AwaitingResponse,
            Self::HeadersReceived(_) => StateType::HeadersReceived,
            Self::ContentReceived(_) => StateType::ContentReceived,
            Self::Redirect(_) => StateType::Redirect,
            Self::FullContentReceived(_) => StateType::FullContentReceived,
            Self::Finished(_) => StateType::Finished,
            Self::Closed => StateType::Closed,
            Self::Error(_) => StateType::Error,
            Self::Timeout(_) => StateType::Timeout,
            Self::Cancelled => StateType::Cancelled,
            Self::WebsocketHandshakeComplete(_) => StateType::WebsocketHandshakeComplete,
            Self::WebSocketFrameReceived(_) => StateType::WebSocketFrameReceived,
        }
    }

    /// The channel handle, for `Connected`.
    pub fn channel(&self) -> Option<&ChannelHandle> {
        match self {
            Self::Connected(handle) => Some(handle),
            _ => None,
        }
    }

    /// The request snapshot, for `SendRequest`.
    pub fn request(&self) -> Option<&Request> {
        match self {
            Self::SendRequest(request) => Some(request),
            _ => None,
        }
    }

    /// The response head, for `HeadersReceived`.
    pub fn response_head(&self) -> Option<&ResponseHead> {
        match self {
            Self::HeadersReceived(head) => Some(head),
            _ => None,
        }
    }

    /// The body chunk, for `ContentReceived`.
    pub fn chunk(&self) -> Option<&Bytes> {
        match self {
            Self::ContentReceived(chunk) => Some(chunk),
            _ => None,
        }
    }

    /// The resolved next URL, for `Redirect`.
    pub fn next_url(&self) -> Option<&Url> {
        match self {
            Self::Redirect(url) => Some(url),
            _ => None,
        }
    }

    /// The aggregate buffer, for `FullContentReceived`.
    pub fn full_content(&self) -> Option<&Bytes> {
        match self {
            Self::FullContentReceived(body) => Some(body),
            _ => None,
        }
    }

    /// The complete response, for `Finished`.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Finished(response) => Some(response),
            _ => None,
        }
    }

    /// The failure cause, for `Error`.
    pub fn error(&self) -> Option<&HttpError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    /// The elapsed duration, for `Timeout`.
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Self::Timeout(elapsed) => Some(*elapsed),
            _ => None,
        }
    }

    /// The handshaker handle, for `WebsocketHandshakeComplete`.
    pub fn handshaker(&self) -> Option<&Handshaker> {
        match self {
            Self::WebsocketHandshakeComplete(handshaker) => Some(handshaker),
            _ => None,
        }
    }

    /// The decoded frame, for `WebSocketFrameReceived`.
    pub fn frame(&self) -> Option<&WsFrame> {
        match self {
            Self::WebSocketFrameReceived(frame) => Some(frame),
            _ => None,
        }
    }
}
