//! Translation of decoded wire messages into state events.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use percent_encoding::percent_decode_str;
use tracing::{debug, trace};
use url::Url;

use riptide_core::{Body, HttpError, HttpResult, Response, ResponseHead};

use crate::client::ClientCore;
use crate::codec::HttpFrame;
use crate::decompress::{ContentDecoder, ContentEncoding};
use crate::future::ResponseFuture;
use crate::info::RequestInfo;
use crate::state::State;
use crate::websocket::{Handshaker, WsFrame};

/// What the connection loop should do after a frame is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Keep reading.
    Continue,
    /// A `100 Continue` arrived for a chunked request; start the pump.
    SendChunkedBody,
    /// The upgrade handshake succeeded; swap in the WebSocket codec.
    UpgradeWebSocket,
    /// A redirect was dispatched; this connection is silenced and done.
    Abandon,
}

/// Per-connection buffer state for one response cycle.
///
/// Created when the cycle's head arrives and replaced wholesale on the
/// next cycle; aggregate buffers are never reused across redirects.
struct ResponseState {
    head: Option<Arc<ResponseHead>>,
    aggregate: Option<BytesMut>,
    wire_bytes: u64,
    full_response_sent: bool,
    websocket_handshake_succeeded: bool,
}

impl ResponseState {
    fn empty() -> Self {
        Self {
            head: None,
            aggregate: None,
            wire_bytes: 0,
            full_response_sent: false,
            websocket_handshake_succeeded: false,
        }
    }

    fn fresh(head: Arc<ResponseHead>, aggregate_enabled: bool) -> Self {
        Self {
            head: Some(head),
            aggregate: aggregate_enabled.then(BytesMut::new),
            wire_bytes: 0,
            full_response_sent: false,
            websocket_handshake_succeeded: false,
        }
    }
}

/// Translates decoded messages into state events: aggregation, redirect
/// dispatch, and the WebSocket upgrade decision.
pub(crate) struct MessageHandler {
    core: Arc<ClientCore>,
    future: Arc<ResponseFuture>,
    attachment: Arc<ArcSwap<RequestInfo>>,
    response: ResponseState,
    decompressor: Option<ContentDecoder>,
    errored: bool,
}

impl MessageHandler {
    pub(crate) fn new(
        core: Arc<ClientCore>,
        future: Arc<ResponseFuture>,
        attachment: Arc<ArcSwap<RequestInfo>>,
    ) -> Self {
        Self {
            core,
            future,
            attachment,
            response: ResponseState::empty(),
            decompressor: None,
            errored: false,
        }
    }

    /// Emits an event unless this connection has been silenced by a
    /// redirect swap.
    fn emit(&self, state: State) {
        if self.attachment.load().silenced {
            trace!("suppressing {} on silenced connection", state.state_type());
            return;
        }
        self.future.dispatch(state);
    }

    /// Whether the current response cycle has delivered its full
    /// response; the deadline timer is disarmed at that point.
    pub(crate) fn response_complete(&self) -> bool {
        self.response.full_response_sent
    }

    /// Whether the upgrade handshake has been verified on this
    /// connection.
    pub(crate) fn websocket_ready(&self) -> bool {
        self.response.websocket_handshake_succeeded
    }

    pub(crate) fn handle_frame(&mut self, frame: HttpFrame) -> Step {
        match frame {
            HttpFrame::Head(head) => self.on_head(head),
            HttpFrame::Chunk { data, last } => self.on_chunk(data, last),
        }
    }

    fn on_head(&mut self, head: ResponseHead) -> Step {
        let info = self.attachment.load_full();

        // The upgrade response is checked first: 101 sits in the 1xx range.
        if let Some(handshaker) = info.websocket.clone() {
            if head.is_websocket_upgrade() {
                return self.on_upgrade_head(head, &handshaker);
            }
        }

        if head.is_informational() {
            if head.status == 100 && matches!(info.request.body, Body::Chunked(_)) {
                return Step::SendChunkedBody;
            }
            trace!("interim status {}, awaiting next response head", head.status);
            return Step::Continue;
        }

        // Set-Cookie capture happens before any redirect is followed.
        let jar = info
            .cookie_store
            .clone()
            .or_else(|| self.core.config.cookie_store.clone());
        if let Some(jar) = jar {
            jar.extract(&info.url, &head.headers);
        }

        if self.core.config.follow_redirects && head.is_redirect() {
            if let Some(location) = head.headers.get("Location").map(str::to_string) {
                return self.on_redirect_head(head, &info, &location);
            }
            // No Location header: fall through to a normal response.
        }

        let head = Arc::new(head);
        self.response = ResponseState::fresh(head.clone(), info.request.aggregate_response);
        self.decompressor = None;
        if self.core.config.compression {
            if let Some(encoding) = head
                .content_encoding()
                .as_deref()
                .and_then(ContentEncoding::from_header)
            {
                self.decompressor = Some(ContentDecoder::new(encoding));
            }
        }
        self.emit(State::HeadersReceived(head));
        Step::Continue
    }

    /// The redirect decision. The intermediate `HeadersReceived` is held
    /// back until the decision is made, then emitted immediately before
    /// `Redirect` (or the redirect error).
    fn on_redirect_head(
        &mut self,
        head: ResponseHead,
        info: &Arc<RequestInfo>,
        location: &str,
    ) -> Step {
        let status = head.status;
        let head = Arc::new(head);
        match resolve_location(&info.url, location) {
            Err(error) => {
                self.emit(State::HeadersReceived(head));
                self.emit(State::Error(Arc::new(error)));
                info.cancelled.store(true, Ordering::SeqCst);
                Step::Continue
            }
            Ok(next_url) => {
                if info.redirect_count >= self.core.config.max_redirects {
                    self.emit(State::HeadersReceived(head));
                    self.emit(State::Error(Arc::new(HttpError::RedirectLoop(
                        info.redirect_count,
                    ))));
                    info.cancelled.store(true, Ordering::SeqCst);
                    return Step::Continue;
                }
                debug!("following {status} redirect to {next_url}");
                self.emit(State::HeadersReceived(head));
                self.emit(State::Redirect(next_url.clone()));
                self.attachment.store(Arc::new(info.silenced_placeholder()));
                self.core.redirect(next_url, status, info, self.future.clone());
                Step::Abandon
            }
        }
    }

    fn on_upgrade_head(&mut self, head: ResponseHead, handshaker: &Handshaker) -> Step {
        let head = Arc::new(head);
        match handshaker.verify(&head) {
            Ok(()) => {
                self.response.websocket_handshake_succeeded = true;
                self.emit(State::HeadersReceived(head));
                Step::UpgradeWebSocket
            }
            Err(error) => {
                self.emit(State::HeadersReceived(head));
                self.emit(State::Error(Arc::new(error)));
                Step::Continue
            }
        }
    }

    fn on_chunk(&mut self, data: Bytes, last: bool) -> Step {
        let Some(head) = self.response.head.clone() else {
            // Body of a response whose head was abandoned or rejected.
            return Step::Continue;
        };
        self.response.wire_bytes += data.len() as u64;

        let decoded = match &mut self.decompressor {
            Some(decoder) => match decoder.feed(&data) {
                Ok(decoded) => decoded,
                Err(error) => {
                    self.on_error(error);
                    return Step::Continue;
                }
            },
            None => data,
        };

        if !decoded.is_empty() {
            if let Some(aggregate) = self.response.aggregate.as_mut() {
                aggregate.extend_from_slice(&decoded);
            }
            self.emit(State::ContentReceived(decoded));
        }

        let length_satisfied = head
            .content_length()
            .is_some_and(|length| self.response.wire_bytes >= length);
        if last || length_satisfied {
            self.send_full_response();
        }
        Step::Continue
    }

    /// Delivers `FullContentReceived` and `Finished` once per response.
    /// An empty aggregate (or disabled aggregation) suppresses both.
    fn send_full_response(&mut self) {
        if self.response.full_response_sent {
            return;
        }
        self.response.full_response_sent = true;

        let Some(head) = self.response.head.clone() else {
            return;
        };
        match self.response.aggregate.take() {
            Some(aggregate) if !aggregate.is_empty() => {
                let body = aggregate.freeze();
                self.emit(State::FullContentReceived(body.clone()));
                let response = Arc::new(Response::new((*head).clone(), body));
                self.emit(State::Finished(response));
            }
            _ => {}
        }
    }

    /// The channel went inactive: synthesize a best-effort full response
    /// from buffered bytes (EOF-terminated bodies), unless the request
    /// was cancelled or already failed.
    pub(crate) fn on_channel_inactive(&mut self) {
        let cancelled = self.attachment.load().is_cancelled() || self.future.is_cancelled();
        if !cancelled && !self.errored {
            self.send_full_response();
        }
    }

    /// Inbound exception: surface and keep the channel; close policy is
    /// the caller's.
    pub(crate) fn on_error(&mut self, error: HttpError) {
        self.errored = true;
        self.emit(State::Error(Arc::new(error)));
    }

    /// A decoded frame after the handshake.
    pub(crate) fn on_ws_frame(&self, frame: WsFrame) {
        self.emit(State::WebSocketFrameReceived(frame));
    }
}

/// Resolves a `Location` header against the URL that produced it.
///
/// The value is percent-decoded first. Values containing `://` parse
/// directly; values beginning with `/` are path-absolute against the
/// original scheme/host/port; anything else appends to the original
/// path, inserting `/` if neither side has one.
pub(crate) fn resolve_location(base: &Url, raw: &str) -> HttpResult<Url> {
    let invalid = || HttpError::InvalidRedirectUrl(raw.to_string());
    let location = percent_decode_str(raw.trim())
        .decode_utf8()
        .map_err(|_| invalid())?;

    let absolute = if location.contains("://") {
        location.into_owned()
    } else {
        let host = base.host_str().ok_or_else(invalid)?;
        let port = base.port().map(|p| format!(":{p}")).unwrap_or_default();
        let origin = format!("{}://{host}{port}", base.scheme());
        if let Some(path_absolute) = location.strip_prefix('/') {
            format!("{origin}/{path_absolute}")
        } else {
            let path = base.path();
            let separator = if path.ends_with('/') { "" } else { "/" };
            format!("{origin}{path}{separator}{location}")
        }
    };
    Url::parse(&absolute).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn absolute_location_parses_directly() {
        let url = resolve_location(&base("http://a.example:81/x"), "http://b.example/y").unwrap();
        assert_eq!(url.as_str(), "http://b.example/y");
    }

    #[test]
    fn path_absolute_location_keeps_origin() {
        let url = resolve_location(&base("http://host:8123/"), "/foo/bar").unwrap();
        assert_eq!(url.as_str(), "http://host:8123/foo/bar");
    }

    #[test]
    fn relative_location_appends_with_separator() {
        let url = resolve_location(&base("http://host/dir"), "next").unwrap();
        assert_eq!(url.as_str(), "http://host/dir/next");

        let url = resolve_location(&base("http://host/dir/"), "next").unwrap();
        assert_eq!(url.as_str(), "http://host/dir/next");
    }

    #[test]
    fn location_is_percent_decoded() {
        let url = resolve_location(&base("http://host/"), "/redirect%2Dtarget").unwrap();
        assert_eq!(url.path(), "/redirect-target");
    }

    #[test]
    fn default_port_is_not_materialized() {
        let url = resolve_location(&base("http://host/"), "/foo").unwrap();
        assert_eq!(url.as_str(), "http://host/foo");
    }

    #[test]
    fn unparseable_location_is_invalid_redirect() {
        let err = resolve_location(&base("http://host/"), "http://").unwrap_err();
        assert!(matches!(err, HttpError::InvalidRedirectUrl(_)));
    }
}
