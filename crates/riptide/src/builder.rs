//! Fluent request construction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use riptide_core::{
    Body, ChunkedBody, CookieStore, HttpError, HttpResult, HttpVersion, Request, Response,
    ResponseHead, StateType, WebSocketVersion,
};

use crate::channel::Outbound;
use crate::client::ClientCore;
use crate::future::{Observer, ResponseFuture};
use crate::info::RequestInfo;
use crate::state::State;
use crate::websocket::{Handshaker, WsFrame};

/// A mutable, single-owner request builder.
///
/// Obtained from the client's per-method constructors; consumed by
/// [`RequestBuilder::execute`], which submits the request and returns
/// the shared [`ResponseFuture`]. Observers registered on the builder
/// are installed before submission, so they see every event from
/// `Connecting` on.
pub struct RequestBuilder {
    core: Arc<ClientCore>,
    request: Request,
    cookie_store: Option<Arc<dyn CookieStore>>,
    observers: Vec<(Option<StateType>, Observer)>,
    deferred: Vec<(StateType, Outbound)>,
}

impl RequestBuilder {
    pub(crate) fn new(core: Arc<ClientCore>, request: Request) -> Self {
        Self {
            core,
            request,
            cookie_store: None,
            observers: Vec::new(),
            deferred: Vec::new(),
        }
    }

    // ---- request shape ---------------------------------------------------

    /// Appends a header, preserving duplicates and insertion order.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.append(name, value);
        self
    }

    /// Replaces all values of a header.
    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.set(name, value);
        self
    }

    /// Appends a query pair to the URL.
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.request.url.query_pairs_mut().append_pair(key, value);
        self
    }

    /// Sets the HTTP version on the request line.
    pub fn version(mut self, version: HttpVersion) -> Self {
        self.request.version = version;
        self
    }

    /// Sets a fixed request body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Sets a JSON body, defaulting `Content-Type: application/json`.
    pub fn json(mut self, value: &impl Serialize) -> HttpResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        self.request.body = Body::Bytes(Bytes::from(bytes));
        if !self.request.headers.contains("Content-Type") {
            self.request.headers.set("Content-Type", "application/json");
        }
        Ok(self)
    }

    /// Sets a pull-based chunked body.
    pub fn chunked_body(mut self, producer: impl ChunkedBody + 'static) -> Self {
        self.request.body = Body::Chunked(Arc::new(producer));
        self
    }

    /// Adds an `Authorization: Basic` header.
    pub fn basic_auth(mut self, user: &str, password: Option<&str>) -> Self {
        let credentials = format!("{user}:{}", password.unwrap_or(""));
        self.request
            .headers
            .set("Authorization", format!("Basic {}", BASE64.encode(credentials)));
        self
    }

    /// Sets the per-request deadline, overriding the client default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// Enables or disables response aggregation.
    pub fn aggregate_response(mut self, enabled: bool) -> Self {
        self.request.aggregate_response = enabled;
        self
    }

    /// Enables or disables `Expect: 100-continue` for this request.
    pub fn send_100_continue(mut self, enabled: bool) -> Self {
        self.request.send_100_continue = enabled;
        self
    }

    /// Suppresses the automatic `Host` header.
    pub fn omit_host_header(mut self) -> Self {
        self.request.include_host_header = false;
        self
    }

    /// Suppresses the default `Connection` header.
    pub fn omit_connection_header(mut self) -> Self {
        self.request.include_connection_header = false;
        self
    }

    /// Suppresses the automatic `Date` header.
    pub fn omit_date_header(mut self) -> Self {
        self.request.include_date_header = false;
        self
    }

    /// Requests a WebSocket upgrade with the given protocol version.
    pub fn websocket(mut self, version: WebSocketVersion) -> Self {
        self.request.websocket_version = Some(version);
        self
    }

    /// Uses a per-request cookie jar instead of the client's.
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    // ---- observers -------------------------------------------------------

    /// Registers an observer for one state tag, installed before
    /// submission.
    pub fn on_state(mut self, state: StateType, observer: impl Fn(&State) + Send + Sync + 'static) -> Self {
        self.observers.push((Some(state), Arc::new(observer)));
        self
    }

    /// Registers a universal observer, installed before submission.
    pub fn on_any(mut self, observer: impl Fn(&State) + Send + Sync + 'static) -> Self {
        self.observers.push((None, Arc::new(observer)));
        self
    }

    /// Observes each decoded response head.
    pub fn on_headers(self, observer: impl Fn(&ResponseHead) + Send + Sync + 'static) -> Self {
        self.on_state(StateType::HeadersReceived, move |state| {
            if let Some(head) = state.response_head() {
                observer(head);
            }
        })
    }

    /// Observes each decoded content chunk.
    pub fn on_content(self, observer: impl Fn(&Bytes) + Send + Sync + 'static) -> Self {
        self.on_state(StateType::ContentReceived, move |state| {
            if let Some(chunk) = state.chunk() {
                observer(chunk);
            }
        })
    }

    /// Observes the complete final response.
    pub fn on_finished(self, observer: impl Fn(&Response) + Send + Sync + 'static) -> Self {
        self.on_state(StateType::Finished, move |state| {
            if let Some(response) = state.response() {
                observer(response);
            }
        })
    }

    /// Observes failures.
    pub fn on_error(self, observer: impl Fn(&HttpError) + Send + Sync + 'static) -> Self {
        self.on_state(StateType::Error, move |state| {
            if let Some(error) = state.error() {
                observer(error);
            }
        })
    }

    /// Observes the terminal `Closed` event.
    pub fn on_closed(self, observer: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_state(StateType::Closed, move |_| observer())
    }

    /// Observes decoded WebSocket frames.
    pub fn on_frame(self, observer: impl Fn(&WsFrame) + Send + Sync + 'static) -> Self {
        self.on_state(StateType::WebSocketFrameReceived, move |state| {
            if let Some(frame) = state.frame() {
                observer(frame);
            }
        })
    }

    /// Queues a payload for [`ResponseFuture::send_on`] before the
    /// request is even submitted, so nothing can race the trigger state.
    pub fn send_on(mut self, trigger: StateType, payload: impl Into<Outbound>) -> HttpResult<Self> {
        if !trigger.allows_deferred_send() {
            return Err(HttpError::InvalidInput(format!(
                "deferred sends cannot trigger on {trigger}"
            )));
        }
        self.deferred.push((trigger, payload.into()));
        Ok(self)
    }

    // ---- submission ------------------------------------------------------

    /// A snapshot of the request as currently built.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Submits the request, returning the shared response future.
    ///
    /// Never fails for transport reasons; those arrive as events. The
    /// only errors here are programmer errors (illegal state).
    pub fn execute(self) -> HttpResult<Arc<ResponseFuture>> {
        let Self {
            core,
            request,
            cookie_store,
            observers,
            deferred,
        } = self;

        if request.websocket_version.is_some() && !core.config.websocket_support {
            return Err(HttpError::InvalidInput(
                "WebSocket support is not enabled on this client".into(),
            ));
        }

        let url = request.url.clone();
        let future = Arc::new(ResponseFuture::new(
            url.clone(),
            core.marshallers.clone(),
            core.config.activity_monitors.clone(),
            core.config.error_hook.clone(),
        ));
        for (filter, observer) in observers {
            future.install(filter, observer);
        }
        for (trigger, payload) in deferred {
            future.send_on(trigger, payload)?;
        }

        let timeout = request.timeout.or(core.config.timeout);
        let deadline = timeout.map(|t| Instant::now() + t);
        let websocket = request
            .websocket_version
            .map(|version| Handshaker::new(url.clone(), version));

        let info = RequestInfo::new(
            request,
            url,
            future.cancelled_flag(),
            deadline,
            websocket,
            cookie_store,
        );
        core.submit(info, future.clone());
        Ok(future)
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.request.method)
            .field("url", &self.request.url.as_str())
            .field("headers", &self.request.headers.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
