//! The shared handle used to observe and control a submitted request.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use url::Url;

use riptide_core::{
    ActivityMonitor, ErrorHook, HttpError, HttpResult, Latch, Response, ResponseHead, StateType,
};

use crate::channel::{ChannelHandle, Outbound};
use crate::marshal::MarshallerRegistry;
use crate::state::State;
use crate::websocket::{Handshaker, WsFrame};

pub(crate) type Observer = Arc<dyn Fn(&State) + Send + Sync>;

/// The shared handle for one submitted request.
///
/// Fans state events out to registered observers, exposes cancellation,
/// and acts as the rendezvous for deferred `send_on` writes. Observers
/// run synchronously on the I/O task that produced the event and must
/// not block.
///
/// The observer list is append-only and registration may race an
/// in-flight dispatch: a handler added while an event is being delivered
/// may or may not see that event.
pub struct ResponseFuture {
    current_url: Mutex<Url>,
    cancelled: Arc<AtomicBool>,
    closed_emitted: AtomicBool,
    cancel_event_emitted: AtomicBool,
    observers: RwLock<Vec<(Option<StateType>, Observer)>>,
    observed: DashMap<StateType, ()>,
    deferred: DashMap<StateType, VecDeque<Outbound>>,
    channel: Mutex<Option<ChannelHandle>>,
    attempt_token: Mutex<CancellationToken>,
    latch: Latch<StateType>,
    last_error: Mutex<Option<HttpError>>,
    marshallers: MarshallerRegistry,
    monitors: Vec<Arc<dyn ActivityMonitor>>,
    error_hook: Option<ErrorHook>,
}

impl ResponseFuture {
    pub(crate) fn new(
        url: Url,
        marshallers: MarshallerRegistry,
        monitors: Vec<Arc<dyn ActivityMonitor>>,
        error_hook: Option<ErrorHook>,
    ) -> Self {
        Self {
            current_url: Mutex::new(url),
            cancelled: Arc::new(AtomicBool::new(false)),
            closed_emitted: AtomicBool::new(false),
            cancel_event_emitted: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
            observed: DashMap::new(),
            deferred: DashMap::new(),
            channel: Mutex::new(None),
            attempt_token: Mutex::new(CancellationToken::new()),
            latch: Latch::new(),
            last_error: Mutex::new(None),
            marshallers,
            monitors,
            error_hook,
        }
    }

    // ---- registration ----------------------------------------------------

    /// Registers an observer for one state tag. The observer receives
    /// the full [`State`] and can inspect whatever payload it carries.
    pub fn on_state(&self, state: StateType, observer: impl Fn(&State) + Send + Sync + 'static) -> &Self {
        self.observers.write().push((Some(state), Arc::new(observer)));
        self
    }

    /// Registers a universal observer receiving every event.
    pub fn on_any(&self, observer: impl Fn(&State) + Send + Sync + 'static) -> &Self {
        self.observers.write().push((None, Arc::new(observer)));
        self
    }

    pub(crate) fn install(&self, filter: Option<StateType>, observer: Observer) {
        self.observers.write().push((filter, observer));
    }

    /// Observes `Connected` with its channel handle.
    pub fn on_connected(&self, observer: impl Fn(&ChannelHandle) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Connected, move |state| {
            if let Some(channel) = state.channel() {
                observer(channel);
            }
        })
    }

    /// Observes each decoded response head.
    pub fn on_headers(&self, observer: impl Fn(&ResponseHead) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::HeadersReceived, move |state| {
            if let Some(head) = state.response_head() {
                observer(head);
            }
        })
    }

    /// Observes each decoded content chunk.
    pub fn on_content(&self, observer: impl Fn(&Bytes) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::ContentReceived, move |state| {
            if let Some(chunk) = state.chunk() {
                observer(chunk);
            }
        })
    }

    /// Observes each followed redirect with the resolved URL.
    pub fn on_redirect(&self, observer: impl Fn(&Url) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Redirect, move |state| {
            if let Some(url) = state.next_url() {
                observer(url);
            }
        })
    }

    /// Observes the aggregated body.
    pub fn on_full_content(&self, observer: impl Fn(&Bytes) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::FullContentReceived, move |state| {
            if let Some(body) = state.full_content() {
                observer(body);
            }
        })
    }

    /// Observes the complete final response.
    pub fn on_finished(&self, observer: impl Fn(&Response) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Finished, move |state| {
            if let Some(response) = state.response() {
                observer(response);
            }
        })
    }

    /// Observes failures.
    pub fn on_error(&self, observer: impl Fn(&HttpError) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Error, move |state| {
            if let Some(error) = state.error() {
                observer(error);
            }
        })
    }

    /// Observes a deadline expiry with the elapsed time.
    pub fn on_timeout(&self, observer: impl Fn(Duration) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Timeout, move |state| {
            if let Some(elapsed) = state.elapsed() {
                observer(elapsed);
            }
        })
    }

    /// Observes the terminal `Closed` event.
    pub fn on_closed(&self, observer: impl Fn() + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Closed, move |_| observer())
    }

    /// Observes cancellation.
    pub fn on_cancelled(&self, observer: impl Fn() + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::Cancelled, move |_| observer())
    }

    /// Observes WebSocket handshake completion.
    pub fn on_websocket_handshake(
        &self,
        observer: impl Fn(&Handshaker) + Send + Sync + 'static,
    ) -> &Self {
        self.on_state(StateType::WebsocketHandshakeComplete, move |state| {
            if let Some(handshaker) = state.handshaker() {
                observer(handshaker);
            }
        })
    }

    /// Observes decoded WebSocket frames.
    pub fn on_frame(&self, observer: impl Fn(&WsFrame) + Send + Sync + 'static) -> &Self {
        self.on_state(StateType::WebSocketFrameReceived, move |state| {
            if let Some(frame) = state.frame() {
                observer(frame);
            }
        })
    }

    /// Marshals the aggregated body on `Finished` and hands the typed
    /// result to `observer`. Marshalling failures arrive as `Err` with
    /// the raw response still available as context.
    pub fn on_json<T, F>(&self, observer: F) -> &Self
    where
        T: DeserializeOwned,
        F: Fn(HttpResult<T>, &Response) + Send + Sync + 'static,
    {
        let registry = self.marshallers.clone();
        self.on_state(StateType::Finished, move |state| {
            if let Some(response) = state.response() {
                let decoded = registry
                    .unmarshal_response(response)
                    .and_then(|value| serde_json::from_value(value).map_err(HttpError::from));
                observer(decoded, response);
            }
        })
    }

    // ---- cancellation ----------------------------------------------------

    /// Cancels the request.
    ///
    /// Idempotent and callable from any thread. The winning call cancels
    /// the outstanding connect/write work, closes the channel if open,
    /// and emits `Cancelled`; later calls return `false`.
    pub fn cancel(&self) -> bool {
        if !self.mark_cancelled() {
            return false;
        }
        self.dispatch(State::Cancelled);
        true
    }

    /// Sets the cancelled flag and tears the connection down without
    /// emitting `Cancelled`. Returns whether this call won the
    /// transition.
    pub(crate) fn mark_cancelled(&self) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.attempt_token.lock().cancel();
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            channel.close();
        }
        true
    }

    /// Whether the cancelled flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    // ---- deferred sends --------------------------------------------------

    /// Queues `payload` to be written once `trigger` has been observed
    /// and the channel is writable.
    ///
    /// Queues drain in FIFO order, one flushed write at a time. A write
    /// failure emits `Error` and stops the drain; any failure state
    /// discards every queue. Pre-connect and terminal trigger states are
    /// rejected.
    pub fn send_on(&self, trigger: StateType, payload: impl Into<Outbound>) -> HttpResult<()> {
        if !trigger.allows_deferred_send() {
            return Err(HttpError::InvalidInput(format!(
                "deferred sends cannot trigger on {trigger}"
            )));
        }
        self.deferred
            .entry(trigger)
            .or_default()
            .push_back(payload.into());
        self.drain_deferred(trigger);
        Ok(())
    }

    fn drain_deferred(&self, trigger: StateType) {
        if !self.observed.contains_key(&trigger) {
            return;
        }
        let channel = self.channel.lock().clone();
        let Some(channel) = channel else { return };
        if !channel.is_open() {
            return;
        }
        let failure = loop {
            let Some(mut queue) = self.deferred.get_mut(&trigger) else {
                return;
            };
            let Some(item) = queue.pop_front() else {
                return;
            };
            if let Err(error) = channel.write(item) {
                break error;
            }
        };
        self.dispatch(State::Error(Arc::new(failure)));
    }

    // ---- completion ------------------------------------------------------

    /// Waits until the request reaches a terminal state, returning the
    /// tag that fired the completion latch.
    pub async fn wait(&self) -> StateType {
        self.latch.wait().await
    }

    /// Test-only blocking wait; must not be called on a reactor thread.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Option<StateType> {
        self.latch.wait_blocking(timeout)
    }

    /// The most recent failure, if any. Test helper.
    pub fn last_error(&self) -> Option<HttpError> {
        self.last_error.lock().clone()
    }

    /// Returns `Err` with the most recent failure, if any. Test helper.
    pub fn err_if_failed(&self) -> HttpResult<()> {
        match self.last_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Whether `state` has been observed at least once.
    pub fn has_observed(&self, state: StateType) -> bool {
        self.observed.contains_key(&state)
    }

    // ---- internal wiring -------------------------------------------------

    pub(crate) fn arm_attempt(&self, token: CancellationToken) {
        *self.attempt_token.lock() = token;
    }

    pub(crate) fn attach_channel(&self, channel: ChannelHandle) {
        *self.channel.lock() = Some(channel);
    }

    pub(crate) fn set_current_url(&self, url: Url) {
        *self.current_url.lock() = url;
    }

    /// Delivers one event: suppression rules, monitor fan-out, observer
    /// dispatch, deferred-queue drain, latch.
    pub(crate) fn dispatch(&self, state: State) {
        let tag = state.state_type();

        if let State::Error(error) = &state {
            *self.last_error.lock() = Some((**error).clone());
        }

        if self.is_cancelled() {
            let surfaced = matches!(tag, StateType::Closed | StateType::Cancelled)
                || matches!(&state, State::Error(e) if e.is_redirect_error());
            if !surfaced {
                trace!("dropping {tag} event after cancellation");
                return;
            }
        }
        if tag == StateType::Closed && self.closed_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        if tag == StateType::Cancelled && self.cancel_event_emitted.swap(true, Ordering::SeqCst) {
            return;
        }

        self.observed.insert(tag, ());

        let url = self.current_url.lock().clone();
        for monitor in &self.monitors {
            monitor.on_transition(tag, &url);
        }

        let snapshot: Vec<(Option<StateType>, Observer)> = self.observers.read().clone();
        for (filter, observer) in snapshot {
            if filter.is_none() || filter == Some(tag) {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&state))) {
                    let message = panic_message(&panic);
                    warn!("observer for {tag} panicked: {message}");
                    if let Some(hook) = &self.error_hook {
                        hook(&HttpError::Observer(message));
                    }
                }
            }
        }

        self.drain_deferred(tag);

        if tag.is_failure() {
            let dropped: usize = self.deferred.iter().map(|entry| entry.len()).sum();
            self.deferred.clear();
            if dropped > 0 {
                trace!("discarded {dropped} deferred sends after {tag}");
            }
        }

        if matches!(
            tag,
            StateType::Finished | StateType::Closed | StateType::Cancelled
        ) {
            self.latch.fire(tag);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("url", &self.current_url.lock().as_str())
            .field("cancelled", &self.is_cancelled())
            .field("closed", &self.closed_emitted.load(Ordering::SeqCst))
            .field("observers", &self.observers.read().len())
            .finish()
    }
}
