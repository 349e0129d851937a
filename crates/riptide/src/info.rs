//! Per-submission control block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Instant;
use url::Url;

use riptide_core::{CookieStore, Request};

use crate::websocket::Handshaker;

/// Mutable control block owned by one connection attempt.
///
/// At most one decoder chain references a `RequestInfo` at a time; a
/// redirect atomically swaps the channel's attachment for a silenced
/// placeholder so straggling events on the old connection never reach
/// the user's future.
pub(crate) struct RequestInfo {
    /// The pristine request as built; policy headers are applied to a
    /// per-attempt snapshot, never here.
    pub(crate) request: Request,
    /// Current target URL (changes across redirects).
    pub(crate) url: Url,
    /// Cancellation flag shared with the response future.
    pub(crate) cancelled: Arc<AtomicBool>,
    /// Redirects taken so far in this submission.
    pub(crate) redirect_count: u32,
    /// When the submission started; `Timeout` carries the elapsed time
    /// from here.
    pub(crate) started_at: Instant,
    /// Absolute deadline; redirects inherit it, so each hop gets only
    /// the remaining time.
    pub(crate) deadline: Option<Instant>,
    /// Upgrade negotiation state when this request asks for WebSocket.
    pub(crate) websocket: Option<Handshaker>,
    /// Per-request cookie jar override.
    pub(crate) cookie_store: Option<Arc<dyn CookieStore>>,
    /// Whether this control block is the post-redirect placeholder.
    pub(crate) silenced: bool,
}

impl RequestInfo {
    pub(crate) fn new(
        request: Request,
        url: Url,
        cancelled: Arc<AtomicBool>,
        deadline: Option<Instant>,
        websocket: Option<Handshaker>,
        cookie_store: Option<Arc<dyn CookieStore>>,
    ) -> Self {
        Self {
            request,
            url,
            cancelled,
            redirect_count: 0,
            started_at: Instant::now(),
            deadline,
            websocket,
            cookie_store,
            silenced: false,
        }
    }

    /// A placeholder with its own pre-set cancelled flag, swapped in
    /// when the attempt is abandoned for a redirect.
    pub(crate) fn silenced_placeholder(&self) -> Self {
        Self {
            request: self.request.clone(),
            url: self.url.clone(),
            cancelled: Arc::new(AtomicBool::new(true)),
            redirect_count: self.redirect_count,
            started_at: self.started_at,
            deadline: self.deadline,
            websocket: None,
            cookie_store: None,
            silenced: true,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RequestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInfo")
            .field("url", &self.url.as_str())
            .field("redirect_count", &self.redirect_count)
            .field("cancelled", &self.is_cancelled())
            .field("silenced", &self.silenced)
            .finish()
    }
}
