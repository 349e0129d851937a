//! Channel handle carried by the `Connected` state event.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use riptide_core::{HttpError, HttpResult};

use crate::websocket::WsFrame;

/// An outbound item queued for the connection's write half.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Raw bytes written verbatim to the stream.
    Data(Bytes),
    /// A WebSocket frame, legal only after the upgrade completes.
    Frame(WsFrame),
}

impl From<Bytes> for Outbound {
    fn from(data: Bytes) -> Self {
        Self::Data(data)
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(data: Vec<u8>) -> Self {
        Self::Data(Bytes::from(data))
    }
}

impl From<&'static str> for Outbound {
    fn from(data: &'static str) -> Self {
        Self::Data(Bytes::from_static(data.as_bytes()))
    }
}

impl From<WsFrame> for Outbound {
    fn from(frame: WsFrame) -> Self {
        Self::Frame(frame)
    }
}

/// Decides whether closing a handle physically closes the connection.
///
/// Returning `true` closes the underlying stream; returning `false`
/// leaves it open (the seam where a connection pool would take the
/// stream back).
pub type CloseAction = Arc<dyn Fn(&ChannelHandle) -> bool + Send + Sync>;

/// A shared handle over a live connection.
///
/// The handle exposes only the operations the core needs externally:
/// queueing writes, closing, and liveness checks. Writes are drained in
/// FIFO order by the connection's task; each write is flushed before the
/// next begins.
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    close_action: Option<CloseAction>,
}

impl ChannelHandle {
    pub(crate) fn new(outbound: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            outbound,
            cancel,
            close_action: None,
        }
    }

    /// Replaces the close decision for this handle.
    pub fn with_close_action(mut self, action: CloseAction) -> Self {
        self.close_action = Some(action);
        self
    }

    /// Queues `item` for writing. Fails when the connection is closed or
    /// its write queue is full.
    pub fn write(&self, item: impl Into<Outbound>) -> HttpResult<()> {
        if self.cancel.is_cancelled() {
            return Err(HttpError::Io("channel closed".into()));
        }
        self.outbound
            .try_send(item.into())
            .map_err(|e| HttpError::Io(format!("write queue rejected item: {e}")))
    }

    /// Closes the channel, subject to the close action.
    ///
    /// Returns whether the underlying connection was physically closed.
    pub fn close(&self) -> bool {
        let physically = match &self.close_action {
            Some(action) => action(self),
            None => true,
        };
        if physically {
            self.cancel.cancel();
        }
        physically
    }

    /// Whether the connection is still open and accepting writes.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("open", &self.is_open())
            .field("custom_close_action", &self.close_action.is_some())
            .finish()
    }
}
