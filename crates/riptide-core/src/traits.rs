//! Collaborator traits consumed by the client core.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{HttpError, HttpResult};
use crate::headers::Headers;
use crate::request::Request;
use crate::state::StateType;

/// Hook invoked with errors raised by user observers or exception paths.
pub type ErrorHook = Arc<dyn Fn(&HttpError) + Send + Sync>;

/// A cookie jar consumed by the client.
///
/// Decoration runs under the jar's read lock immediately before a request
/// is written; extraction runs under the write lock when response headers
/// arrive. Persistence format is the implementation's concern.
pub trait CookieStore: Send + Sync {
    /// Emits `Cookie` headers for jar entries matching the URL's domain
    /// and path.
    fn decorate(&self, url: &Url, headers: &mut Headers);

    /// Captures `Set-Cookie` entries from a response for `url`.
    fn extract(&self, url: &Url, headers: &Headers);
}

/// A pre-write request transformer.
///
/// Interceptors run in registration order and observe the request
/// immediately before it is written; their output replaces the request.
pub trait Interceptor: Send + Sync {
    /// Transforms the outgoing request.
    fn intercept(&self, request: Request) -> Request;
}

impl<F> Interceptor for F
where
    F: Fn(Request) -> Request + Send + Sync,
{
    fn intercept(&self, request: Request) -> Request {
        self(request)
    }
}

/// A `(value, media type) <-> bytes` codec registered with the client.
///
/// The interchange type is [`serde_json::Value`]; typed access goes
/// through `serde_json::from_value` on the caller's side.
pub trait Marshaller: Send + Sync {
    /// Media types this marshaller claims, e.g. `application/json`.
    fn media_types(&self) -> &[&str];

    /// Decodes a response body.
    fn unmarshal(&self, body: &[u8]) -> HttpResult<serde_json::Value>;

    /// Encodes a request body, returning the content type to declare.
    fn marshal(&self, value: &serde_json::Value) -> HttpResult<(&'static str, Bytes)>;
}

/// Resolves a host name to socket addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves `host:port` to one or more addresses, in preference order.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// A client-level observer of every request's state transitions.
///
/// Monitors see the tag and target URL of each transition for each
/// in-flight request, on the I/O task that produced it; they must not
/// block.
pub trait ActivityMonitor: Send + Sync {
    /// Called for every emitted state transition.
    fn on_transition(&self, state: StateType, url: &Url);
}

impl<F> ActivityMonitor for F
where
    F: Fn(StateType, &Url) + Send + Sync,
{
    fn on_transition(&self, state: StateType, url: &Url) {
        self(state, url)
    }
}
