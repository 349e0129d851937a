//! Client configuration surface.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::traits::{ActivityMonitor, CookieStore, ErrorHook, Interceptor, Marshaller, Resolver};

/// Default response chunk size bound.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 65_536;
/// Default bound on the response status line.
pub const DEFAULT_MAX_INITIAL_LINE_LENGTH: usize = 2_048;
/// Default bound on the total size of response headers.
pub const DEFAULT_MAX_HEADERS_SIZE: usize = 16_384;
/// Default reactor thread count when the client owns its runtime.
pub const DEFAULT_THREAD_COUNT: usize = 4;
/// Default maximum number of redirects followed per submission.
pub const DEFAULT_MAX_REDIRECTS: u32 = 15;

/// Identity key of a [`ChannelOption`]; options are compared and replaced
/// by key, not by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOptionKey {
    /// `TCP_NODELAY`.
    TcpNoDelay,
    /// `SO_KEEPALIVE`.
    SoKeepAlive,
    /// Socket send buffer size.
    SendBufferSize,
    /// Socket receive buffer size.
    RecvBufferSize,
    /// Bound on the connect syscall itself.
    ConnectTimeout,
}

/// A socket option applied to the bootstrap when opening connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOption {
    /// Disable Nagle's algorithm.
    TcpNoDelay(bool),
    /// Enable TCP keep-alive probes.
    SoKeepAlive(bool),
    /// Socket send buffer size in bytes.
    SendBufferSize(u32),
    /// Socket receive buffer size in bytes.
    RecvBufferSize(u32),
    /// Bound on the connect syscall itself.
    ConnectTimeout(Duration),
}

impl ChannelOption {
    /// The identity key this option is stored and compared under.
    pub fn key(&self) -> ChannelOptionKey {
        match self {
            Self::TcpNoDelay(_) => ChannelOptionKey::TcpNoDelay,
            Self::SoKeepAlive(_) => ChannelOptionKey::SoKeepAlive,
            Self::SendBufferSize(_) => ChannelOptionKey::SendBufferSize,
            Self::RecvBufferSize(_) => ChannelOptionKey::RecvBufferSize,
            Self::ConnectTimeout(_) => ChannelOptionKey::ConnectTimeout,
        }
    }
}

/// Configuration for a client instance.
///
/// All options have defaults; construct with [`ClientConfig::default`]
/// and refine with the `with_*` methods.
#[derive(Clone)]
pub struct ClientConfig {
    /// Advertise `Accept-Encoding: gzip` and install the decompressor.
    pub compression: bool,
    /// Bound on decoded body chunk size.
    pub max_chunk_size: usize,
    /// Bound on the response status line.
    pub max_initial_line_length: usize,
    /// Bound on the total size of response headers.
    pub max_headers_size: usize,
    /// Worker threads for an owned reactor; ignored when a reactor handle
    /// is injected.
    pub thread_count: usize,
    /// Follow redirect responses automatically.
    pub follow_redirects: bool,
    /// Maximum redirects per submission before `RedirectLoop`.
    pub max_redirects: u32,
    /// `User-Agent` header added to every request when set.
    pub user_agent: Option<String>,
    /// Default per-request deadline.
    pub timeout: Option<Duration>,
    /// Add `Expect: 100-continue` to bodied requests.
    pub send_100_continue: bool,
    /// Enable the WebSocket upgrade path.
    pub websocket_support: bool,
    /// Socket options applied to the bootstrap, keyed by option identity.
    pub channel_options: HashMap<ChannelOptionKey, ChannelOption>,
    /// Default cookie jar, decorated into and extracted from every request.
    pub cookie_store: Option<Arc<dyn CookieStore>>,
    /// Host resolution override.
    pub resolver: Option<Arc<dyn Resolver>>,
    /// Pre-write request transformers, in run order.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    /// Content type registry for body marshalling.
    pub marshallers: Vec<Arc<dyn Marshaller>>,
    /// Client-level observers of every state transition.
    pub activity_monitors: Vec<Arc<dyn ActivityMonitor>>,
    /// Hook receiving observer panics and exception-path errors.
    pub error_hook: Option<ErrorHook>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            compression: false,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
            thread_count: DEFAULT_THREAD_COUNT,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: None,
            timeout: None,
            send_100_continue: true,
            websocket_support: false,
            channel_options: HashMap::new(),
            cookie_store: None,
            resolver: None,
            interceptors: Vec::new(),
            marshallers: Vec::new(),
            activity_monitors: Vec::new(),
            error_hook: None,
        }
    }
}

impl ClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables transparent response decompression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Sets the decoded chunk size bound.
    pub fn with_max_chunk_size(mut self, bytes: usize) -> Self {
        self.max_chunk_size = bytes;
        self
    }

    /// Sets the status line length bound.
    pub fn with_max_initial_line_length(mut self, bytes: usize) -> Self {
        self.max_initial_line_length = bytes;
        self
    }

    /// Sets the headers size bound.
    pub fn with_max_headers_size(mut self, bytes: usize) -> Self {
        self.max_headers_size = bytes;
        self
    }

    /// Sets the owned-reactor thread count.
    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    /// Enables or disables automatic redirect following.
    pub fn with_follow_redirects(mut self, enabled: bool) -> Self {
        self.follow_redirects = enabled;
        self
    }

    /// Sets the redirect limit.
    pub fn with_max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    /// Sets the `User-Agent` header value.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Sets the default per-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables `Expect: 100-continue` for bodied requests.
    pub fn with_send_100_continue(mut self, enabled: bool) -> Self {
        self.send_100_continue = enabled;
        self
    }

    /// Enables the WebSocket upgrade path.
    pub fn with_websocket_support(mut self, enabled: bool) -> Self {
        self.websocket_support = enabled;
        self
    }

    /// Sets a socket option, replacing any previous option with the same
    /// key.
    pub fn with_channel_option(mut self, option: ChannelOption) -> Self {
        self.channel_options.insert(option.key(), option);
        self
    }

    /// Sets the default cookie jar.
    pub fn with_cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Overrides host resolution.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Appends a pre-write interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Registers a marshaller.
    pub fn with_marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshallers.push(marshaller);
        self
    }

    /// Registers an activity monitor.
    pub fn with_activity_monitor(mut self, monitor: Arc<dyn ActivityMonitor>) -> Self {
        self.activity_monitors.push(monitor);
        self
    }

    /// Sets the error hook.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("compression", &self.compression)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("max_initial_line_length", &self.max_initial_line_length)
            .field("max_headers_size", &self.max_headers_size)
            .field("thread_count", &self.thread_count)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("send_100_continue", &self.send_100_continue)
            .field("websocket_support", &self.websocket_support)
            .field("channel_options", &self.channel_options)
            .field("cookie_store", &self.cookie_store.is_some())
            .field("resolver", &self.resolver.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("marshallers", &self.marshallers.len())
            .field("activity_monitors", &self.activity_monitors.len())
            .field("error_hook", &self.error_hook.is_some())
            .finish()
    }
}
