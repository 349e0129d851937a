//! The client: construction, dispatch, redirect retry, and shutdown.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use url::Url;

use riptide_core::{
    ActivityMonitor, Body, ChannelOption, ClientConfig, CookieStore, ErrorHook, HttpError,
    HttpResult, Interceptor, Marshaller, Method, Request, Resolver,
};

use crate::builder::RequestBuilder;
use crate::connection::run_submission;
use crate::future::ResponseFuture;
use crate::info::RequestInfo;
use crate::marshal::MarshallerRegistry;
use crate::tls::TlsBootstraps;
use crate::websocket::Handshaker;

/// Drain window granted to in-flight work on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// RFC 1123 date format for the `Date` request header.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

enum Reactor {
    /// A runtime owned by this client, sized by `thread_count`.
    Owned {
        runtime: Mutex<Option<Runtime>>,
        handle: Handle,
    },
    /// A caller-provided runtime handle.
    External(Handle),
}

impl Reactor {
    fn handle(&self) -> &Handle {
        match self {
            Self::Owned { handle, .. } => handle,
            Self::External(handle) => handle,
        }
    }
}

/// Shared client internals: configuration, the TLS bootstrap cache, the
/// marshaller registry, and the reactor.
pub(crate) struct ClientCore {
    pub(crate) config: ClientConfig,
    pub(crate) tls: TlsBootstraps,
    pub(crate) marshallers: MarshallerRegistry,
    reactor: Reactor,
}

impl ClientCore {
    pub(crate) fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.reactor.handle().spawn(task);
    }

    /// Resolves the URL's host to socket addresses, via the configured
    /// resolver override when present.
    pub(crate) async fn resolve(&self, url: &Url) -> io::Result<Vec<SocketAddr>> {
        let host = url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        match &self.config.resolver {
            Some(resolver) => resolver.resolve(host, port).await,
            None => SystemResolver.resolve(host, port).await,
        }
    }

    /// Produces the wire snapshot for one attempt: request-header
    /// policy, upgrade headers, cookie decoration, then interceptors.
    pub(crate) fn finalize_request(&self, info: &RequestInfo) -> Request {
        let mut request = info.request.clone();
        request.url = info.url.clone();

        if request.include_host_header {
            // Rewritten per attempt, so redirects carry the target host.
            if let Some(host) = request.host_header_value() {
                request.headers.set("Host", host);
            }
        }
        if request.include_connection_header && !request.headers.contains("Connection") {
            request.headers.set("Connection", "close");
        }
        if request.include_date_header && !request.headers.contains("Date") {
            request
                .headers
                .set("Date", Utc::now().format(HTTP_DATE_FORMAT).to_string());
        }
        if let Some(agent) = &self.config.user_agent {
            if !request.headers.contains("User-Agent") {
                request.headers.set("User-Agent", agent.clone());
            }
        }
        if self.config.compression && !request.headers.contains("Accept-Encoding") {
            request.headers.set("Accept-Encoding", "gzip");
        }

        match &request.body {
            Body::Bytes(bytes) if !bytes.is_empty() => {
                request.headers.remove("Transfer-Encoding");
                request.headers.set("Content-Length", bytes.len().to_string());
            }
            Body::Chunked(_) => {
                request.headers.remove("Content-Length");
                request.headers.set("Transfer-Encoding", "chunked");
                if request.send_100_continue
                    && self.config.send_100_continue
                    && !request.headers.contains("Expect")
                {
                    request.headers.set("Expect", "100-continue");
                }
            }
            _ => {}
        }

        if let Some(handshaker) = &info.websocket {
            handshaker.apply_request_headers(&mut request.headers);
        }

        let jar = info
            .cookie_store
            .clone()
            .or_else(|| self.config.cookie_store.clone());
        if let Some(jar) = jar {
            jar.decorate(&request.url, &mut request.headers);
        }

        let mut request = request;
        for interceptor in &self.config.interceptors {
            request = interceptor.intercept(request);
        }
        request
    }

    /// Spawns a connection attempt for `info`.
    pub(crate) fn submit(self: &Arc<Self>, info: RequestInfo, future: Arc<ResponseFuture>) {
        let core = self.clone();
        self.spawn(run_submission(core, info, future));
    }

    /// Re-issues a redirected request: `303` rewrites to a bodyless
    /// `GET`, every other redirect status preserves method and body. The
    /// new attempt inherits the absolute deadline, so it runs on the
    /// remaining time.
    pub(crate) fn redirect(
        self: &Arc<Self>,
        next_url: Url,
        status: u16,
        prior: &RequestInfo,
        future: Arc<ResponseFuture>,
    ) {
        self.submit(redirected_info(next_url, status, prior), future);
    }
}

/// The control block for a redirect hop.
pub(crate) fn redirected_info(next_url: Url, status: u16, prior: &RequestInfo) -> RequestInfo {
    let mut request = prior.request.clone();
    if status == 303 {
        request.method = Method::Get;
        request.body = Body::Empty;
    }
    request.url = next_url.clone();

    let websocket = prior.websocket.as_ref().map(|h| {
        Handshaker::new(next_url.clone(), h.version()).with_max_frame_size(h.max_frame_size())
    });
    RequestInfo {
        request,
        url: next_url,
        cancelled: prior.cancelled.clone(),
        redirect_count: prior.redirect_count + 1,
        started_at: prior.started_at,
        deadline: prior.deadline,
        websocket,
        cookie_store: prior.cookie_store.clone(),
        silenced: false,
    }
}

impl fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCore")
            .field("config", &self.config)
            .field("owned_reactor", &matches!(self.reactor, Reactor::Owned { .. }))
            .finish()
    }
}

/// The system resolver, backed by `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// An asynchronous HTTP/1.1 client with WebSocket upgrade support.
///
/// Cheap to clone; all clones share the reactor, configuration, and TLS
/// bootstrap cache.
#[derive(Debug, Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Starts building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A client with default configuration and an owned reactor.
    pub fn new() -> HttpResult<Self> {
        Self::builder().build()
    }

    /// A client with `config` and an owned reactor.
    pub fn with_config(config: ClientConfig) -> HttpResult<Self> {
        Self::builder().config(config).build()
    }

    /// The active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    /// Starts a request with `method` for `url`.
    ///
    /// This is the only point that fails synchronously, and only for
    /// programmer errors: unparseable URLs or unsupported schemes.
    pub fn request(&self, method: Method, url: &str) -> HttpResult<RequestBuilder> {
        let parsed = Url::parse(url)
            .map_err(|e| HttpError::InvalidInput(format!("invalid URL {url:?}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(HttpError::InvalidInput(format!(
                    "unsupported scheme {other:?} in {url:?}"
                )))
            }
        }
        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidInput(format!("URL {url:?} has no host")));
        }
        let mut request = Request::new(method, parsed);
        request.send_100_continue = self.core.config.send_100_continue;
        Ok(RequestBuilder::new(self.core.clone(), request))
    }

    /// Starts a GET request.
    pub fn get(&self, url: &str) -> HttpResult<RequestBuilder> {
        self.request(Method::Get, url)
    }

    /// Starts a HEAD request.
    pub fn head(&self, url: &str) -> HttpResult<RequestBuilder> {
        self.request(Method::Head, url)
    }

    /// Starts a POST request.
    pub fn post(&self, url: &str) -> HttpResult<RequestBuilder> {
        self.request(Method::Post, url)
    }

    /// Starts a PUT request.
    pub fn put(&self, url: &str) -> HttpResult<RequestBuilder> {
        self.request(Method::Put, url)
    }

    /// Starts a DELETE request.
    pub fn delete(&self, url: &str) -> HttpResult<RequestBuilder> {
        self.request(Method::Delete, url)
    }

    /// Starts an OPTIONS request.
    pub fn options(&self, url: &str) -> HttpResult<RequestBuilder> {
        self.request(Method::Options, url)
    }

    /// Shuts the client down.
    ///
    /// An owned reactor is drained within a bounded grace window and
    /// forced down on expiry. Must not be called from a reactor thread.
    /// A client built on an injected reactor handle leaves that runtime
    /// untouched.
    pub fn shutdown(self) {
        if let Reactor::Owned { runtime, .. } = &self.core.reactor {
            if let Some(runtime) = runtime.lock().take() {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
        }
    }
}

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
    reactor: Option<Handle>,
    thread_count_set: bool,
    tls_override: Option<Arc<rustls::ClientConfig>>,
}

impl ClientBuilder {
    /// Starts from the default configuration.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            reactor: None,
            thread_count_set: false,
            tls_override: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// See [`ClientConfig::with_compression`].
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// See [`ClientConfig::with_follow_redirects`].
    pub fn follow_redirects(mut self, enabled: bool) -> Self {
        self.config.follow_redirects = enabled;
        self
    }

    /// See [`ClientConfig::with_max_redirects`].
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// See [`ClientConfig::with_user_agent`].
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// See [`ClientConfig::with_timeout`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// See [`ClientConfig::with_send_100_continue`].
    pub fn send_100_continue(mut self, enabled: bool) -> Self {
        self.config.send_100_continue = enabled;
        self
    }

    /// See [`ClientConfig::with_websocket_support`].
    pub fn websocket_support(mut self, enabled: bool) -> Self {
        self.config.websocket_support = enabled;
        self
    }

    /// See [`ClientConfig::with_max_chunk_size`].
    pub fn max_chunk_size(mut self, bytes: usize) -> Self {
        self.config.max_chunk_size = bytes;
        self
    }

    /// See [`ClientConfig::with_max_initial_line_length`].
    pub fn max_initial_line_length(mut self, bytes: usize) -> Self {
        self.config.max_initial_line_length = bytes;
        self
    }

    /// See [`ClientConfig::with_max_headers_size`].
    pub fn max_headers_size(mut self, bytes: usize) -> Self {
        self.config.max_headers_size = bytes;
        self
    }

    /// Sizes the owned reactor. Mutually exclusive with [`Self::reactor`].
    pub fn thread_count(mut self, threads: usize) -> Self {
        self.config.thread_count = threads;
        self.thread_count_set = true;
        self
    }

    /// Runs submissions on an existing runtime instead of an owned one.
    pub fn reactor(mut self, handle: Handle) -> Self {
        self.reactor = Some(handle);
        self
    }

    /// See [`ClientConfig::with_channel_option`].
    pub fn channel_option(mut self, option: ChannelOption) -> Self {
        self.config.channel_options.insert(option.key(), option);
        self
    }

    /// See [`ClientConfig::with_cookie_store`].
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.config.cookie_store = Some(store);
        self
    }

    /// See [`ClientConfig::with_resolver`].
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.config.resolver = Some(resolver);
        self
    }

    /// See [`ClientConfig::with_interceptor`].
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.config.interceptors.push(interceptor);
        self
    }

    /// See [`ClientConfig::with_marshaller`].
    pub fn marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.config.marshallers.push(marshaller);
        self
    }

    /// See [`ClientConfig::with_activity_monitor`].
    pub fn activity_monitor(mut self, monitor: Arc<dyn ActivityMonitor>) -> Self {
        self.config.activity_monitors.push(monitor);
        self
    }

    /// See [`ClientConfig::with_error_hook`].
    pub fn error_hook(mut self, hook: ErrorHook) -> Self {
        self.config.error_hook = Some(hook);
        self
    }

    /// Overrides the TLS context used by the bootstrap cache.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_override = Some(config);
        self
    }

    /// Builds the client.
    pub fn build(self) -> HttpResult<Client> {
        if self.thread_count_set && self.reactor.is_some() {
            return Err(HttpError::InvalidInput(
                "thread_count and an injected reactor are mutually exclusive".into(),
            ));
        }

        let reactor = match self.reactor {
            Some(handle) => Reactor::External(handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.config.thread_count)
                    .enable_io()
                    .enable_time()
                    .thread_name("riptide-io")
                    .build()
                    .map_err(|e| HttpError::Io(format!("failed to start reactor: {e}")))?;
                let handle = runtime.handle().clone();
                Reactor::Owned {
                    runtime: Mutex::new(Some(runtime)),
                    handle,
                }
            }
        };

        let mut marshallers = MarshallerRegistry::with_defaults();
        for marshaller in &self.config.marshallers {
            marshallers.register(marshaller.clone());
        }

        Ok(Client {
            core: Arc::new(ClientCore {
                tls: TlsBootstraps::new(self.tls_override),
                marshallers,
                config: self.config,
                reactor,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::Headers;
    use std::sync::atomic::AtomicBool;

    fn core() -> Arc<ClientCore> {
        let client = Client::builder()
            .reactor(Handle::current())
            .build()
            .unwrap();
        client.core
    }

    fn info_for(request: Request) -> RequestInfo {
        let url = request.url.clone();
        RequestInfo::new(
            request,
            url,
            Arc::new(AtomicBool::new(false)),
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn default_header_policy() {
        let core = core();
        let request = Request::new(
            Method::Get,
            Url::parse("http://example.com:8080/path").unwrap(),
        );
        let wire = core.finalize_request(&info_for(request));

        assert_eq!(wire.headers.get("Host"), Some("example.com:8080"));
        assert_eq!(wire.headers.get("Connection"), Some("close"));
        let date = wire.headers.get("Date").unwrap();
        assert!(date.ends_with(" GMT"), "unexpected date format: {date}");
        assert!(wire.headers.get("User-Agent").is_none());
        assert!(wire.headers.get("Accept-Encoding").is_none());
    }

    #[tokio::test]
    async fn suppression_flags_omit_policy_headers() {
        let core = core();
        let mut request = Request::new(Method::Get, Url::parse("http://example.com/").unwrap());
        request.include_host_header = false;
        request.include_connection_header = false;
        request.include_date_header = false;
        let wire = core.finalize_request(&info_for(request));

        assert!(wire.headers.get("Host").is_none());
        assert!(wire.headers.get("Connection").is_none());
        assert!(wire.headers.get("Date").is_none());
    }

    #[tokio::test]
    async fn bodied_requests_get_exactly_one_framing_header() {
        let core = core();
        let mut request = Request::new(Method::Post, Url::parse("http://example.com/").unwrap());
        request.body = Body::Bytes(bytes::Bytes::from_static(b"hello"));
        let wire = core.finalize_request(&info_for(request));
        assert_eq!(wire.headers.get("Content-Length"), Some("5"));
        assert!(wire.headers.get("Transfer-Encoding").is_none());

        let mut request = Request::new(Method::Put, Url::parse("http://example.com/").unwrap());
        request.body = Body::Chunked(Arc::new(
            |_: usize| -> riptide_core::HttpResult<Option<bytes::Bytes>> { Ok(None) },
        ));
        let wire = core.finalize_request(&info_for(request));
        assert_eq!(wire.headers.get("Transfer-Encoding"), Some("chunked"));
        assert!(wire.headers.get("Content-Length").is_none());
        assert_eq!(wire.headers.get("Expect"), Some("100-continue"));
    }

    #[tokio::test]
    async fn user_agent_and_compression_headers() {
        let client = Client::builder()
            .reactor(Handle::current())
            .user_agent("riptide-test/1.0")
            .compression(true)
            .build()
            .unwrap();
        let request = Request::new(Method::Get, Url::parse("http://example.com/").unwrap());
        let info = info_for(request);
        let wire = client.core.finalize_request(&info);

        assert_eq!(wire.headers.get("User-Agent"), Some("riptide-test/1.0"));
        assert_eq!(wire.headers.get("Accept-Encoding"), Some("gzip"));
    }

    #[tokio::test]
    async fn interceptors_run_in_order_and_replace_the_request() {
        let client = Client::builder()
            .reactor(Handle::current())
            .interceptor(Arc::new(|mut request: Request| {
                request.headers.set("X-Order", "first");
                request
            }))
            .interceptor(Arc::new(|mut request: Request| {
                let prior = request.headers.get("X-Order").unwrap_or("").to_string();
                request.headers.set("X-Order", format!("{prior},second"));
                request
            }))
            .build()
            .unwrap();
        let request = Request::new(Method::Get, Url::parse("http://example.com/").unwrap());
        let info = info_for(request);
        let wire = client.core.finalize_request(&info);

        assert_eq!(wire.headers.get("X-Order"), Some("first,second"));
    }

    #[tokio::test]
    async fn redirect_303_rewrites_to_bodyless_get() {
        let core = core();
        let mut request = Request::new(Method::Post, Url::parse("http://a.example/form").unwrap());
        request.body = Body::Bytes(bytes::Bytes::from_static(b"payload"));
        let prior = info_for(request);

        let next = Url::parse("http://a.example/result").unwrap();
        let hop = redirected_info(next.clone(), 303, &prior);
        assert_eq!(hop.redirect_count, 1);
        assert!(Arc::ptr_eq(&hop.cancelled, &prior.cancelled));

        let wire = core.finalize_request(&hop);
        assert_eq!(wire.method, Method::Get);
        assert!(wire.headers.get("Content-Length").is_none());
        assert_eq!(wire.headers.get("Host"), Some("a.example"));
        assert_eq!(wire.url, next);
    }

    #[tokio::test]
    async fn redirect_301_preserves_method_and_body() {
        let mut request = Request::new(Method::Put, Url::parse("http://a.example/x").unwrap());
        request.body = Body::Bytes(bytes::Bytes::from_static(b"payload"));
        let prior = info_for(request);

        let hop = redirected_info(Url::parse("http://b.example/y").unwrap(), 301, &prior);
        assert_eq!(hop.request.method, Method::Put);
        assert!(matches!(&hop.request.body, Body::Bytes(b) if b.as_ref() == b"payload"));
    }

    #[tokio::test]
    async fn request_rejects_bad_urls() {
        let client = Client::builder()
            .reactor(Handle::current())
            .build()
            .unwrap();
        assert!(matches!(
            client.get("not a url"),
            Err(HttpError::InvalidInput(_))
        ));
        assert!(matches!(
            client.get("ftp://example.com/"),
            Err(HttpError::InvalidInput(_))
        ));
        assert!(client.get("http://example.com/").is_ok());
    }

    #[tokio::test]
    async fn thread_count_conflicts_with_injected_reactor() {
        let result = Client::builder()
            .reactor(Handle::current())
            .thread_count(2)
            .build();
        assert!(matches!(result, Err(HttpError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn cookie_decoration_applies_to_outgoing_requests() {
        use crate::cookies::MemoryCookieStore;

        let jar = Arc::new(MemoryCookieStore::new());
        let url = Url::parse("http://example.com/").unwrap();
        let mut set = Headers::new();
        set.append("Set-Cookie", "token=42");
        jar.extract(&url, &set);

        let client = Client::builder()
            .reactor(Handle::current())
            .cookie_store(jar)
            .build()
            .unwrap();
        let request = Request::new(Method::Get, url.clone());
        let info = info_for(request);
        let wire = client.core.finalize_request(&info);
        assert_eq!(wire.headers.get("Cookie"), Some("token=42"));
    }
}
