//! TLS stage and per-host bootstrap cache.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use moka::future::Cache;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use riptide_core::{HttpError, HttpResult};

/// Idle window after which a cached bootstrap expires.
const BOOTSTRAP_IDLE_EXPIRY: Duration = Duration::from_secs(120);

/// Unified connection stream: plain TCP or TLS.
pub enum MaybeTlsStream {
    /// An unencrypted TCP stream.
    Plain(TcpStream),
    /// A TLS-wrapped TCP stream.
    Tls(Box<TlsStream<TcpStream>>),
}

impl fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            Self::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A connector bound to one `(host, port)` key, carrying the SNI name.
#[derive(Clone)]
pub struct TlsBootstrap {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsBootstrap {
    /// Wraps a connected TCP stream, driving the TLS handshake.
    pub async fn wrap(&self, stream: TcpStream) -> HttpResult<TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| HttpError::Tls(e.to_string()))
    }
}

impl fmt::Debug for TlsBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBootstrap")
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// The `(host, port)`-keyed TLS bootstrap cache.
///
/// Entries expire after two idle minutes. Construction initializes the
/// TLS context once and binds each entry's engine to its key's host for
/// SNI.
pub struct TlsBootstraps {
    cache: Cache<(String, u16), TlsBootstrap>,
    base: Arc<rustls::ClientConfig>,
}

impl TlsBootstraps {
    /// Creates the cache, using `override_config` in place of the
    /// default webpki-roots context when provided.
    pub fn new(override_config: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            cache: Cache::builder().time_to_idle(BOOTSTRAP_IDLE_EXPIRY).build(),
            base: override_config.unwrap_or_else(default_tls_config),
        }
    }

    /// Returns the bootstrap for `(host, port)`, constructing and caching
    /// it on first use.
    pub async fn bootstrap(&self, host: &str, port: u16) -> HttpResult<TlsBootstrap> {
        let base = self.base.clone();
        let sni_host = host.to_string();
        self.cache
            .try_get_with((host.to_string(), port), async move {
                let server_name = ServerName::try_from(sni_host)
                    .map_err(|e| HttpError::Tls(format!("invalid SNI host: {e}")))?;
                Ok(TlsBootstrap {
                    connector: TlsConnector::from(base),
                    server_name,
                })
            })
            .await
            .map_err(|e: Arc<HttpError>| (*e).clone())
    }

    /// Number of live cache entries.
    pub fn cached_len(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl fmt::Debug for TlsBootstraps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBootstraps")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_is_cached_per_host_port() {
        let bootstraps = TlsBootstraps::new(None);
        bootstraps.bootstrap("example.com", 443).await.unwrap();
        bootstraps.bootstrap("example.com", 443).await.unwrap();
        bootstraps.bootstrap("example.com", 8443).await.unwrap();
        bootstraps.cache.run_pending_tasks().await;
        assert_eq!(bootstraps.cached_len(), 2);
    }

    #[tokio::test]
    async fn ip_hosts_are_valid_sni_keys() {
        let bootstraps = TlsBootstraps::new(None);
        assert!(bootstraps.bootstrap("127.0.0.1", 443).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_host_is_a_tls_error() {
        let bootstraps = TlsBootstraps::new(None);
        let err = bootstraps.bootstrap("not a hostname", 443).await.unwrap_err();
        assert!(matches!(err, HttpError::Tls(_)));
    }
}
