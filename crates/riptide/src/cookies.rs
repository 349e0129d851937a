//! Cookie decoration and extraction.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use url::Url;

use riptide_core::{CookieStore, Headers};

/// Cookie date format, RFC 1123 with a literal GMT zone.
const COOKIE_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A single cookie jar entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Domain scope; host-only when taken from the response URL.
    pub domain: Option<String>,
    /// Path scope.
    pub path: Option<String>,
    /// Expiry instant; session cookie when absent.
    pub expires: Option<DateTime<Utc>>,
    /// Only sent over TLS.
    pub secure: bool,
    /// Marked HttpOnly by the server.
    pub http_only: bool,
}

impl Cookie {
    /// Parses a `Set-Cookie` header value. Returns `None` when the
    /// leading `name=value` pair is missing.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Self {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: None,
            path: None,
            expires: None,
            secure: false,
            http_only: false,
        };

        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            if key.eq_ignore_ascii_case("domain") {
                cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
            } else if key.eq_ignore_ascii_case("path") {
                cookie.path = Some(val.to_string());
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if key.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if key.eq_ignore_ascii_case("max-age") {
                if let Ok(seconds) = val.parse::<i64>() {
                    cookie.expires = Some(Utc::now() + TimeDelta::seconds(seconds));
                }
            } else if key.eq_ignore_ascii_case("expires") && cookie.expires.is_none() {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(val, COOKIE_DATE_FORMAT) {
                    cookie.expires = Some(parsed.and_utc());
                }
            }
        }
        Some(cookie)
    }

    /// Whether the cookie has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Whether the cookie applies to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = match &self.domain {
            Some(domain) => host == *domain || host.ends_with(&format!(".{domain}")),
            None => false,
        };
        if !domain_ok {
            return false;
        }
        match &self.path {
            Some(path) => url.path().starts_with(path.as_str()),
            None => true,
        }
    }

    fn same_scope(&self, other: &Self) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

/// The default in-memory cookie jar.
///
/// Decoration takes the read lock; extraction takes the write lock.
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    entries: RwLock<Vec<Cookie>>,
}

impl MemoryCookieStore {
    /// Creates an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the current entries, for inspection.
    pub fn entries(&self) -> Vec<Cookie> {
        self.entries.read().clone()
    }

    /// Number of stored cookies.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the jar holds no cookies.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CookieStore for MemoryCookieStore {
    fn decorate(&self, url: &Url, headers: &mut Headers) {
        let now = Utc::now();
        let entries = self.entries.read();
        let line = entries
            .iter()
            .filter(|c| !c.is_expired(now) && c.matches(url))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        if !line.is_empty() {
            headers.append("Cookie", line);
        }
    }

    fn extract(&self, url: &Url, headers: &Headers) {
        let set_cookies = headers.get_all("Set-Cookie");
        if set_cookies.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut entries = self.entries.write();
        for raw in set_cookies {
            let Some(mut cookie) = Cookie::parse(raw) else {
                tracing::debug!("ignoring unparseable Set-Cookie header: {raw:?}");
                continue;
            };
            if cookie.domain.is_none() {
                cookie.domain = url.host_str().map(str::to_ascii_lowercase);
            }
            if cookie.path.is_none() {
                cookie.path = Some(default_path(url));
            }
            entries.retain(|existing| !existing.same_scope(&cookie));
            if !cookie.is_expired(now) {
                entries.push(cookie);
            }
        }
    }
}

/// The default cookie path for a URL: its path up to, but not including,
/// the final segment.
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}
