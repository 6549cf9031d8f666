//! Transport resolution: which mechanism performs the I/O for a URL scheme.
//!
//! # Design
//! A `Registry` is an explicit value, built once and handed to a `Session`,
//! so tests can run against their own isolated set of handlers. Each scheme
//! has exactly one handler; registering a scheme again replaces the previous
//! handler and returns it.
//!
//! `dispatch` resolves the scheme before it encodes anything, so an
//! unregistered scheme fails without touching the filesystem or network.

pub mod file;
pub mod tcp;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::encode::{self, EncodedBody};
use crate::error::{EncodingError, Error, TransportError};
use crate::http::{Headers, HttpRequest, HttpResponse, Method, RawRequest, HTTP_11};

pub use file::FileTransport;
pub use tcp::TcpTransport;

pub const USER_AGENT: &str = concat!("harness/", env!("CARGO_PKG_VERSION"));

/// Performs one request/response exchange for a scheme.
///
/// `request` is fully framed (origin-form target, body encoded); `url` is
/// the full absolute target for handlers that need host, port or path.
pub trait Transport: Send + Sync {
    fn round_trip(
        &self,
        request: &RawRequest,
        url: &Url,
        deadline: Option<Instant>,
    ) -> Result<HttpResponse, TransportError>;
}

/// Scheme → transport table.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Transport>>,
}

impl Registry {
    /// An empty registry; every scheme is unregistered.
    pub fn new() -> Self {
        Self::default()
    }

    /// `http` and `https` over a direct or proxied TCP connection, plus
    /// `file` rooted at the configured base directory.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        let http = match &config.proxy {
            Some(proxy) => TcpTransport::proxy(proxy.clone()),
            None => TcpTransport::direct(),
        };
        registry.register("https", http.clone().with_tls());
        registry.register("http", http);
        registry.register("file", FileTransport::new(&config.base_dir));
        registry
    }

    /// Install `transport` for `scheme`, returning the handler it replaces.
    pub fn register<T>(&mut self, scheme: &str, transport: T) -> Option<Arc<dyn Transport>>
    where
        T: Transport + 'static,
    {
        self.register_shared(scheme, Arc::new(transport))
    }

    pub fn register_shared(&mut self, scheme: &str, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let scheme = scheme.to_ascii_lowercase();
        debug!(%scheme, "registering transport");
        self.handlers.insert(scheme, transport)
    }

    pub fn resolve(&self, scheme: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.handlers
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::SchemeNotRegistered {
                scheme: scheme.to_string(),
            })
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Resolve, encode, frame and send `request`.
    pub fn dispatch(&self, request: &HttpRequest, deadline: Option<Instant>) -> Result<HttpResponse, Error> {
        let transport = self.resolve(request.url.scheme())?;
        let body = encode::encode(&request.payload)?;
        let raw = prepare(request, body)?;
        debug!(method = %raw.method, url = %request.url, "dispatching request");
        let response = transport.round_trip(&raw, &request.url, deadline)?;
        debug!(status = response.status, url = %request.url, "received response");
        Ok(response)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("schemes", &self.schemes()).finish()
    }
}

/// Lower a logical request into its wire form.
///
/// Framing headers (`Host`, `Content-Type`, `Content-Length`, `Connection`)
/// are derived here; caller-supplied copies of them are replaced.
pub(crate) fn prepare(request: &HttpRequest, body: EncodedBody) -> Result<RawRequest, EncodingError> {
    for (name, value) in request.headers.iter() {
        let bad = |s: &str| s.bytes().any(|b| b == b'\r' || b == b'\n');
        if name.is_empty() || bad(name) || bad(value) || name.contains(':') {
            return Err(EncodingError::InvalidHeader { name: name.to_string() });
        }
    }

    let mut headers = Headers::new();
    if let Some(host) = host_header(&request.url) {
        headers.set("Host", host);
    }
    headers.set("User-Agent", USER_AGENT);
    for (name, value) in request.headers.iter() {
        if is_framing_header(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("user-agent") {
            headers.set("User-Agent", value);
        } else {
            headers.append(name, value);
        }
    }
    if let Some(content_type) = &body.content_type {
        headers.set("Content-Type", content_type.as_str());
    }
    if !body.bytes.is_empty() || request.method == Method::Post {
        headers.set("Content-Length", body.content_length().to_string());
    }
    headers.set("Connection", "close");

    Ok(RawRequest {
        method: request.method.as_str().to_string(),
        target: origin_form(&request.url),
        version: HTTP_11.to_string(),
        headers,
        body: body.bytes,
    })
}

fn is_framing_header(name: &str) -> bool {
    ["host", "content-type", "content-length", "connection", "transfer-encoding"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// `host[:port]`, with the port only when it is not the scheme default.
pub(crate) fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// `/path?query`.
pub(crate) fn origin_form(url: &Url) -> String {
    let path = if url.path().is_empty() { "/" } else { url.path() };
    match url.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

/// The full URL without its fragment, as sent to a proxy.
pub(crate) fn absolute_form(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}
