use std::io::Write;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use harness_core::capture;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 18888;

/// Body of every successful response.
pub const HELLO: &str = "<html><body>hello</body></html>";

/// Largest request body the server will buffer before answering 500.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Where captured request dumps go.
pub trait DumpSink: Send + Sync {
    fn record(&self, dump: &[u8]);
}

/// Prints each dump to stdout followed by a newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl DumpSink for StdoutSink {
    fn record(&self, dump: &[u8]) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(dump).and_then(|()| out.write_all(b"\n")) {
            warn!(error = %e, "failed to write request dump");
        }
    }
}

/// Keeps dumps in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    dumps: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dumps(&self) -> Vec<Vec<u8>> {
        self.dumps.lock().clone()
    }

    /// Dumps recorded so far, as text.
    pub fn texts(&self) -> Vec<String> {
        self.dumps
            .lock()
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    pub fn last(&self) -> Option<String> {
        self.texts().pop()
    }
}

impl DumpSink for MemorySink {
    fn record(&self, dump: &[u8]) {
        self.dumps.lock().push(dump.to_vec());
    }
}

type Sink = Arc<dyn DumpSink>;

pub fn app() -> Router {
    app_with_sink(Arc::new(StdoutSink))
}

/// Router that answers every method and path with the echo handler.
pub fn app_with_sink(sink: Sink) -> Router {
    Router::new().fallback(echo).with_state(sink)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with_sink(listener: TcpListener, sink: Sink) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_sink(sink)).await
}

async fn echo(State(sink): State<Sink>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(method = %parts.method, uri = %parts.uri, error = %e, "failed to read request");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    info!(method = %parts.method, uri = %parts.uri, "captured request");
    sink.record(&dump(&parts, &body));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        Body::from(HELLO),
    )
        .into_response()
}

/// Inbound request in wire form. Header values are copied byte for byte.
fn dump(parts: &Parts, body: &[u8]) -> Vec<u8> {
    let headers = captured_headers(parts);
    capture::dump_request_parts(
        parts.method.as_str(),
        &parts.uri.to_string(),
        &format!("{:?}", parts.version),
        headers.iter().map(|(name, value)| (name.as_str(), *value)),
        body,
        true,
    )
}

/// Header names in canonical case, `Host` first.
fn captured_headers(parts: &Parts) -> Vec<(String, &[u8])> {
    let host = parts.headers.get(header::HOST).map(|v| ("Host".to_string(), v.as_bytes()));
    let rest = parts
        .headers
        .iter()
        .filter(|(name, _)| *name != header::HOST)
        .map(|(name, value)| (canonical(name.as_str()), value.as_bytes()));
    host.into_iter().chain(rest).collect()
}

/// `content-type` → `Content-Type`; header names arrive lower-cased.
fn canonical(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Version};

    fn parts(method: Method, uri: &str) -> Parts {
        let (parts, ()) = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .version(Version::HTTP_11)
            .header("user-agent", "harness/0.1.0")
            .header("host", "server:18888")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn host_is_written_first() {
        let parts = parts(Method::GET, "/?query=hello+world");
        let headers = captured_headers(&parts);
        assert_eq!(
            headers,
            vec![
                ("Host".to_string(), &b"server:18888"[..]),
                ("User-Agent".to_string(), &b"harness/0.1.0"[..]),
            ]
        );
        let dump = dump(&parts, b"");
        assert!(dump.starts_with(b"GET /?query=hello+world HTTP/1.1\r\nHost: server:18888\r\n"));
    }

    #[test]
    fn absolute_form_target_is_kept() {
        let dump = dump(&parts(Method::GET, "http://github.com/"), b"");
        assert!(dump.starts_with(b"GET http://github.com/ HTTP/1.1\r\n"));
    }

    #[test]
    fn non_utf8_header_bytes_survive() {
        let mut parts = parts(Method::POST, "/");
        parts
            .headers
            .insert("x-raw", axum::http::HeaderValue::from_bytes(b"caf\xe9").unwrap());
        let dump = dump(&parts, b"body");
        let needle = b"X-Raw: caf\xe9\r\n";
        assert!(dump.windows(needle.len()).any(|w| w == needle));
        assert!(dump.ends_with(b"\r\n\r\nbody"));
    }

    #[test]
    fn header_names_are_canonicalized() {
        assert_eq!(canonical("content-type"), "Content-Type");
        assert_eq!(canonical("x-forwarded-for"), "X-Forwarded-For");
        assert_eq!(canonical("dnt"), "Dnt");
    }

    #[test]
    fn memory_sink_shares_buffer_between_clones() {
        let sink = MemorySink::new();
        let clone = sink.clone();
        clone.record(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(sink.last().as_deref(), Some("GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(sink.dumps().len(), 1);
    }
}
