//! HTTP/1.1 over a blocking TCP connection, direct or through a proxy, in
//! plain text or wrapped in TLS.
//!
//! One connection per request (`Connection: close`). The response head is
//! parsed with `httparse`; the body is framed by `Content-Length`, chunked
//! transfer coding, or the connection closing.
//!
//! TLS uses a single process-wide `rustls` client config trusting the
//! `webpki-roots` set. Through a proxy, TLS requests go through a `CONNECT`
//! tunnel and keep their origin-form target.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::debug;
use url::Url;

use super::{absolute_form, Transport, USER_AGENT};
use crate::capture;
use crate::error::TransportError;
use crate::http::{Headers, HttpResponse, RawRequest, HTTP_11};

const READ_CHUNK: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

/// Network transport for `http` and `https` URLs.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    proxy: Option<Url>,
    tls: bool,
}

impl TcpTransport {
    /// Connect straight to the target's host and port.
    pub fn direct() -> Self {
        Self { proxy: None, tls: false }
    }

    /// Connect every request to `proxy` and send the target in absolute-form.
    pub fn proxy(proxy: Url) -> Self {
        Self {
            proxy: Some(proxy),
            tls: false,
        }
    }

    /// Speak TLS to the target.
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    fn endpoint(&self, url: &Url) -> Result<String, TransportError> {
        authority(self.proxy.as_ref().unwrap_or(url))
    }
}

impl Transport for TcpTransport {
    fn round_trip(
        &self,
        request: &RawRequest,
        url: &Url,
        deadline: Option<Instant>,
    ) -> Result<HttpResponse, TransportError> {
        let addr = self.endpoint(url)?;
        let wire: Cow<'_, RawRequest> = match &self.proxy {
            Some(_) if !self.tls => Cow::Owned(RawRequest {
                target: absolute_form(url),
                ..request.clone()
            }),
            _ => Cow::Borrowed(request),
        };

        debug!(%addr, target = %wire.target, tls = self.tls, "connecting");
        let stream = connect(&addr, deadline)?;
        let mut stream = DeadlineStream { stream, deadline };

        if !self.tls {
            return exchange(stream, &wire, &addr);
        }
        if self.proxy.is_some() {
            tunnel(&mut stream, &authority(url)?, &addr)?;
        }
        let config = tls_config().map_err(|e| tls_error(&addr, e))?;
        let session = ClientConnection::new(config, server_name(url)?).map_err(|e| tls_error(&addr, e))?;
        exchange(StreamOwned::new(session, stream), &wire, &addr)
    }
}

/// `host:port` for `url`, with IPv6 hosts bracketed.
fn authority(url: &Url) -> Result<String, TransportError> {
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(match url.host() {
        Some(url::Host::Ipv6(addr)) => format!("[{addr}]:{port}"),
        _ => format!("{host}:{port}"),
    })
}

fn server_name(url: &Url) -> Result<ServerName<'static>, TransportError> {
    let host = url.host_str().unwrap_or_default();
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(bare.to_string()).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn tls_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    roots.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

fn tls_error(addr: &str, err: rustls::Error) -> TransportError {
    TransportError::ConnectionFailed {
        addr: addr.to_string(),
        source: io::Error::other(err),
    }
}

/// Ask the proxy at `addr` to open a raw tunnel to `target`.
fn tunnel(stream: &mut DeadlineStream, target: &str, addr: &str) -> Result<(), TransportError> {
    let request = RawRequest {
        method: "CONNECT".to_string(),
        target: target.to_string(),
        version: HTTP_11.to_string(),
        headers: [("Host", target), ("User-Agent", USER_AGENT)].into_iter().collect(),
        body: Vec::new(),
    };
    stream
        .write_all(&capture::dump_request(&request, true))
        .and_then(|()| stream.flush())
        .map_err(|e| io_error(addr, e))?;

    let mut incoming = Incoming::new(&mut *stream, addr);
    let head = read_head(&mut incoming)?;
    if !(200..300).contains(&head.status) {
        return Err(TransportError::ConnectionFailed {
            addr: addr.to_string(),
            source: io::Error::other(format!("proxy refused CONNECT: {} {}", head.status, head.reason)),
        });
    }
    if !incoming.pending().is_empty() {
        return Err(TransportError::MalformedResponse("data after CONNECT response".to_string()));
    }
    Ok(())
}

/// Send `wire` and read the response off the same stream.
fn exchange<S: Read + Write>(mut stream: S, wire: &RawRequest, addr: &str) -> Result<HttpResponse, TransportError> {
    stream
        .write_all(&capture::dump_request(wire, true))
        .and_then(|()| stream.flush())
        .map_err(|e| io_error(addr, e))?;
    read_response(&mut stream, wire.method == "HEAD", addr)
}

fn connect(addr: &str, deadline: Option<Instant>) -> Result<TcpStream, TransportError> {
    let addrs = addr.to_socket_addrs().map_err(|e| io_error(addr, e))?;
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
    for sock_addr in addrs {
        let attempt = match remaining(deadline) {
            Some(Ok(timeout)) => TcpStream::connect_timeout(&sock_addr, timeout),
            Some(Err(e)) => Err(e),
            None => TcpStream::connect(sock_addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(io_error(addr, last_err))
}

/// Time left before `deadline`, or `TimedOut` once it has passed.
fn remaining(deadline: Option<Instant>) -> Option<io::Result<Duration>> {
    let deadline = deadline?;
    let left = deadline.saturating_duration_since(Instant::now());
    Some(if left.is_zero() {
        Err(io::Error::from(io::ErrorKind::TimedOut))
    } else {
        Ok(left)
    })
}

fn io_error(addr: &str, err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout { addr: addr.to_string() },
        _ => TransportError::ConnectionFailed {
            addr: addr.to_string(),
            source: err,
        },
    }
}

/// Socket whose read and write timeouts shrink toward a fixed deadline.
struct DeadlineStream {
    stream: TcpStream,
    deadline: Option<Instant>,
}

impl DeadlineStream {
    fn arm(&self) -> io::Result<Option<Duration>> {
        remaining(self.deadline).transpose()
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.arm()?;
        self.stream.set_read_timeout(timeout)?;
        self.stream.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let timeout = self.arm()?;
        self.stream.set_write_timeout(timeout)?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Buffered view over the connection used while parsing.
struct Incoming<'a, R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    addr: &'a str,
}

impl<'a, R: Read> Incoming<'a, R> {
    fn new(reader: R, addr: &'a str) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            eof: false,
            addr,
        }
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Read one more chunk; `false` once the peer has closed.
    fn fill(&mut self) -> Result<bool, TransportError> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // TLS peers that close without close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return Ok(false);
                }
                Err(e) => return Err(io_error(self.addr, e)),
            }
        }
    }

    /// Make at least `n` unread bytes available.
    fn ensure(&mut self, n: usize) -> Result<(), TransportError> {
        while self.pending().len() < n {
            if !self.fill()? {
                return Err(TransportError::MalformedResponse("connection closed mid-body".to_string()));
            }
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }
}

struct Head {
    version: String,
    status: u16,
    reason: String,
    headers: Headers,
}

/// Parse one response from `reader`. Interim 1xx responses are skipped.
pub(crate) fn read_response<R: Read>(reader: R, head_request: bool, addr: &str) -> Result<HttpResponse, TransportError> {
    let mut incoming = Incoming::new(reader, addr);

    let head = loop {
        let head = read_head(&mut incoming)?;
        if !(100..200).contains(&head.status) || head.status == 101 {
            break head;
        }
        debug!(status = head.status, "skipping interim response");
    };

    let no_body = head_request || (100..200).contains(&head.status) || head.status == 204 || head.status == 304;
    let body = if no_body {
        Vec::new()
    } else if is_chunked(&head.headers) {
        read_chunked(&mut incoming)?
    } else if let Some(length) = content_length(&head.headers)? {
        incoming.ensure(length)?;
        incoming.take(length)
    } else {
        while incoming.fill()? {}
        let rest = incoming.pending().len();
        incoming.take(rest)
    };

    Ok(HttpResponse {
        version: head.version,
        status: head.status,
        reason: head.reason,
        headers: head.headers,
        body,
    })
}

fn read_head<R: Read>(incoming: &mut Incoming<'_, R>) -> Result<Head, TransportError> {
    loop {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut slots);
        match parsed.parse(incoming.pending()) {
            Ok(httparse::Status::Complete(len)) => {
                let head = Head {
                    version: format!("HTTP/1.{}", parsed.version.unwrap_or(1)),
                    status: parsed.code.unwrap_or_default(),
                    reason: parsed.reason.unwrap_or_default().to_string(),
                    headers: parsed
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                        .collect(),
                };
                incoming.pos += len;
                return Ok(head);
            }
            Ok(httparse::Status::Partial) => {
                if !incoming.fill()? {
                    return Err(TransportError::MalformedResponse(
                        "connection closed before end of headers".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TransportError::MalformedResponse(e.to_string())),
        }
    }
}

fn read_chunked<R: Read>(incoming: &mut Incoming<'_, R>) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::new();
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(incoming.pending()) {
                Ok(httparse::Status::Complete(found)) => break found,
                Ok(httparse::Status::Partial) => {
                    if !incoming.fill()? {
                        return Err(TransportError::MalformedResponse("truncated chunk size".to_string()));
                    }
                }
                Err(_) => return Err(TransportError::MalformedResponse("invalid chunk size".to_string())),
            }
        };
        incoming.pos += consumed;
        if size == 0 {
            // Trailers are not surfaced.
            return Ok(body);
        }
        let size = usize::try_from(size)
            .map_err(|_| TransportError::MalformedResponse("chunk too large".to_string()))?;
        let framed = size
            .checked_add(2)
            .ok_or_else(|| TransportError::MalformedResponse("chunk too large".to_string()))?;
        incoming.ensure(framed)?;
        body.extend_from_slice(&incoming.take(size));
        if incoming.take(2) != b"\r\n" {
            return Err(TransportError::MalformedResponse("chunk not terminated by CRLF".to_string()));
        }
    }
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("transfer-encoding")
        .any(|v| v.split(',').any(|coding| coding.trim().eq_ignore_ascii_case("chunked")))
}

fn content_length(headers: &Headers) -> Result<Option<usize>, TransportError> {
    headers
        .get("content-length")
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| TransportError::MalformedResponse(format!("invalid Content-Length {v:?}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(wire: &[u8]) -> Result<HttpResponse, TransportError> {
        read_response(wire, false, "test:80")
    }

    #[test]
    fn parses_content_length_body() {
        let resp = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: 1\r\n\r\nhelloEXTRA").unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body, b"hello");
        let names: Vec<_> = resp.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Content-Length", "X-A"]);
    }

    #[test]
    fn parses_chunked_body() {
        let resp = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();
        assert_eq!(resp.body, b"hello world");
    }

    #[test]
    fn oversized_chunk_is_malformed() {
        let err = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc\r\n0\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)), "{err:?}");
    }

    #[test]
    fn reads_until_close_without_length() {
        let resp = parse(b"HTTP/1.0 200 OK\r\n\r\nall of it").unwrap();
        assert_eq!(resp.version, "HTTP/1.0");
        assert_eq!(resp.body, b"all of it");
    }

    #[test]
    fn head_response_has_no_body() {
        let resp = read_response(&b"HTTP/1.1 200 OK\r\nContent-Length: 32\r\n\r\n"[..], true, "test:80").unwrap();
        assert!(resp.body.is_empty());
        assert_eq!(resp.headers.get("content-length"), Some("32"));
    }

    #[test]
    fn interim_responses_are_skipped() {
        let resp = parse(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse(b"SPDY/9 nope\r\n\r\n").unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[test]
    fn truncated_head_is_malformed() {
        let err = parse(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[test]
    fn short_body_is_malformed() {
        let err = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[test]
    fn endpoint_prefers_proxy() {
        let target = Url::parse("http://github.com/").unwrap();
        assert_eq!(TcpTransport::direct().endpoint(&target).unwrap(), "github.com:80");
        let proxied = TcpTransport::proxy(Url::parse("http://server:18888").unwrap());
        assert_eq!(proxied.endpoint(&target).unwrap(), "server:18888");
    }

    #[test]
    fn https_defaults_to_port_443() {
        let target = Url::parse("https://example.com/").unwrap();
        assert_eq!(TcpTransport::direct().with_tls().endpoint(&target).unwrap(), "example.com:443");
        assert_eq!(authority(&Url::parse("https://[::1]:8443/").unwrap()).unwrap(), "[::1]:8443");
    }

    #[test]
    fn server_name_strips_ipv6_brackets() {
        assert!(server_name(&Url::parse("https://example.com/").unwrap()).is_ok());
        assert!(matches!(
            server_name(&Url::parse("https://[::1]/").unwrap()).unwrap(),
            ServerName::IpAddress(_)
        ));
    }

    /// Accepts one connection, reads its request head, answers with `reply`
    /// and hands the head back.
    fn one_shot_server(reply: &'static [u8]) -> (std::net::SocketAddr, std::thread::JoinHandle<String>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") && !head.starts_with(&[0x16]) {
                match socket.read(&mut byte) {
                    Ok(1) => head.push(byte[0]),
                    _ => break,
                }
            }
            let _ = socket.write_all(reply);
            String::from_utf8_lossy(&head).into_owned()
        });
        (addr, handle)
    }

    fn get_request() -> RawRequest {
        RawRequest {
            method: "GET".to_string(),
            target: "/".to_string(),
            version: HTTP_11.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn tls_handshake_with_plaintext_server_fails() {
        let (addr, handle) = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let url = Url::parse(&format!("https://127.0.0.1:{}/", addr.port())).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = TcpTransport::direct()
            .with_tls()
            .round_trip(&get_request(), &url, Some(deadline))
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }), "{err:?}");
        handle.join().unwrap();
    }

    #[test]
    fn proxied_tls_opens_connect_tunnel() {
        let (addr, handle) = one_shot_server(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n");
        let proxy = Url::parse(&format!("http://{addr}")).unwrap();
        let url = Url::parse("https://github.com/").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = TcpTransport::proxy(proxy)
            .with_tls()
            .round_trip(&get_request(), &url, Some(deadline))
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }), "{err:?}");

        let head = handle.join().unwrap();
        assert!(head.starts_with("CONNECT github.com:443 HTTP/1.1\r\nHost: github.com:443\r\n"), "{head}");
    }

    #[test]
    fn refused_connection_is_connection_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect(&addr.to_string(), None).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
    }

    #[test]
    fn silent_server_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = TcpTransport::direct().round_trip(&get_request(), &url, Some(deadline)).unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        drop(listener);
    }
}
