//! Client core for the HTTP interaction harness.
//!
//! # Overview
//! Turns a logical intent ("post this file as a multipart field", "fetch
//! this URL through a proxy", "read this `file://` URL from a local
//! directory") into a well-formed HTTP/1.1 exchange, and renders requests and
//! responses as deterministic text dumps for inspection.
//!
//! # Design
//! - `encode` builds body bytes and the matching content type from a
//!   `Payload`.
//! - `transport::Registry` maps URL schemes to `Transport` handlers: direct
//!   TCP, TCP through a proxy, or the virtual `FileTransport`.
//! - `Session` wraps a registry with an optional cookie jar.
//! - `capture` dumps requests and responses; the TCP transport writes the
//!   request dump to the socket, so what is logged is what was sent.
//! - Everything is blocking; the echo server in the sibling crate is the only
//!   async component.

pub mod capture;
pub mod config;
pub mod cookies;
pub mod encode;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use capture::{dump_request, dump_request_parts, dump_response};
pub use config::Config;
pub use cookies::{Cookie, CookieJar};
pub use encode::{EncodedBody, Part, PartSource, Payload};
pub use error::{EncodingError, Error, TransportError};
pub use http::{Headers, HttpRequest, HttpResponse, Method, RawRequest};
pub use session::Session;
pub use transport::{FileTransport, Registry, TcpTransport, Transport};
