//! Virtual transport serving a local directory tree as if it were remote.
//!
//! `file://any-host/some/path` maps to `<root>/some/path`. The host is
//! ignored and `..` segments are resolved lexically before joining, so a
//! request can never escape the root.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;
use url::Url;

use super::Transport;
use crate::encode::OCTET_STREAM;
use crate::error::TransportError;
use crate::http::{HttpResponse, RawRequest};

const HREF: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'%').add(b'<').add(b'>').add(b'?').add(b'`');

#[derive(Debug, Clone)]
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Local path for `url`, or `None` when the path is not valid UTF-8
    /// once percent-decoded.
    fn local_path(&self, url: &Url) -> Option<PathBuf> {
        let decoded = percent_decode_str(url.path()).decode_utf8().ok()?;
        let mut path = self.root.clone();
        for segment in clean(&decoded) {
            path.push(segment);
        }
        Some(path)
    }
}

impl Transport for FileTransport {
    fn round_trip(
        &self,
        request: &RawRequest,
        url: &Url,
        _deadline: Option<Instant>,
    ) -> Result<HttpResponse, TransportError> {
        let not_found = || TransportError::NotFound {
            path: url.path().to_string(),
        };
        let path = self.local_path(url).ok_or_else(not_found)?;
        debug!(path = %path.display(), "serving local resource");

        let mut response = match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => match serve_directory(&path) {
                Ok(response) => response,
                Err(e) => failure(&e, not_found)?,
            },
            Ok(_) => match serve_file(&path) {
                Ok(response) => response,
                Err(e) => failure(&e, not_found)?,
            },
            Err(e) => failure(&e, not_found)?,
        };

        if request.method == "HEAD" {
            response.body.clear();
        }
        Ok(response)
    }
}

/// Missing resources are errors; anything else becomes a synthesized status.
fn failure(err: &io::Error, not_found: impl FnOnce() -> TransportError) -> Result<HttpResponse, TransportError> {
    match err.kind() {
        io::ErrorKind::NotFound => Err(not_found()),
        io::ErrorKind::PermissionDenied => Ok(plain(403, "403 Forbidden\n")),
        _ => Ok(plain(500, "500 Internal Server Error\n")),
    }
}

fn plain(status: u16, text: &str) -> HttpResponse {
    let mut response = HttpResponse::new(status);
    response.headers.set("Content-Type", "text/plain; charset=utf-8");
    response.headers.set("Content-Length", text.len().to_string());
    response.body = text.as_bytes().to_vec();
    response
}

fn serve_file(path: &Path) -> io::Result<HttpResponse> {
    let mut file = File::open(path)?;
    let modified = file.metadata()?.modified().ok();
    let mut body = Vec::new();
    file.read_to_end(&mut body)?;

    let content_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(OCTET_STREAM);

    let mut response = HttpResponse::new(200);
    response.headers.set("Content-Type", content_type);
    if let Some(modified) = modified {
        response.headers.set("Last-Modified", httpdate::fmt_http_date(modified));
    }
    response.headers.set("Content-Length", body.len().to_string());
    response.body = body;
    Ok(response)
}

fn serve_directory(path: &Path) -> io::Result<HttpResponse> {
    let index = path.join("index.html");
    if index.is_file() {
        return serve_file(&index);
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut html = String::from("<pre>\n");
    for name in &names {
        html.push_str(&format!(
            "<a href=\"{}\">{}</a>\n",
            utf8_percent_encode(name, HREF),
            escape_html(name)
        ));
    }
    html.push_str("</pre>\n");

    let mut response = HttpResponse::new(200);
    response.headers.set("Content-Type", "text/html; charset=utf-8");
    response.headers.set("Content-Length", html.len().to_string());
    response.body = html.into_bytes();
    Ok(response)
}

/// Path segments of `path` with `.` dropped and `..` applied, clamped at
/// the root.
fn clean(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&#34;")
        .replace('\'', "&#39;")
}
