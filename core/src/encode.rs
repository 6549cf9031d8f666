//! Request encoder: turns a logical payload into body bytes and a content type.
//!
//! # Design
//! Each `Payload` variant maps to one encoding strategy. The content type is
//! always derived here, never supplied separately, so a multipart body can
//! only ever be sent with its own boundary. Files are read through handles
//! scoped to `read_file`; they are closed on every exit path.
//!
//! URL-encoding follows `application/x-www-form-urlencoded` as implemented by
//! the `form_urlencoded` serializer in the `url` crate: space becomes `+`,
//! ASCII alphanumerics and `*-._` pass through, every other UTF-8 byte is
//! percent-escaped.

use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use url::{form_urlencoded, Url};
use uuid::Uuid;

use crate::error::EncodingError;

pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// What a request carries in its body.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// URL-encoded key/value pairs, sent as a form body.
    Form(Vec<(String, String)>),
    /// Bytes sent unchanged with a caller-chosen content type.
    Raw { content_type: String, bytes: Vec<u8> },
    /// Verbatim contents of a local file.
    File { content_type: String, path: PathBuf },
    /// `multipart/form-data` parts, in wire order.
    Multipart(Vec<Part>),
}

impl Payload {
    pub fn form<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Payload::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn text(content_type: impl Into<String>, text: impl Into<String>) -> Self {
        Payload::Raw {
            content_type: content_type.into(),
            bytes: text.into().into_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Field { name: String, value: String },
    File {
        name: String,
        filename: String,
        source: PartSource,
    },
}

impl Part {
    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        Part::Field {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A file part read from `path`, named after the file itself.
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Part::File {
            name: name.into(),
            filename,
            source: PartSource::Path(path),
        }
    }

    pub fn bytes(name: impl Into<String>, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Part::File {
            name: name.into(),
            filename: filename.into(),
            source: PartSource::Bytes(bytes),
        }
    }
}

/// Where a file part's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// Encoded body ready for the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl EncodedBody {
    pub fn content_length(&self) -> usize {
        self.bytes.len()
    }
}

/// Encode `payload` into body bytes and the matching content type.
pub fn encode(payload: &Payload) -> Result<EncodedBody, EncodingError> {
    match payload {
        Payload::Empty => Ok(EncodedBody::default()),
        Payload::Form(pairs) => Ok(EncodedBody {
            bytes: encode_pairs(pairs).into_bytes(),
            content_type: Some(FORM_URLENCODED.to_string()),
        }),
        Payload::Raw { content_type, bytes } => Ok(EncodedBody {
            bytes: bytes.clone(),
            content_type: Some(content_type.clone()),
        }),
        Payload::File { content_type, path } => Ok(EncodedBody {
            bytes: read_file(path)?,
            content_type: Some(content_type.clone()),
        }),
        Payload::Multipart(parts) => encode_multipart(parts, random_boundary),
    }
}

/// `application/x-www-form-urlencoded` serialization of `pairs`, in order.
pub fn encode_pairs<K, V>(pairs: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
        .finish()
}

/// `url` with `pairs` appended to its query string.
pub fn with_query<K, V>(url: &Url, pairs: &[(K, V)]) -> Url
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut url = url.clone();
    if !pairs.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
    }
    url
}

fn read_file(path: &Path) -> Result<Vec<u8>, EncodingError> {
    let mut file = File::open(path).map_err(|e| EncodingError::from_io(path.to_path_buf(), e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| EncodingError::from_io(path.to_path_buf(), e))?;
    Ok(bytes)
}

fn random_boundary() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Build a multipart body. `next_boundary` is asked again whenever the token
/// it returned occurs inside one of the payloads.
fn encode_multipart(
    parts: &[Part],
    mut next_boundary: impl FnMut() -> String,
) -> Result<EncodedBody, EncodingError> {
    let mut loaded = Vec::with_capacity(parts.len());
    for part in parts {
        let bytes: Cow<'_, [u8]> = match part {
            Part::Field { value, .. } => Cow::Borrowed(value.as_bytes()),
            Part::File {
                source: PartSource::Bytes(bytes),
                ..
            } => Cow::Borrowed(bytes.as_slice()),
            Part::File {
                source: PartSource::Path(path),
                ..
            } => Cow::Owned(read_file(path)?),
        };
        loaded.push(bytes);
    }

    let boundary = loop {
        let candidate = next_boundary();
        if !loaded.iter().any(|payload| contains(payload, candidate.as_bytes())) {
            break candidate;
        }
    };

    let mut body = Vec::new();
    for (part, payload) in parts.iter().zip(&loaded) {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match part {
            Part::Field { name, .. } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n", escape_quotes(name)).as_bytes(),
                );
            }
            Part::File { name, filename, .. } => {
                let mime = mime_guess::from_path(filename).first_or_octet_stream();
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {mime}\r\n",
                        escape_quotes(name),
                        escape_quotes(filename),
                    )
                    .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Ok(EncodedBody {
        bytes: body,
        content_type: Some(format!("multipart/form-data; boundary={boundary}")),
    })
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
