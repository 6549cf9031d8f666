//! Session client: a registry plus optional cookie persistence.
//!
//! # Design
//! A `call` blocks until the response is in or the deadline passes; the
//! session spawns nothing. The cookie jar sits behind a mutex that is held
//! only while reading cookies for the outgoing request and while storing the
//! response's `Set-Cookie` values, never across the round trip itself, so a
//! session can be shared between threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use url::Url;

use crate::cookies::CookieJar;
use crate::encode::{self, Part, Payload};
use crate::error::Error;
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::transport::Registry;

#[derive(Debug)]
pub struct Session {
    registry: Arc<Registry>,
    jar: Option<Mutex<CookieJar>>,
    timeout: Option<Duration>,
}

impl Session {
    /// A stateless session: no cookies, no deadline.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            jar: None,
            timeout: None,
        }
    }

    pub fn with_cookie_store(mut self) -> Self {
        self.jar = Some(Mutex::new(CookieJar::new()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `Cookie` header the session would send to `url` right now.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar.as_ref()?.lock().header_for(url)
    }

    pub fn call(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        self.call_until(request, deadline)
    }

    /// Like `call`, with an explicit deadline instead of the session timeout.
    pub fn call_until(&self, mut request: HttpRequest, deadline: Option<Instant>) -> Result<HttpResponse, Error> {
        if let Some(stored) = self.cookie_header(&request.url) {
            let merged = match request.headers.get("cookie") {
                Some(explicit) => format!("{explicit}; {stored}"),
                None => stored,
            };
            request.headers.set("Cookie", merged);
        }

        let response = self.registry.dispatch(&request, deadline)?;

        if let Some(jar) = &self.jar {
            let mut jar = jar.lock();
            for value in response.headers.get_all("set-cookie") {
                jar.set_cookie(&request.url, value);
            }
        }
        Ok(response)
    }

    pub fn get(&self, url: &Url) -> Result<HttpResponse, Error> {
        self.call(HttpRequest::new(Method::Get, url.clone()))
    }

    pub fn get_with_query<K, V>(&self, url: &Url, pairs: &[(K, V)]) -> Result<HttpResponse, Error>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.call(HttpRequest::new(Method::Get, encode::with_query(url, pairs)))
    }

    pub fn head(&self, url: &Url) -> Result<HttpResponse, Error> {
        self.call(HttpRequest::new(Method::Head, url.clone()))
    }

    pub fn delete(&self, url: &Url) -> Result<HttpResponse, Error> {
        self.call(HttpRequest::new(Method::Delete, url.clone()))
    }

    pub fn post_form<K, V>(&self, url: &Url, pairs: &[(K, V)]) -> Result<HttpResponse, Error>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let payload = Payload::form(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        self.call(HttpRequest::new(Method::Post, url.clone()).payload(payload))
    }

    pub fn post_raw(&self, url: &Url, content_type: &str, bytes: Vec<u8>) -> Result<HttpResponse, Error> {
        let payload = Payload::Raw {
            content_type: content_type.to_string(),
            bytes,
        };
        self.call(HttpRequest::new(Method::Post, url.clone()).payload(payload))
    }

    pub fn post_file(&self, url: &Url, content_type: &str, path: impl Into<PathBuf>) -> Result<HttpResponse, Error> {
        let payload = Payload::File {
            content_type: content_type.to_string(),
            path: path.into(),
        };
        self.call(HttpRequest::new(Method::Post, url.clone()).payload(payload))
    }

    pub fn post_multipart(&self, url: &Url, parts: Vec<Part>) -> Result<HttpResponse, Error> {
        self.call(HttpRequest::new(Method::Post, url.clone()).payload(Payload::Multipart(parts)))
    }
}
