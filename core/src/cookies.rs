//! Cookie storage for sessions.
//!
//! Matching follows RFC 6265: §5.1.3 domain-match (host-only cookies match
//! only the exact host, `Domain=` cookies also match subdomains but never
//! partial IP addresses), §5.1.4 path-match, and `Secure` cookies are only
//! sent over `https`. A cookie without a `Path` attribute is stored under `/`.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use tracing::warn;
use url::{Host, Url};

/// A stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Set when the response carried no `Domain` attribute.
    pub host_only: bool,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub secure: bool,
    pub http_only: bool,
    /// Insertion sequence, used to order cookies with equal paths.
    created: u64,
}

impl Cookie {
    /// Parse a `Set-Cookie` value received from `url`.
    ///
    /// Returns `None` for values without `name=value` or whose `Domain`
    /// does not cover the responding host.
    pub fn parse(header: &str, url: &Url, now: SystemTime) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            host_only: true,
            path: "/".to_string(),
            expires: None,
            secure: false,
            http_only: false,
            created: 0,
        };

        let mut max_age: Option<i64> = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() {
                        continue;
                    }
                    if !domain_match(&host, url.host(), &domain) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "max-age" => max_age = val.parse().ok().or(max_age),
                "expires" => {
                    if let Ok(at) = httpdate::parse_http_date(val) {
                        cookie.expires = Some(at);
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        // Max-Age takes precedence over Expires.
        if let Some(seconds) = max_age {
            cookie.expires = Some(match u64::try_from(seconds) {
                Ok(secs) if secs > 0 => now + Duration::from_secs(secs),
                _ => SystemTime::UNIX_EPOCH,
            });
        }
        Some(cookie)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Whether this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, url.host(), &self.domain)
        };
        domain_ok && path_match(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }
}

fn domain_match(host: &str, parsed: Option<Host<&str>>, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    let is_ip = matches!(parsed, Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)));
    !is_ip
        && host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() { "/" } else { request_path };
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/')))
}

/// Cookies keyed by (domain, path), then by name.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: HashMap<(String, String), IndexMap<String, Cookie>>,
    next_seq: u64,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one `Set-Cookie` value received from `url`.
    pub fn set_cookie(&mut self, url: &Url, header: &str) {
        self.set_cookie_at(url, header, SystemTime::now());
    }

    pub fn set_cookie_at(&mut self, url: &Url, header: &str, now: SystemTime) {
        let Some(mut cookie) = Cookie::parse(header, url, now) else {
            warn!(%url, header, "ignoring unusable Set-Cookie");
            return;
        };
        let key = (cookie.domain.clone(), cookie.path.clone());

        if cookie.is_expired(now) {
            if let Some(bucket) = self.cookies.get_mut(&key) {
                bucket.shift_remove(&cookie.name);
            }
            return;
        }

        let bucket = self.cookies.entry(key).or_default();
        cookie.created = match bucket.get(&cookie.name) {
            Some(existing) => existing.created,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        bucket.insert(cookie.name.clone(), cookie);
    }

    /// Unexpired cookies for `url`, longest path first, then oldest first.
    pub fn matching(&self, url: &Url, now: SystemTime) -> Vec<&Cookie> {
        let mut found: Vec<&Cookie> = self
            .cookies
            .values()
            .flat_map(IndexMap::values)
            .filter(|c| !c.is_expired(now) && c.matches(url))
            .collect();
        found.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.created.cmp(&b.created)));
        found
    }

    /// `Cookie` header value for `url`, if any cookie applies. Expired
    /// cookies are purged on the way.
    pub fn header_for(&mut self, url: &Url) -> Option<String> {
        self.header_for_at(url, SystemTime::now())
    }

    pub fn header_for_at(&mut self, url: &Url, now: SystemTime) -> Option<String> {
        self.remove_expired(now);
        let pairs: Vec<String> = self
            .matching(url, now)
            .into_iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    pub fn remove_expired(&mut self, now: SystemTime) {
        for bucket in self.cookies.values_mut() {
            bucket.retain(|_, c| !c.is_expired(now));
        }
        self.cookies.retain(|_, bucket| !bucket.is_empty());
    }

    pub fn len(&self) -> usize {
        self.cookies.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn parses_attributes() {
        let now = SystemTime::now();
        let c = Cookie::parse("session_id=abc123; Path=/app; Secure; HttpOnly; Max-Age=60", &url("https://example.com/app/x"), now)
            .unwrap();
        assert_eq!(c.name, "session_id");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain, "example.com");
        assert!(c.host_only);
        assert_eq!(c.path, "/app");
        assert!(c.secure && c.http_only);
        assert_eq!(c.expires, Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn path_defaults_to_root() {
        let c = Cookie::parse("a=1", &url("http://server:18888/cookie/deep"), SystemTime::now()).unwrap();
        assert_eq!(c.path, "/");
    }

    #[test]
    fn foreign_domain_is_rejected() {
        assert!(Cookie::parse("a=1; Domain=evil.com", &url("http://example.com/"), SystemTime::now()).is_none());
        assert!(Cookie::parse("novalue", &url("http://example.com/"), SystemTime::now()).is_none());
    }

    #[test]
    fn domain_cookie_matches_subdomains_host_only_does_not() {
        let mut jar = CookieJar::new();
        jar.set_cookie(&url("http://example.com/"), "wide=1; Domain=.example.com");
        jar.set_cookie(&url("http://example.com/"), "narrow=2");
        assert_eq!(jar.header_for(&url("http://www.example.com/")).as_deref(), Some("wide=1"));
        assert_eq!(jar.header_for(&url("http://example.com/")).as_deref(), Some("wide=1; narrow=2"));
        assert_eq!(jar.header_for(&url("http://notexample.com/")), None);
    }

    #[test]
    fn ip_hosts_only_match_exactly() {
        assert!(!domain_match("10.0.0.1", Some(Host::Ipv4("10.0.0.1".parse().unwrap())), "0.0.1"));
        assert!(domain_match("10.0.0.1", Some(Host::Ipv4("10.0.0.1".parse().unwrap())), "10.0.0.1"));
    }

    #[test]
    fn path_matching() {
        assert!(path_match("/", "/"));
        assert!(path_match("/docs/web", "/docs"));
        assert!(path_match("/docs/", "/docs/"));
        assert!(!path_match("/docsets", "/docs"));
        assert!(!path_match("/", "/docs"));
    }

    #[test]
    fn later_value_overwrites_same_key() {
        let mut jar = CookieJar::new();
        let u = url("http://server:18888/cookie");
        jar.set_cookie(&u, "visit=1");
        jar.set_cookie(&u, "other=x");
        jar.set_cookie(&u, "visit=2");
        assert_eq!(jar.len(), 2);
        assert_eq!(jar.header_for(&u).as_deref(), Some("visit=2; other=x"));
    }

    #[test]
    fn longer_paths_come_first() {
        let mut jar = CookieJar::new();
        let u = url("http://example.com/a/b");
        jar.set_cookie(&u, "root=1");
        jar.set_cookie(&u, "deep=2; Path=/a");
        assert_eq!(jar.header_for(&u).as_deref(), Some("deep=2; root=1"));
    }

    #[test]
    fn expired_cookies_are_skipped_and_purged() {
        let mut jar = CookieJar::new();
        let u = url("http://example.com/");
        let now = SystemTime::now();
        jar.set_cookie_at(&u, "short=1; Max-Age=10", now);
        jar.set_cookie_at(&u, "long=2", now);
        let later = now + Duration::from_secs(11);
        assert_eq!(jar.header_for_at(&u, later).as_deref(), Some("long=2"));
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn max_age_zero_deletes() {
        let mut jar = CookieJar::new();
        let u = url("http://example.com/");
        jar.set_cookie(&u, "gone=1");
        jar.set_cookie(&u, "gone=; Max-Age=0");
        assert!(jar.is_empty());
    }

    #[test]
    fn past_expires_deletes() {
        let mut jar = CookieJar::new();
        let u = url("http://example.com/");
        jar.set_cookie(&u, "gone=1");
        jar.set_cookie(&u, "gone=1; Expires=Thu, 01 Jan 1970 00:00:01 GMT");
        assert!(jar.is_empty());
    }

    #[test]
    fn secure_cookies_need_https() {
        let mut jar = CookieJar::new();
        jar.set_cookie(&url("https://example.com/"), "s=1; Secure");
        assert_eq!(jar.header_for(&url("http://example.com/")), None);
        assert_eq!(jar.header_for(&url("https://example.com/")).as_deref(), Some("s=1"));
    }
}
