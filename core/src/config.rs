//! Externally configurable values: where requests go, which proxy they use,
//! where the virtual `file` transport is rooted, and how long a call may take.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::session::Session;
use crate::transport::Registry;

pub const DEFAULT_PORT: u16 = 18888;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    /// Origin the harness talks to, e.g. the echo server.
    pub target: Url,
    /// Every `http` request is routed through this proxy when set.
    pub proxy: Option<Url>,
    /// Root directory for `file://` URLs.
    pub base_dir: PathBuf,
    pub timeout: Duration,
}

impl Config {
    pub fn new(target: Url) -> Self {
        Self {
            target,
            proxy: None,
            base_dir: PathBuf::from("."),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn registry(&self) -> Registry {
        Registry::from_config(self)
    }

    /// A session over this configuration's registry. Cookies are kept only
    /// when `cookies` is set.
    pub fn session(&self, cookies: bool) -> Session {
        let session = Session::new(Arc::new(self.registry())).with_timeout(self.timeout);
        if cookies {
            session.with_cookie_store()
        } else {
            session
        }
    }
}
