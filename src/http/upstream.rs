//! Upstream target and URL rewriting.
//!
//! Ordinary requests join the inbound path onto the base path prefix;
//! websocket dials replace the path and query outright and translate the
//! scheme (http → ws, https → wss).

use axum::http::uri::{InvalidUri, Uri};
use url::{Position, Url};

/// The single fixed upstream. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Upstream {
    base: Url,
    preserve_host: bool,
}

impl Upstream {
    pub fn new(base: Url, preserve_host: bool) -> Self {
        Self {
            base,
            preserve_host,
        }
    }

    /// `host[:port]` of the upstream.
    pub fn authority(&self) -> &str {
        &self.base[Position::BeforeHost..Position::AfterPort]
    }

    pub fn preserve_host(&self) -> bool {
        self.preserve_host
    }

    /// Target URI for an ordinary forwarded request.
    pub fn forward_uri(&self, inbound: &Uri) -> Result<Uri, InvalidUri> {
        let path = join_path(self.base.path(), inbound.path());
        let query = match (non_empty(self.base.query()), non_empty(inbound.query())) {
            (Some(base), Some(inbound)) => Some(format!("{}&{}", base, inbound)),
            (base, inbound) => base.or(inbound).map(str::to_owned),
        };

        let mut target = format!("{}://{}{}", self.base.scheme(), self.authority(), path);
        if let Some(query) = query {
            target.push('?');
            target.push_str(&query);
        }
        target.parse()
    }

    /// Backend URL for a websocket dial.
    pub fn websocket_url(&self, inbound: &Uri) -> Url {
        let mut url = self.base.clone();
        url.set_path(inbound.path());
        url.set_query(inbound.query());
        url.set_fragment(None);

        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            // http/https and ws/wss are all special schemes, so this cannot fail.
            let _ = url.set_scheme(scheme);
        }
        url
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

/// Join two paths with exactly one slash between them.
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
