//! The immutable request descriptor handed to the transport.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method, StatusCode, Version};
use std::fmt;
use std::time::Duration;
use url::Url;

/// A request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    /// No body.
    #[default]
    Empty,

    /// Character content, already encoded with the charset of its content type.
    Text {
        /// The original text
        content: String,
        /// The content type, including any charset parameter
        content_type: String,
        /// The encoded bytes sent on the wire
        encoded: Bytes,
    },

    /// Raw bytes.
    Binary {
        /// The body bytes
        bytes: Bytes,
        /// The content type
        content_type: String,
    },
}

impl Body {
    /// The bytes sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Text { encoded, .. } => encoded,
            Body::Binary { bytes, .. } => bytes,
        }
    }

    /// The body's content type, if there is a body.
    pub fn content_type(&self) -> Option<&str> {
        match self {
            Body::Empty => None,
            Body::Text { content_type, .. } | Body::Binary { content_type, .. } => {
                Some(content_type)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// The connection-pool key of a request: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub(crate) fn from_url(url: &Url) -> Option<Self> {
        Some(Self {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// An immutable HTTP request descriptor.
///
/// Produced by [`RequestBuilder::build`](crate::RequestBuilder::build); there
/// is no way to mutate it afterwards. Redirect hops get a fresh descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) target: Target,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) follow_redirect: bool,
    pub(crate) max_redirects: usize,
    pub(crate) timeout: Option<Duration>,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The pool key derived from the URL.
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn follow_redirect(&self) -> bool {
        self.follow_redirect
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Builds the descriptor for the next hop of a followed redirect.
    ///
    /// 303 always switches to GET; 301 and 302 do so for anything but GET
    /// and HEAD. Switching to GET drops the body and its entity headers.
    /// Credentials are stripped when the redirect leaves the original host.
    pub(crate) fn redirected(&self, location: Url, status: StatusCode) -> Request {
        let mut next = self.clone();
        let rewrite_to_get = match status {
            StatusCode::SEE_OTHER => next.method != Method::HEAD,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                next.method != Method::GET && next.method != Method::HEAD
            }
            _ => false,
        };
        if rewrite_to_get {
            next.method = Method::GET;
            next.body = Body::Empty;
            next.headers.remove(CONTENT_TYPE);
            next.headers.remove(CONTENT_LENGTH);
        }

        let new_target = Target::from_url(&location);
        if new_target.as_ref().map(|t| &t.host) != Some(&self.target.host) {
            next.headers.remove(AUTHORIZATION);
            next.headers.remove(PROXY_AUTHORIZATION);
            next.headers.remove(COOKIE);
        }
        if let Some(target) = new_target {
            next.target = target;
        }
        next.url = location;
        next
    }
}
