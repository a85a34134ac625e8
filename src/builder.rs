//! Fluent construction and execution of requests.
//!
//! Every fallible setter validates immediately and returns `Result<Self>`,
//! so malformed input never reaches a [`RequestContext`].

use crate::client::Client;
use crate::context::{RequestContext, ResponseFuture};
use crate::cookie::Cookie;
use crate::listener::Listeners;
use crate::pool::TransportError;
use crate::request::{Body, Request, Target};
use crate::response::FullResponse;
use crate::{Error, Result};
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Builds a request, attaches listeners and executes it.
///
/// Obtained from [`Client::request`] or one of its method shortcuts. The
/// builder starts from the client's defaults.
///
/// # Examples
///
/// ```no_run
/// use hopcall::Client;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), hopcall::Error> {
/// let client = Client::builder().build()?;
///
/// let status = client
///     .post("https://api.example.com/search")?
///     .timeout(Duration::from_secs(5))?
///     .header("x-request-id", "42")?
///     .json(r#"{"query": "rust"}"#)
///     .max_redirects(3)
///     .on_error(|e| eprintln!("transport error: {}", e))
///     .execute_with(|response| response.status)
///     .await?
///     .await?;
/// println!("search answered {}", status);
/// # Ok(())
/// # }
/// ```
pub struct RequestBuilder {
    client: Client,
    method: Method,
    url: Option<Url>,
    version: Version,
    headers: HeaderMap,
    body: Body,
    follow_redirect: bool,
    max_redirects: usize,
    timeout: Option<Duration>,
    listeners: Listeners,
}

impl RequestBuilder {
    pub(crate) fn new(
        client: Client,
        headers: HeaderMap,
        timeout: Option<Duration>,
        follow_redirect: bool,
        max_redirects: usize,
    ) -> Self {
        Self {
            client,
            method: Method::GET,
            url: None,
            version: Version::HTTP_11,
            headers,
            body: Body::Empty,
            follow_redirect,
            max_redirects,
            timeout,
            listeners: Listeners::default(),
        }
    }

    /// Sets the request method. Defaults to `GET`.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the timeout of the whole logical call, redirects included.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero timeout.
    pub fn timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::config("timeout must be greater than zero"));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Sets the HTTP version from its protocol string, `"HTTP/1.0"` or
    /// `"HTTP/1.1"`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown version string, and for versions the
    /// pooled transport cannot send (`HTTP/0.9`, `HTTP/2`, `HTTP/3`).
    pub fn version(mut self, version: impl AsRef<str>) -> Result<Self> {
        self.version = match version.as_ref().to_ascii_uppercase().as_str() {
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/1.1" => Version::HTTP_11,
            unsupported @ ("HTTP/0.9" | "HTTP/2" | "HTTP/2.0" | "HTTP/3" | "HTTP/3.0") => {
                return Err(Error::config(format!(
                    "Unsupported HTTP version: {}",
                    unsupported
                )))
            }
            other => return Err(Error::config(format!("Unknown HTTP version: {}", other))),
        };
        Ok(self)
    }

    /// Sets the request URL.
    ///
    /// # Errors
    ///
    /// Returns an error unless the URL is an absolute `http` or `https` URL
    /// with a host.
    pub fn url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(format!("Unsupported URL scheme: {}", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(Error::config(format!("URL has no host: {}", url)));
        }
        self.url = Some(url);
        Ok(self)
    }

    /// Sets a header, replacing any previous values.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = header_pair(name.as_ref(), value.as_ref())?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a header value, keeping previous values.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn add_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = header_pair(name.as_ref(), value.as_ref())?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Removes all values of a header.
    pub fn remove_header(mut self, name: impl AsRef<str>) -> Self {
        self.headers.remove(name.as_ref());
        self
    }

    /// Sets the `Content-Type` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn content_type(self, content_type: impl AsRef<str>) -> Result<Self> {
        self.header(CONTENT_TYPE.as_str(), content_type)
    }

    /// Asks for gzip-encoded responses.
    pub fn accept_gzip(mut self, gzip: bool) -> Self {
        if gzip {
            self.headers
                .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        } else {
            self.headers.remove(ACCEPT_ENCODING);
        }
        self
    }

    /// Sets whether redirect responses are followed.
    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    /// Sets how many redirects the call follows before the last redirect
    /// response becomes the final one.
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Sets the `User-Agent` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn user_agent(self, user_agent: impl AsRef<str>) -> Result<Self> {
        self.header(USER_AGENT.as_str(), user_agent)
    }

    /// Sets a text body, encoded with the charset of `content_type`.
    ///
    /// Without a charset parameter the text is sent as UTF-8. Supported
    /// charsets are UTF-8, US-ASCII, ISO-8859-1, UTF-16BE and UTF-16LE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] for an unsupported charset or text that the
    /// charset cannot represent.
    pub fn body_text(mut self, text: impl Into<String>, content_type: impl AsRef<str>) -> Result<Self> {
        let content = text.into();
        let content_type = content_type.as_ref();
        let encoded = encode(&content, charset_of(content_type).unwrap_or("utf-8"))?;
        self = self.content_type(content_type)?;
        self.body = Body::Text {
            content,
            content_type: content_type.to_string(),
            encoded,
        };
        Ok(self)
    }

    /// Sets a `text/plain` UTF-8 body.
    pub fn text(self, text: impl Into<String>) -> Self {
        self.utf8_body(text.into(), "text/plain; charset=utf-8")
    }

    /// Sets an `application/json` UTF-8 body from already serialized JSON.
    pub fn json(self, json: impl Into<String>) -> Self {
        self.utf8_body(json.into(), "application/json; charset=utf-8")
    }

    /// Serializes `value` as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json_value<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let json =
            serde_json::to_string(value).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        Ok(self.json(json))
    }

    /// Sets an `application/xml` UTF-8 body.
    pub fn xml(self, xml: impl Into<String>) -> Self {
        self.utf8_body(xml.into(), "application/xml; charset=utf-8")
    }

    /// Sets a binary body.
    ///
    /// # Errors
    ///
    /// Returns an error if the content type is not a valid header value.
    pub fn body_bytes(mut self, bytes: impl Into<Bytes>, content_type: impl AsRef<str>) -> Result<Self> {
        self = self.content_type(content_type.as_ref())?;
        self.body = Body::Binary {
            bytes: bytes.into(),
            content_type: content_type.as_ref().to_string(),
        };
        Ok(self)
    }

    /// Registers the exception listener.
    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.listeners.exception = Some(Arc::new(listener));
        self
    }

    /// Registers the response listener, called for every hop.
    pub fn on_response<F>(mut self, listener: F) -> Self
    where
        F: Fn(&FullResponse) + Send + Sync + 'static,
    {
        self.listeners.response = Some(Arc::new(listener));
        self
    }

    /// Registers the headers listener, called for every hop.
    pub fn on_headers<F>(mut self, listener: F) -> Self
    where
        F: Fn(&HeaderMap) + Send + Sync + 'static,
    {
        self.listeners.headers = Some(Arc::new(listener));
        self
    }

    /// Registers the cookie listener, called once per received cookie.
    pub fn on_cookie<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Cookie) + Send + Sync + 'static,
    {
        self.listeners.cookie = Some(Arc::new(listener));
        self
    }

    /// Produces the immutable request descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if no URL was set.
    pub fn build(&self) -> Result<Request> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| Error::config("Request URL is required"))?;
        let target = Target::from_url(&url)
            .ok_or_else(|| Error::config(format!("Cannot derive connection target from {}", url)))?;

        Ok(Request {
            method: self.method.clone(),
            url,
            target,
            version: self.version,
            headers: self.headers.clone(),
            body: self.body.clone(),
            follow_redirect: self.follow_redirect,
            max_redirects: self.max_redirects,
            timeout: self.timeout,
        })
    }

    /// Submits the request and returns the context of the logical call.
    ///
    /// Returns as soon as a connection for the first hop is acquired; the
    /// exchange itself runs in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be built or no connection can
    /// be acquired.
    pub async fn execute(self) -> Result<RequestContext> {
        let request = self.build()?;
        self.client.execute(request, self.listeners).await
    }

    /// Like [`execute`](Self::execute), additionally returning a future that
    /// resolves to `transform` applied to the final response.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute). Failures of the call itself are
    /// reported through the returned future.
    pub async fn execute_with<T, F>(self, transform: F) -> Result<ResponseFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(&FullResponse) -> T + Send + 'static,
    {
        let context = self.execute().await?;
        Ok(ResponseFuture::new(context, transform))
    }

    fn utf8_body(mut self, content: String, content_type: &'static str) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = Body::Text {
            encoded: Bytes::from(content.clone().into_bytes()),
            content,
            content_type: content_type.to_string(),
        };
        self
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::try_from(name)
        .map_err(|e| Error::config(format!("Invalid header name: {}", e)))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| Error::config(format!("Invalid header value: {}", e)))?;
    Ok((name, value))
}

fn charset_of(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

fn encode(text: &str, charset: &str) -> Result<Bytes> {
    let unrepresentable = |c: char| Error::Encoding {
        charset: charset.to_string(),
        reason: format!("character {:?} cannot be represented", c),
    };
    let bytes = match charset.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => text.as_bytes().to_vec(),
        "us-ascii" | "ascii" => match text.chars().find(|c| !c.is_ascii()) {
            Some(c) => return Err(unrepresentable(c)),
            None => text.as_bytes().to_vec(),
        },
        "iso-8859-1" | "latin1" | "latin-1" => text
            .chars()
            .map(|c| u8::try_from(c).map_err(|_| unrepresentable(c)))
            .collect::<Result<Vec<u8>>>()?,
        "utf-16be" => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
        "utf-16le" => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        _ => {
            return Err(Error::Encoding {
                charset: charset.to_string(),
                reason: "unsupported charset".to_string(),
            })
        }
    };
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> RequestBuilder {
        Client::builder()
            .build()
            .unwrap()
            .get("http://example.com/path?q=1")
            .unwrap()
    }

    #[test]
    fn test_build_applies_settings() {
        let request = builder()
            .version("HTTP/1.0")
            .unwrap()
            .timeout(Duration::from_secs(3))
            .unwrap()
            .header("x-a", "1")
            .unwrap()
            .add_header("x-b", "1")
            .unwrap()
            .add_header("x-b", "2")
            .unwrap()
            .header("x-a", "2")
            .unwrap()
            .accept_gzip(true)
            .follow_redirect(false)
            .max_redirects(4)
            .user_agent("tests/1.0")
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.version(), Version::HTTP_10);
        assert_eq!(request.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(request.header("x-a"), Some("2"));
        assert_eq!(request.headers().get_all("x-b").iter().count(), 2);
        assert_eq!(request.header("accept-encoding"), Some("gzip"));
        assert_eq!(request.header("user-agent"), Some("tests/1.0"));
        assert!(!request.follow_redirect());
        assert_eq!(request.max_redirects(), 4);
        assert_eq!(request.target().port, 80);
    }

    #[test]
    fn test_client_defaults_are_inherited() {
        let client = Client::builder()
            .default_header("x-team", "core")
            .unwrap()
            .max_redirects(2)
            .follow_redirects(false)
            .build()
            .unwrap();
        let request = client.get("https://example.com/").unwrap().build().unwrap();

        assert_eq!(request.header("x-team"), Some("core"));
        assert_eq!(request.header("user-agent"), Some(crate::client::DEFAULT_USER_AGENT));
        assert_eq!(request.max_redirects(), 2);
        assert!(!request.follow_redirect());
    }

    #[test]
    fn test_remove_header() {
        let request = builder()
            .header("x-gone", "1")
            .unwrap()
            .remove_header("x-gone")
            .remove_header("not a header name")
            .build()
            .unwrap();
        assert!(request.header("x-gone").is_none());
    }

    #[test]
    fn test_invalid_input_fails_at_setter() {
        assert!(matches!(
            builder().url("not a url"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            builder().url("ftp://example.com/file"),
            Err(Error::ConfigurationError(_))
        ));
        assert!(matches!(
            builder().timeout(Duration::ZERO),
            Err(Error::ConfigurationError(_))
        ));
        assert!(matches!(
            builder().version("HTTP/4"),
            Err(Error::ConfigurationError(_))
        ));
        assert!(matches!(
            builder().header("bad header", "x"),
            Err(Error::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_version_limited_to_http1() {
        for version in ["HTTP/0.9", "HTTP/2", "HTTP/2.0", "http/3"] {
            match builder().version(version) {
                Err(Error::ConfigurationError(message)) => {
                    assert!(message.starts_with("Unsupported HTTP version"), "{}", message)
                }
                other => panic!("Expected {} to be rejected, got {:?}", version, other.map(|_| ())),
            }
        }
        let request = builder().version("http/1.0").unwrap().build().unwrap();
        assert_eq!(request.version(), Version::HTTP_10);
    }

    #[test]
    fn test_build_requires_url() {
        let client = Client::builder().build().unwrap();
        assert!(matches!(
            client.new_request().build(),
            Err(Error::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_body_charsets() {
        let request = builder()
            .body_text("caf\u{e9}", "text/plain; charset=ISO-8859-1")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.body().as_bytes(), &[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(
            request.header("content-type"),
            Some("text/plain; charset=ISO-8859-1")
        );

        let request = builder()
            .body_text("hi", "text/plain; charset=\"UTF-16BE\"")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.body().as_bytes(), &[0, b'h', 0, b'i']);

        let request = builder().body_text("plain", "text/plain").unwrap().build().unwrap();
        assert_eq!(request.body().as_bytes(), b"plain");
    }

    #[test]
    fn test_body_encoding_failure_is_synchronous() {
        match builder().body_text("\u{20ac}10", "text/plain; charset=us-ascii") {
            Err(Error::Encoding { charset, .. }) => assert_eq!(charset, "us-ascii"),
            Err(e) => panic!("Expected Encoding error, got {:?}", e),
            Ok(_) => panic!("Expected Encoding error"),
        }
        assert!(matches!(
            builder().body_text("x", "text/plain; charset=klingon"),
            Err(Error::Encoding { .. })
        ));
    }

    #[test]
    fn test_convenience_bodies() {
        #[derive(Serialize)]
        struct Query {
            term: &'static str,
        }

        let request = builder().json_value(&Query { term: "rust" }).unwrap().build().unwrap();
        assert_eq!(request.body().as_bytes(), br#"{"term":"rust"}"#);
        assert_eq!(
            request.header("content-type"),
            Some("application/json; charset=utf-8")
        );

        let request = builder().xml("<a/>").build().unwrap();
        assert_eq!(request.body().content_type(), Some("application/xml; charset=utf-8"));

        let request = builder()
            .body_bytes(vec![1u8, 2, 3], "application/octet-stream")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.body().as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_built_request_is_detached_from_builder() {
        let builder = builder().text("one");
        let first = builder.build().unwrap();
        let second = builder.text("two").build().unwrap();
        assert_eq!(first.body().as_bytes(), b"one");
        assert_eq!(second.body().as_bytes(), b"two");
    }
}
