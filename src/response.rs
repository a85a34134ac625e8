//! Fully received HTTP responses.
//!
//! A [`FullResponse`] is what the transport delivers for one physical
//! exchange. Listeners see every hop's response; the final one is kept on
//! the [`RequestContext`](crate::RequestContext) once the call succeeds.

use bytes::Bytes;
use http::header::SET_COOKIE;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

/// A complete HTTP response: status line, headers and the whole body.
///
/// Status codes are not interpreted. A 500 is delivered and completes the
/// call like a 200 would.
///
/// # Examples
///
/// ```
/// use hopcall::FullResponse;
/// use http::{HeaderMap, HeaderValue, StatusCode};
///
/// let mut headers = HeaderMap::new();
/// headers.insert("content-type", HeaderValue::from_static("application/json"));
///
/// let response = FullResponse::new(
///     StatusCode::OK,
///     headers,
///     r#"{"id": 7}"#,
///     "http://example.com/".parse().unwrap(),
/// );
///
/// assert_eq!(response.header("content-type"), Some("application/json"));
/// let value: serde_json::Value = response.json().unwrap();
/// assert_eq!(value["id"], 7);
/// ```
#[derive(Debug, Clone)]
pub struct FullResponse {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The HTTP version the server answered with.
    pub version: Version,

    /// The response headers.
    pub headers: HeaderMap,

    /// The complete response body.
    pub body: Bytes,

    /// The URL this response was received from.
    pub url: Url,
}

impl FullResponse {
    /// Creates a new HTTP/1.1 `FullResponse`.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>, url: Url) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body: body.into(),
            url,
        }
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// All `Set-Cookie` header values, in header order.
    ///
    /// Values that are not visible ASCII are skipped.
    pub fn set_cookie_headers(&self) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
    }

    /// The body decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Returns `true` for 3xx responses other than 304.
    pub fn is_redirection(&self) -> bool {
        self.status.is_redirection() && self.status != StatusCode::NOT_MODIFIED
    }
}
