//! Cookie records decoded from `Set-Cookie` response headers.
//!
//! Decoding is lenient at the call level: a header that does not describe a
//! valid cookie yields `None` and is dropped by the response driver. Unknown
//! or malformed attributes are ignored without rejecting the cookie.

use std::fmt;
use std::time::SystemTime;

/// The `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// A cookie received from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// `Max-Age` in seconds; zero or negative means "expire now".
    pub max_age: Option<i64>,
    pub expires: Option<SystemTime>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl Cookie {
    /// Creates a cookie with only a name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            max_age: None,
            expires: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// Decodes a raw `Set-Cookie` header value.
    ///
    /// Returns `None` when the name/value pair is missing or invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use hopcall::Cookie;
    ///
    /// let cookie = Cookie::parse("sid=abc123; Path=/; HttpOnly").unwrap();
    /// assert_eq!(cookie.name, "sid");
    /// assert_eq!(cookie.value, "abc123");
    /// assert_eq!(cookie.path.as_deref(), Some("/"));
    /// assert!(cookie.http_only);
    ///
    /// assert!(Cookie::parse("=novalue").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Cookie> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return None;
        }
        let value = unquote(value.trim())?;
        if !value.bytes().all(is_cookie_octet) {
            return None;
        }

        let mut cookie = Cookie::new(name, value);
        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
                }
                "path" if val.starts_with('/') => cookie.path = Some(val.to_string()),
                "max-age" => {
                    if let Ok(seconds) = val.parse::<i64>() {
                        cookie.max_age = Some(seconds);
                    }
                }
                "expires" => {
                    if let Ok(at) = httpdate::parse_http_date(val) {
                        cookie.expires = Some(at);
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => {
                    cookie.same_site = match val.to_ascii_lowercase().as_str() {
                        "strict" => Some(SameSite::Strict),
                        "lax" => Some(SameSite::Lax),
                        "none" => Some(SameSite::None),
                        _ => None,
                    };
                }
                _ => {}
            }
        }
        Some(cookie)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn unquote(value: &str) -> Option<&str> {
    match value.strip_prefix('"') {
        Some(rest) => rest.strip_suffix('"'),
        None => Some(value),
    }
}

// RFC 6265 cookie-octet
fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

// RFC 7230 tchar
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
