//! User callbacks attached to a logical call.

use crate::cookie::Cookie;
use crate::pool::TransportError;
use crate::response::FullResponse;
use http::HeaderMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub type ExceptionListener = Arc<dyn Fn(&TransportError) + Send + Sync>;
pub type HeadersListener = Arc<dyn Fn(&HeaderMap) + Send + Sync>;
pub type CookieListener = Arc<dyn Fn(&Cookie) + Send + Sync>;
pub type ResponseListener = Arc<dyn Fn(&FullResponse) + Send + Sync>;

/// Result of firing a listener; `Err` carries the message of a panic raised by
/// user code.
pub(crate) type Fired = std::result::Result<(), String>;

/// The four optional callbacks of a logical call.
///
/// Headers, cookie and response listeners fire for every hop, including
/// intermediate redirect responses. The exception listener fires at most once
/// and always precedes the call's failure.
///
/// A panicking listener does not unwind into the transport. The panic is
/// caught and the call fails as if the transport had raised an error.
#[derive(Clone, Default)]
pub struct Listeners {
    pub(crate) exception: Option<ExceptionListener>,
    pub(crate) headers: Option<HeadersListener>,
    pub(crate) cookie: Option<CookieListener>,
    pub(crate) response: Option<ResponseListener>,
}

impl Listeners {
    pub(crate) fn fire_exception(&self, error: &TransportError) -> Fired {
        match &self.exception {
            Some(listener) => {
                tracing::debug!(error = %error, "firing exception listener");
                shielded(|| listener(error))
            }
            None => Ok(()),
        }
    }

    pub(crate) fn fire_headers(&self, headers: &HeaderMap) -> Fired {
        match &self.headers {
            Some(listener) => {
                tracing::debug!(count = headers.len(), "firing headers listener");
                shielded(|| listener(headers))
            }
            None => Ok(()),
        }
    }

    pub(crate) fn fire_cookie(&self, cookie: &Cookie) -> Fired {
        match &self.cookie {
            Some(listener) => {
                tracing::debug!(cookie = %cookie.name, "firing cookie listener");
                shielded(|| listener(cookie))
            }
            None => Ok(()),
        }
    }

    pub(crate) fn fire_response(&self, response: &FullResponse) -> Fired {
        match &self.response {
            Some(listener) => {
                tracing::debug!(status = response.status.as_u16(), "firing response listener");
                shielded(|| listener(response))
            }
            None => Ok(()),
        }
    }
}

/// Runs user code, turning a panic into its message.
pub(crate) fn shielded<R>(f: impl FnOnce() -> R) -> std::result::Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("exception", &self.exception.is_some())
            .field("headers", &self.headers.is_some())
            .field("cookie", &self.cookie.is_some())
            .field("response", &self.response.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_missing_listeners_are_noops() {
        let listeners = Listeners::default();
        assert_eq!(listeners.fire_headers(&HeaderMap::new()), Ok(()));
        assert_eq!(listeners.fire_exception(&TransportError::io("reset")), Ok(()));
    }

    #[test]
    fn test_panicking_listener_reports_message() {
        let listeners = Listeners {
            headers: Some(Arc::new(|headers: &HeaderMap| {
                if headers.contains_key("x-boom") {
                    panic!("bad header {}", "x-boom");
                }
            })),
            cookie: Some(Arc::new(|_: &Cookie| panic!("cookie jar full"))),
            ..Listeners::default()
        };

        let mut headers = HeaderMap::new();
        assert_eq!(listeners.fire_headers(&headers), Ok(()));
        headers.insert("x-boom", HeaderValue::from_static("1"));
        assert_eq!(
            listeners.fire_headers(&headers),
            Err("bad header x-boom".to_string())
        );
        assert_eq!(
            listeners.fire_cookie(&Cookie::new("a", "1")),
            Err("cookie jar full".to_string())
        );
    }
}
