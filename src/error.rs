//! Error types for request construction and logical call failures.
//!
//! Two families of errors exist. [`Error`] is returned synchronously by
//! builder setters and by [`RequestBuilder::execute`](crate::RequestBuilder::execute);
//! it never travels through a [`RequestContext`](crate::RequestContext).
//! [`Failure`] is the terminal reason recorded on a context when a logical
//! call ends badly, and is cheap to clone so every observer gets a copy.

use crate::pool::TransportError;

/// The main error type for building and executing requests.
///
/// # Examples
///
/// ```
/// use hopcall::{Client, Error};
///
/// # fn example() -> Result<(), Error> {
/// let client = Client::builder().build()?;
///
/// match client.get("not a url") {
///     Err(Error::InvalidUrl(e)) => eprintln!("bad url: {}", e),
///     Err(e) => eprintln!("other error: {}", e),
///     Ok(_) => unreachable!(),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An invalid URL was provided.
    ///
    /// This wraps URL parsing errors.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Invalid configuration was provided.
    ///
    /// This covers invalid header names or values, unsupported URL schemes
    /// and unknown HTTP versions.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A request body could not be encoded with the requested charset.
    #[error("Cannot encode body as {charset}: {reason}")]
    Encoding {
        /// The charset named by the content type
        charset: String,
        /// Why the conversion failed
        reason: String,
    },

    /// Failed to serialize a JSON request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// The connection pool could not hand out a connection for the first hop.
    #[error("Failed to acquire connection: {0}")]
    Acquire(TransportError),

    /// The logical call reached its failed terminal state.
    #[error("Request failed: {0}")]
    Failed(Failure),
}

impl Error {
    /// Returns the terminal failure if this error came from a finished call.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::ConfigurationError(message.into())
    }
}

/// The reason a logical call ended in the failed state.
///
/// Exactly one `Failure` is ever recorded per [`RequestContext`](crate::RequestContext);
/// later failure attempts are dropped.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The connection went inactive before a full response arrived.
    #[error("connection closed before response completed")]
    ConnectionClosed,

    /// The transport raised an error; this carries its message.
    #[error("{0}")]
    Transport(String),
}

impl Failure {
    /// The human-readable reason string.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// A specialized `Result` type for this crate.
///
/// This is a convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons() {
        assert_eq!(
            Failure::ConnectionClosed.reason(),
            "connection closed before response completed"
        );
        assert_eq!(Failure::Transport("reset by peer".into()).reason(), "reset by peer");
    }

    #[test]
    fn test_failure_accessor() {
        let err = Error::Failed(Failure::ConnectionClosed);
        assert_eq!(err.failure(), Some(&Failure::ConnectionClosed));
        assert!(Error::config("nope").failure().is_none());
    }
}
