//! Pooled connections and the transport events they produce.
//!
//! The core only relies on the [`ConnectionPool`] contract: `acquire` hands
//! out a [`Connection`] for a [`Target`], `release` takes it back. Because
//! `release` consumes the connection, a single acquisition can be released
//! at most once.
//!
//! [`ReqwestPool`] is the default pool. It bounds concurrent exchanges with a
//! semaphore and performs each exchange through a `reqwest::Client` with
//! redirects disabled, so that redirect handling stays with the driver.

use crate::error::{Error, Result};
use crate::request::{Request, Target};
use crate::response::FullResponse;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Broad category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No connection could be established.
    Connect,
    /// The pool had no connection to hand out.
    Exhausted,
    /// A deadline expired.
    Timeout,
    /// Reading or writing the exchange failed.
    Io,
    /// A listener panicked while the exchange was being handled.
    Listener,
}

/// A transport-level error, as seen by the exception listener.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("request timed out after {:?}", after),
        )
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Io
        };
        Self::new(kind, error_chain(&e))
    }
}

/// One inbound event of a physical exchange.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The complete response was received.
    FullResponse(FullResponse),
    /// The connection went inactive before a complete response arrived.
    ChannelClosed,
    /// The transport raised an error.
    TransportError(TransportError),
}

/// Identifier of a physical connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The byte-level side of a connection: sends a request, reports the outcome.
#[async_trait]
pub trait Channel: Send {
    /// Performs one request/response exchange.
    async fn exchange(&mut self, request: &Request) -> TransportEvent;
}

/// A connection handed out by a [`ConnectionPool`].
pub struct Connection {
    id: ConnectionId,
    target: Target,
    channel: Box<dyn Channel>,
}

impl Connection {
    pub fn new(target: Target, channel: Box<dyn Channel>) -> Self {
        Self {
            id: ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)),
            target,
            channel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) async fn exchange(&mut self, request: &Request) -> TransportEvent {
        self.channel.exchange(request).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}

/// The connection-pool contract consumed by the client.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use hopcall::pool::{Channel, Connection, ConnectionPool, TransportError, TransportEvent};
/// use hopcall::{Request, Target};
///
/// struct AlwaysClosed;
///
/// #[async_trait]
/// impl Channel for AlwaysClosed {
///     async fn exchange(&mut self, _request: &Request) -> TransportEvent {
///         TransportEvent::ChannelClosed
///     }
/// }
///
/// struct ClosedPool;
///
/// #[async_trait]
/// impl ConnectionPool for ClosedPool {
///     async fn acquire(&self, target: &Target) -> Result<Connection, TransportError> {
///         Ok(Connection::new(target.clone(), Box::new(AlwaysClosed)))
///     }
///
///     fn release(&self, _connection: Connection) {}
/// }
/// ```
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Hands out a connection to `target`.
    async fn acquire(&self, target: &Target) -> std::result::Result<Connection, TransportError>;

    /// Returns a connection to the pool.
    fn release(&self, connection: Connection);
}

/// The default pool, backed by `reqwest`.
pub struct ReqwestPool {
    http_client: reqwest::Client,
    permits: Arc<Semaphore>,
    max_connections: usize,
    acquire_timeout: Duration,
}

impl ReqwestPool {
    /// Creates a pool allowing at most `max_connections` concurrent exchanges.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_connections` is zero or the underlying HTTP
    /// client cannot be built.
    pub fn new(max_connections: usize, acquire_timeout: Duration) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(max_connections)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            acquire_timeout,
        })
    }

    /// Number of connections that can currently be acquired.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl fmt::Debug for ReqwestPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestPool")
            .field("max_connections", &self.max_connections)
            .field("available", &self.available())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[async_trait]
impl ConnectionPool for ReqwestPool {
    async fn acquire(&self, target: &Target) -> std::result::Result<Connection, TransportError> {
        let permit =
            tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
                .await
                .map_err(|_| {
                    TransportError::new(
                        TransportErrorKind::Exhausted,
                        format!(
                            "no connection to {} available within {:?}",
                            target, self.acquire_timeout
                        ),
                    )
                })?
                .map_err(|_| TransportError::new(TransportErrorKind::Exhausted, "pool closed"))?;

        let connection = Connection::new(
            target.clone(),
            Box::new(ReqwestChannel {
                http_client: self.http_client.clone(),
                _permit: permit,
            }),
        );
        tracing::debug!(connection = %connection.id(), target = %target, "acquired connection");
        Ok(connection)
    }

    fn release(&self, connection: Connection) {
        tracing::debug!(
            connection = %connection.id(),
            target = %connection.target(),
            "released connection"
        );
        // dropping the channel returns its permit
        drop(connection);
    }
}

struct ReqwestChannel {
    http_client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Channel for ReqwestChannel {
    async fn exchange(&mut self, request: &Request) -> TransportEvent {
        let mut builder = self
            .http_client
            .request(request.method().clone(), request.url().clone())
            .version(request.version())
            .headers(request.headers().clone());
        if !request.body().is_empty() {
            builder = builder.body(request.body().as_bytes().to_vec());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return classify(e),
        };
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let url = response.url().clone();

        match response.bytes().await {
            Ok(body) => TransportEvent::FullResponse(FullResponse {
                status,
                version,
                headers,
                body,
                url,
            }),
            Err(e) => classify(e),
        }
    }
}

fn classify(e: reqwest::Error) -> TransportEvent {
    if !e.is_timeout() && !e.is_connect() && closed_early(&e) {
        TransportEvent::ChannelClosed
    } else {
        TransportEvent::TransportError(e.into())
    }
}

// A peer that hangs up before the response is complete surfaces as hyper's
// incomplete-message error or as a bare EOF. Resets and aborts are errors.
fn closed_early(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(e);
    while let Some(err) = source {
        if let Some(hyper) = err.downcast_ref::<hyper::Error>() {
            if hyper.is_incomplete_message() {
                return true;
            }
        }
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}
