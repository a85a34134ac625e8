//! HTTP client owning the connection pool and the redirect machinery.
//!
//! The [`Client`] type is the entry point for creating requests.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    builder::RequestBuilder,
    context::RequestContext,
    driver::{Binding, ResponseDriver, Step},
    error::Failure,
    listener::Listeners,
    pool::{ConnectionPool, ReqwestPool, TransportError, TransportEvent},
    redirect::{DefaultRedirectPolicy, RedirectPolicy},
    request::Request,
    Error, Result,
};
use http::{header::USER_AGENT, HeaderMap, HeaderName, HeaderValue, Method};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The user agent sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("hopcall/", env!("CARGO_PKG_VERSION"));

/// Redirect limit applied when none is configured.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// An HTTP client that executes requests over pooled connections.
///
/// The client is designed to be reused across multiple requests. Clones
/// share the same pool and configuration.
///
/// # Examples
///
/// ```no_run
/// use hopcall::Client;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), hopcall::Error> {
/// let client = Client::builder()
///     .timeout(Duration::from_secs(30))
///     .max_redirects(5)
///     .default_header("accept", "application/json")?
///     .build()?;
///
/// let context = client
///     .get("https://api.example.com/users/123")?
///     .on_response(|response| println!("hop answered {}", response.status))
///     .execute()
///     .await?;
///
/// let response = context.wait().await?;
/// println!("final status {}", response.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    pool: Arc<dyn ConnectionPool>,
    driver: ResponseDriver,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    follow_redirects: bool,
    max_redirects: usize,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Starts a request with the given method and URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or is not an absolute
    /// `http`/`https` URL.
    pub fn request(&self, method: Method, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.new_request().method(method).url(url)
    }

    /// Starts a GET request without a URL; set one with [`RequestBuilder::url`].
    pub fn new_request(&self) -> RequestBuilder {
        RequestBuilder::new(
            self.clone(),
            self.inner.default_headers.clone(),
            self.inner.timeout,
            self.inner.follow_redirects,
            self.inner.max_redirects,
        )
    }

    pub fn get(&self, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl AsRef<str>) -> Result<RequestBuilder> {
        self.request(Method::DELETE, url)
    }

    /// Acquires a connection for the first hop, binds a fresh context to it
    /// and drives the logical call on a background task.
    pub(crate) async fn execute(
        &self,
        request: Request,
        listeners: Listeners,
    ) -> Result<RequestContext> {
        let pool = self.inner.pool.clone();
        let connection = pool
            .acquire(request.target())
            .await
            .map_err(Error::Acquire)?;

        let context = RequestContext::new();
        tracing::debug!(
            context = context.id(),
            method = %request.method(),
            url = %request.url(),
            connection = %connection.id(),
            "executing request"
        );

        let binding = Binding::new(context.clone(), listeners, pool, connection);
        tokio::spawn(drive(self.inner.driver.clone(), binding, request));
        Ok(context)
    }
}

/// Runs every hop of a logical call until the driver is done with it.
async fn drive(driver: ResponseDriver, mut binding: Binding, mut request: Request) {
    let deadline = request
        .timeout()
        .map(|timeout| (timeout, Instant::now() + timeout));

    loop {
        let event = match within(deadline, binding.connection.exchange(&request)).await {
            Some(event) => event,
            None if binding.context.is_done() => {
                binding.into_unbound();
                return;
            }
            None => TransportEvent::TransportError(timed_out(deadline)),
        };

        let (to, status, redirected) = match driver.handle(binding, &request, event) {
            Step::Done => return,
            Step::Redirect {
                to,
                status,
                binding,
            } => (to, status, binding),
        };

        // hop N goes back to the pool before hop N+1 is acquired
        request = request.redirected(to, status);
        let unbound = redirected.into_unbound();
        let acquired = match within(deadline, unbound.pool.acquire(request.target())).await {
            Some(acquired) => acquired,
            None => Err(timed_out(deadline)),
        };
        match acquired {
            Ok(connection) => {
                tracing::debug!(
                    context = unbound.context.id(),
                    url = %request.url(),
                    connection = %connection.id(),
                    "rebound request to next hop"
                );
                binding = unbound.bind(connection);
            }
            Err(error) => {
                if let Err(message) = unbound.listeners.fire_exception(&error) {
                    tracing::warn!(
                        context = unbound.context.id(),
                        panic = %message,
                        "exception listener panicked"
                    );
                }
                if unbound.context.fail(Failure::Transport(error.message().to_string())) {
                    tracing::warn!(
                        context = unbound.context.id(),
                        url = %request.url(),
                        error = %error,
                        "could not acquire connection for redirect"
                    );
                }
                return;
            }
        }
    }
}

async fn within<F: Future>(deadline: Option<(Duration, Instant)>, future: F) -> Option<F::Output> {
    match deadline {
        Some((_, at)) => tokio::time::timeout_at(at, future).await.ok(),
        None => Some(future.await),
    }
}

fn timed_out(deadline: Option<(Duration, Instant)>) -> TransportError {
    TransportError::timeout(deadline.map_or(Duration::ZERO, |(timeout, _)| timeout))
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use hopcall::ClientBuilder;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), hopcall::Error> {
/// let client = ClientBuilder::new()
///     .max_connections(16)
///     .acquire_timeout(Duration::from_secs(2))
///     .timeout(Duration::from_secs(30))
///     .user_agent("my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    pool: Option<Arc<dyn ConnectionPool>>,
    max_connections: usize,
    acquire_timeout: Duration,
    redirect_policy: Arc<dyn RedirectPolicy>,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    follow_redirects: bool,
    max_redirects: usize,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        Self {
            pool: None,
            max_connections: 32,
            acquire_timeout: Duration::from_secs(10),
            redirect_policy: Arc::new(DefaultRedirectPolicy),
            default_headers,
            timeout: None,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    /// Uses a custom connection pool instead of the default [`ReqwestPool`].
    ///
    /// `max_connections` and `acquire_timeout` are ignored when a pool is set.
    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the size of the default pool.
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets how long the default pool waits for a free connection.
    pub fn acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Sets the policy consulted for redirect responses.
    pub fn redirect_policy(mut self, policy: Arc<dyn RedirectPolicy>) -> Self {
        self.redirect_policy = policy;
        self
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::config(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::config(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the default `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn user_agent(self, user_agent: impl AsRef<str>) -> Result<Self> {
        self.default_header(USER_AGENT.as_str(), user_agent)
    }

    /// Sets the default timeout of a logical call, redirects included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets whether redirects are followed by default.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Sets the default redirect limit.
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the default pool cannot be created.
    pub fn build(self) -> Result<Client> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(ReqwestPool::new(self.max_connections, self.acquire_timeout)?),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                pool,
                driver: ResponseDriver::new(self.redirect_policy),
                default_headers: self.default_headers,
                timeout: self.timeout,
                follow_redirects: self.follow_redirects,
                max_redirects: self.max_redirects,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
