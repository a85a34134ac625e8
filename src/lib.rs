//! # Hopcall - redirect-aware HTTP calls over pooled connections
//!
//! Hopcall models one logical HTTP call, which may span several redirected
//! physical requests, as a single [`RequestContext`]. A fluent
//! [`RequestBuilder`] produces an immutable [`Request`] plus a set of
//! listeners; the [`driver`] fans every transport event out to those
//! listeners, decides between redirect and completion, and returns each
//! pooled connection exactly once.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hopcall::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hopcall::Error> {
//!     let client = Client::builder()
//!         .timeout(Duration::from_secs(30))
//!         .build()?;
//!
//!     let context = client
//!         .get("http://example.com/login")?
//!         .on_cookie(|cookie| println!("got cookie {}", cookie))
//!         .execute()
//!         .await?;
//!
//!     let response = context.wait().await?;
//!     println!(
//!         "{} from {} after {} redirects",
//!         response.status,
//!         response.url,
//!         context.redirect_count()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **One context per logical call** - redirect hops share the same [`RequestContext`],
//!   which completes exactly once
//! - **Listeners** - headers, cookie and response callbacks fire for every hop;
//!   the exception callback fires before a transport failure is recorded
//! - **Cookie accumulation** - cookies from all hops, in order; malformed ones are dropped
//! - **Pluggable pool** - any [`ConnectionPool`](pool::ConnectionPool); a reqwest-backed
//!   [`ReqwestPool`](pool::ReqwestPool) is the default
//! - **Pluggable redirects** - any [`RedirectPolicy`](redirect::RedirectPolicy)
//! - **Automatic logging** - structured logging with `tracing`
//!
//! ## Error Handling
//!
//! Construction errors surface from the builder call that caused them.
//! Transport errors end the call and are reported through the context:
//!
//! ```no_run
//! use hopcall::{Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().build()?;
//! let context = client.get("http://example.com/")?.execute().await?;
//! match context.wait().await {
//!     Ok(response) => println!("status {}", response.status),
//!     Err(Error::Failed(failure)) => eprintln!("call failed: {}", failure.reason()),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod context;
mod cookie;
pub mod driver;
mod error;
mod listener;
pub mod pool;
pub mod redirect;
mod request;
mod response;

pub use builder::RequestBuilder;
pub use client::{Client, ClientBuilder, DEFAULT_MAX_REDIRECTS, DEFAULT_USER_AGENT};
pub use context::{Completion, RequestContext, ResponseFuture, State};
pub use cookie::{Cookie, SameSite};
pub use error::{Error, Failure, Result};
pub use listener::{
    CookieListener, ExceptionListener, HeadersListener, Listeners, ResponseListener,
};
pub use request::{Body, Request, Target};
pub use response::FullResponse;
