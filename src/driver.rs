//! Dispatch of transport events to a bound logical call.
//!
//! Handling an event is split in two. [`plan`] is a pure function from an
//! event and a [`Snapshot`] of the context to the ordered list of
//! [`Effect`]s to perform. [`ResponseDriver`] applies that list to a
//! [`Binding`]: it fires listeners, mutates the [`RequestContext`], and
//! finally either releases the connection or hands it to the redirect
//! mechanism.
//!
//! For one event the order is always: listeners, then the redirect decision
//! or the terminal transition, then the release. The terminal transition is
//! published to waiters only after the release.
//!
//! Listeners are user code. If one panics, the rest of the plan is dropped
//! and the event is handled as a transport error instead.

use crate::context::{RequestContext, Settled, State};
use crate::cookie::Cookie;
use crate::error::Failure;
use crate::listener::Listeners;
use crate::listener::Fired;
use crate::pool::{Connection, ConnectionPool, TransportError, TransportErrorKind, TransportEvent};
use crate::redirect::{self, Decision, RedirectPolicy};
use crate::request::Request;
use http::StatusCode;
use std::sync::Arc;
use url::Url;

/// What the driver needs to know about the context for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: State,
    pub redirect_count: usize,
}

impl Snapshot {
    pub fn of(context: &RequestContext) -> Self {
        Self {
            state: context.state(),
            redirect_count: context.redirect_count(),
        }
    }
}

/// One side effect of handling a transport event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    NotifyHeaders,
    RecordCookie(Cookie),
    NotifyResponse,
    NotifyException(TransportError),
    /// Continue the logical call at this URL; the connection goes to the
    /// redirect mechanism instead of back to the pool.
    Follow(Url),
    Succeed,
    Fail(Failure),
    Release,
}

/// Computes the effects of `event` for a context in state `snapshot`.
///
/// A followed redirect is the only plan that does not end with
/// [`Effect::Release`].
pub fn plan(
    event: &TransportEvent,
    snapshot: Snapshot,
    request: &Request,
    policy: &dyn RedirectPolicy,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    match event {
        TransportEvent::FullResponse(response) => {
            effects.push(Effect::NotifyHeaders);
            for header in response.set_cookie_headers() {
                match Cookie::parse(header) {
                    Some(cookie) => effects.push(Effect::RecordCookie(cookie)),
                    None => tracing::warn!(header = %header, "dropping malformed cookie"),
                }
            }
            effects.push(Effect::NotifyResponse);

            if snapshot.state == State::Pending {
                if let Decision::FollowTo(url) =
                    redirect::evaluate(policy, response, request, snapshot.redirect_count)
                {
                    effects.push(Effect::Follow(url));
                    return effects;
                }
            }
            effects.push(Effect::Succeed);
            effects.push(Effect::Release);
        }
        TransportEvent::ChannelClosed => {
            // only the current hop is ever bound, so a hang-up on any hop
            // ends a pending call
            if snapshot.state == State::Pending {
                effects.push(Effect::Fail(Failure::ConnectionClosed));
            }
            effects.push(Effect::Release);
        }
        TransportEvent::TransportError(error) => {
            effects.push(Effect::NotifyException(error.clone()));
            effects.push(Effect::Fail(Failure::Transport(error.message().to_string())));
            effects.push(Effect::Release);
        }
    }
    effects
}

/// A logical call bound to the physical connection carrying its current hop.
pub struct Binding {
    pub(crate) context: RequestContext,
    pub(crate) listeners: Listeners,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) connection: Connection,
    pub(crate) hop: usize,
}

impl Binding {
    pub fn new(
        context: RequestContext,
        listeners: Listeners,
        pool: Arc<dyn ConnectionPool>,
        connection: Connection,
    ) -> Self {
        Self {
            context,
            listeners,
            pool,
            connection,
            hop: 0,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Index of the hop this binding carries, 0 for the first request.
    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Splits off the connection and returns it to the pool, keeping the
    /// rest of the binding for the caller.
    pub(crate) fn into_unbound(self) -> Unbound {
        let Binding {
            context,
            listeners,
            pool,
            connection,
            hop,
        } = self;
        pool.release(connection);
        Unbound {
            context,
            listeners,
            pool,
            hop,
        }
    }
}

/// A logical call between hops, holding no connection.
pub(crate) struct Unbound {
    pub(crate) context: RequestContext,
    pub(crate) listeners: Listeners,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) hop: usize,
}

impl Unbound {
    pub(crate) fn bind(self, connection: Connection) -> Binding {
        Binding {
            context: self.context,
            listeners: self.listeners,
            pool: self.pool,
            connection,
            hop: self.hop + 1,
        }
    }
}

/// What happens to the logical call after an event was handled.
pub enum Step {
    /// The connection was released; nothing more to do for this hop.
    Done,
    /// A redirect was accepted. The binding still owns its connection.
    Redirect {
        to: Url,
        status: StatusCode,
        binding: Binding,
    },
}

/// Applies event plans to bound logical calls.
#[derive(Clone)]
pub struct ResponseDriver {
    policy: Arc<dyn RedirectPolicy>,
}

impl ResponseDriver {
    pub fn new(policy: Arc<dyn RedirectPolicy>) -> Self {
        Self { policy }
    }

    /// Handles one transport event for the call bound in `binding`.
    pub fn handle(&self, binding: Binding, request: &Request, event: TransportEvent) -> Step {
        let snapshot = Snapshot::of(&binding.context);
        let effects = plan(&event, snapshot, request, self.policy.as_ref());
        let response = match event {
            TransportEvent::FullResponse(response) => Some(Arc::new(response)),
            _ => None,
        };
        tracing::debug!(
            context = binding.context.id(),
            connection = %binding.connection.id(),
            hop = binding.hop,
            effects = effects.len(),
            "handling transport event"
        );

        let mut settled: Option<Settled> = None;
        for effect in effects {
            let fired: Fired = match effect {
                Effect::NotifyHeaders => match &response {
                    Some(response) => binding.listeners.fire_headers(&response.headers),
                    None => Ok(()),
                },
                Effect::RecordCookie(cookie) => {
                    binding.context.add_cookie(cookie.clone());
                    binding.listeners.fire_cookie(&cookie)
                }
                Effect::NotifyResponse => match &response {
                    Some(response) => binding.listeners.fire_response(response),
                    None => Ok(()),
                },
                Effect::NotifyException(error) => {
                    if let Err(message) = binding.listeners.fire_exception(&error) {
                        tracing::warn!(
                            context = binding.context.id(),
                            panic = %message,
                            "exception listener panicked"
                        );
                    }
                    Ok(())
                }
                Effect::Follow(to) => match binding.context.record_redirect() {
                    Some(count) => {
                        tracing::debug!(
                            context = binding.context.id(),
                            location = %to,
                            redirects = count,
                            "following redirect"
                        );
                        let status = response
                            .as_ref()
                            .map_or(StatusCode::FOUND, |response| response.status);
                        return Step::Redirect {
                            to,
                            status,
                            binding,
                        };
                    }
                    None => {
                        tracing::debug!(context = binding.context.id(), "call finished before redirect");
                        break;
                    }
                },
                Effect::Succeed => {
                    if let Some(response) = &response {
                        settled = binding.context.settle(Ok(response.clone()));
                        if settled.is_some() {
                            tracing::info!(
                                context = binding.context.id(),
                                status = response.status.as_u16(),
                                url = %response.url,
                                redirects = binding.context.redirect_count(),
                                "request finished"
                            );
                        }
                    }
                    Ok(())
                }
                Effect::Fail(failure) => {
                    let reason = failure.reason();
                    settled = binding.context.settle(Err(failure));
                    if settled.is_some() {
                        tracing::warn!(
                            context = binding.context.id(),
                            reason = %reason,
                            redirects = binding.context.redirect_count(),
                            "request failed"
                        );
                    }
                    Ok(())
                }
                Effect::Release => break,
            };
            if let Err(message) = fired {
                settled = listener_panicked(&binding, &message);
                break;
            }
        }
        binding.into_unbound();
        drop(settled);
        Step::Done
    }
}

/// Handles a panic raised by a listener the way a transport error is handled:
/// the exception listener hears about it and the call fails.
fn listener_panicked(binding: &Binding, message: &str) -> Option<Settled> {
    let error = TransportError::new(
        TransportErrorKind::Listener,
        format!("listener panicked: {}", message),
    );
    tracing::warn!(context = binding.context.id(), error = %error, "failing call after listener panic");
    if let Err(message) = binding.listeners.fire_exception(&error) {
        tracing::warn!(
            context = binding.context.id(),
            panic = %message,
            "exception listener panicked"
        );
    }
    binding
        .context
        .settle(Err(Failure::Transport(error.message().to_string())))
}
