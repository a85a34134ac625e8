//! The completion object of one logical call.
//!
//! A [`RequestContext`] is created when a request is executed and lives for
//! the whole logical call, across every redirect hop. It moves from
//! [`State::Pending`] to exactly one of the terminal states; the first
//! transition wins and later attempts are silently dropped.
//!
//! The driver records a transition and publishes it in two steps, with the
//! connection release in between. Observers (state queries, waiters, hooks)
//! only see the transition once it is published, so by the time a caller
//! learns the outcome the connection is already back in its pool.

use crate::cookie::Cookie;
use crate::error::{Error, Failure, Result};
use crate::listener::shielded;
use crate::response::FullResponse;
use std::fmt;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The call is still in flight, possibly between redirect hops.
    Pending,
    /// A final response was delivered.
    Succeeded,
    /// The call ended without a final response.
    Failed,
}

impl State {
    /// Returns `true` for [`State::Succeeded`] and [`State::Failed`].
    pub fn is_terminal(self) -> bool {
        self != State::Pending
    }
}

/// Terminal result handed to completion hooks.
pub type Completion = std::result::Result<Arc<FullResponse>, Failure>;

type CompletionHook = Box<dyn FnOnce(&Completion) + Send>;

#[derive(Default)]
struct Slot {
    outcome: Option<Completion>,
    published: bool,
    hooks: Vec<CompletionHook>,
}

impl Slot {
    fn visible(&self) -> Option<&Completion> {
        self.outcome.as_ref().filter(|_| self.published)
    }
}

struct Inner {
    id: u64,
    redirect_count: AtomicUsize,
    cookies: Mutex<Vec<Cookie>>,
    slot: Mutex<Slot>,
    done: Condvar,
    notify: Notify,
}

/// The mutable, future-like handle of one logical HTTP call.
///
/// Cloning is cheap and every clone refers to the same call; use
/// [`RequestContext::same_call`] to compare identities.
///
/// # Examples
///
/// ```no_run
/// use hopcall::Client;
///
/// # async fn example() -> Result<(), hopcall::Error> {
/// let client = Client::builder().build()?;
/// let context = client.get("http://example.com/")?.execute().await?;
///
/// let response = context.wait().await?;
/// println!("{} after {} redirects", response.status, context.redirect_count());
/// for cookie in context.cookies() {
///     println!("cookie {}", cookie);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

impl RequestContext {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                redirect_count: AtomicUsize::new(0),
                cookies: Mutex::new(Vec::new()),
                slot: Mutex::new(Slot::default()),
                done: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// A process-unique identifier for this call, used in log output.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns `true` if both handles refer to the same logical call.
    pub fn same_call(&self, other: &RequestContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of redirects followed so far.
    pub fn redirect_count(&self) -> usize {
        self.inner.redirect_count.load(Ordering::Acquire)
    }

    /// Cookies accumulated across all hops, in arrival order.
    pub fn cookies(&self) -> Vec<Cookie> {
        lock(&self.inner.cookies).clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        match self.slot().visible() {
            None => State::Pending,
            Some(Ok(_)) => State::Succeeded,
            Some(Err(_)) => State::Failed,
        }
    }

    /// Returns `true` once the call has succeeded or failed.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_succeeded(&self) -> bool {
        self.state() == State::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.state() == State::Failed
    }

    /// The final response, once the call has succeeded.
    pub fn response(&self) -> Option<Arc<FullResponse>> {
        match self.slot().visible() {
            Some(Ok(response)) => Some(response.clone()),
            _ => None,
        }
    }

    /// The failure reason, once the call has failed.
    pub fn failure(&self) -> Option<Failure> {
        match self.slot().visible() {
            Some(Err(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    /// Polls for the terminal result without waiting.
    pub fn try_result(&self) -> Option<Result<Arc<FullResponse>>> {
        self.slot()
            .visible()
            .map(|outcome| outcome.clone().map_err(Error::Failed))
    }

    /// Waits asynchronously for the terminal result.
    pub async fn wait(&self) -> Result<Arc<FullResponse>> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until the call finishes or `timeout` passes.
    ///
    /// Returns `None` on timeout. Never call this from inside an async
    /// worker; use [`RequestContext::wait`] there.
    pub fn wait_blocking(&self, timeout: Duration) -> Option<Result<Arc<FullResponse>>> {
        let slot = self.slot();
        let (slot, _) = self
            .inner
            .done
            .wait_timeout_while(slot, timeout, |slot| slot.visible().is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.visible()
            .map(|outcome| outcome.clone().map_err(Error::Failed))
    }

    /// Registers a hook that runs exactly once with the terminal result.
    ///
    /// If the call is already finished the hook runs immediately. A panic
    /// inside the hook is caught and logged.
    pub fn on_complete<F>(&self, hook: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        let mut slot = self.slot();
        match slot.visible().cloned() {
            Some(outcome) => {
                drop(slot);
                self.run_hook(Box::new(hook), &outcome);
            }
            None => slot.hooks.push(Box::new(hook)),
        }
    }

    #[cfg(test)]
    /// Marks the call succeeded and publishes it. Returns `false` if it was
    /// already terminal.
    pub(crate) fn succeed(&self, response: Arc<FullResponse>) -> bool {
        self.settle(Ok(response)).is_some()
    }

    /// Marks the call failed and publishes it. Returns `false` if it was
    /// already terminal.
    pub(crate) fn fail(&self, failure: Failure) -> bool {
        self.settle(Err(failure)).is_some()
    }

    /// Records the terminal outcome without publishing it. Returns `None` if
    /// the call was already terminal; otherwise the transition is published
    /// when the returned guard is dropped.
    pub(crate) fn settle(&self, outcome: Completion) -> Option<Settled> {
        let mut slot = self.slot();
        if slot.outcome.is_some() {
            tracing::debug!(context = self.id(), "ignoring repeated completion");
            return None;
        }
        slot.outcome = Some(outcome);
        Some(Settled {
            context: self.clone(),
        })
    }

    /// Counts a followed redirect. Returns the new count, or `None` if the
    /// call is already terminal.
    pub(crate) fn record_redirect(&self) -> Option<usize> {
        let slot = self.slot();
        if slot.outcome.is_some() {
            return None;
        }
        let count = self.inner.redirect_count.fetch_add(1, Ordering::AcqRel) + 1;
        drop(slot);
        Some(count)
    }

    pub(crate) fn add_cookie(&self, cookie: Cookie) {
        lock(&self.inner.cookies).push(cookie);
    }

    fn publish(&self) {
        let (outcome, hooks) = {
            let mut slot = self.slot();
            let outcome = match &slot.outcome {
                Some(outcome) if !slot.published => outcome.clone(),
                _ => return,
            };
            slot.published = true;
            (outcome, std::mem::take(&mut slot.hooks))
        };
        self.inner.done.notify_all();
        self.inner.notify.notify_waiters();
        for hook in hooks {
            self.run_hook(hook, &outcome);
        }
    }

    fn run_hook(&self, hook: CompletionHook, outcome: &Completion) {
        if let Err(message) = shielded(|| hook(outcome)) {
            tracing::warn!(context = self.id(), panic = %message, "completion hook panicked");
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        lock(&self.inner.slot)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("redirect_count", &self.redirect_count())
            .finish()
    }
}

/// A recorded but unpublished terminal transition.
///
/// Dropping it publishes the transition: waiters wake and completion hooks
/// run.
#[must_use = "the transition is published when this guard is dropped"]
pub(crate) struct Settled {
    context: RequestContext,
}

impl Drop for Settled {
    fn drop(&mut self) {
        self.context.publish();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single-shot future resolving to a transformed final response.
///
/// Returned by [`RequestBuilder::execute_with`](crate::RequestBuilder::execute_with).
/// It settles once, at the moment its [`RequestContext`] reaches a terminal
/// state.
pub struct ResponseFuture<T> {
    context: RequestContext,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> ResponseFuture<T> {
    pub(crate) fn new<F>(context: RequestContext, transform: F) -> Self
    where
        F: FnOnce(&FullResponse) -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        context.on_complete(move |outcome| {
            let result = match outcome {
                Ok(response) => shielded(|| transform(response)).map_err(|message| {
                    Error::Failed(Failure::Transport(format!(
                        "response transform panicked: {}",
                        message
                    )))
                }),
                Err(failure) => Err(Error::Failed(failure.clone())),
            };
            // the receiver may already be gone
            let _ = sender.send(result);
        });
        Self { context, receiver }
    }
}

impl<T> ResponseFuture<T> {
    /// The context of the logical call behind this future.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::Failed(Failure::Transport(
                    "completion hook dropped before the call finished".to_string(),
                )))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};

    fn response(status: u16) -> Arc<FullResponse> {
        Arc::new(FullResponse::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            "body",
            "http://example.com/".parse().unwrap(),
        ))
    }

    #[test]
    fn test_first_transition_wins() {
        let context = RequestContext::new();
        assert_eq!(context.state(), State::Pending);

        assert!(context.fail(Failure::Transport("reset".into())));
        assert!(!context.succeed(response(200)));
        assert!(!context.fail(Failure::ConnectionClosed));

        assert!(context.is_failed());
        assert_eq!(context.failure(), Some(Failure::Transport("reset".into())));
        assert!(context.response().is_none());
    }

    #[test]
    fn test_redirects_only_counted_while_pending() {
        let context = RequestContext::new();
        assert_eq!(context.record_redirect(), Some(1));
        assert_eq!(context.record_redirect(), Some(2));
        context.succeed(response(200));
        assert_eq!(context.record_redirect(), None);
        assert_eq!(context.redirect_count(), 2);
    }

    #[test]
    fn test_hooks_fire_once() {
        let context = RequestContext::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        context.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        context.succeed(response(204));
        context.succeed(response(200));
        context.fail(Failure::ConnectionClosed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // late registration runs immediately
        let counter = fired.clone();
        context.on_complete(move |outcome| {
            assert_eq!(outcome.as_ref().unwrap().status, StatusCode::NO_CONTENT);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_racing_transitions_complete_once() {
        let context = RequestContext::new();
        let wins: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let context = context.clone();
                    scope.spawn(move || {
                        if i % 2 == 0 {
                            context.fail(Failure::ConnectionClosed)
                        } else {
                            context.succeed(response(200))
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(wins, 1);
        assert!(context.is_done());
    }

    #[test]
    fn test_wait_blocking_times_out_while_pending() {
        let context = RequestContext::new();
        assert!(context.wait_blocking(Duration::from_millis(10)).is_none());

        let waiter = context.clone();
        let handle =
            std::thread::spawn(move || waiter.wait_blocking(Duration::from_secs(5)).unwrap());
        context.succeed(response(200));
        let result = handle.join().unwrap().unwrap();
        assert_eq!(result.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_completion() {
        let context = RequestContext::new();
        let completer = context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.fail(Failure::ConnectionClosed);
        });

        match context.wait().await {
            Err(Error::Failed(Failure::ConnectionClosed)) => {}
            other => panic!("Expected ConnectionClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_future_applies_transform() {
        let context = RequestContext::new();
        let future = ResponseFuture::new(context.clone(), |r: &FullResponse| r.status.as_u16());
        context.succeed(response(201));
        assert_eq!(future.await.unwrap(), 201);
    }

    #[test]
    fn test_settled_transition_hidden_until_published() {
        let context = RequestContext::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        context.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let settled = context.settle(Ok(response(200))).unwrap();
        assert!(context.settle(Err(Failure::ConnectionClosed)).is_none());
        assert_eq!(context.state(), State::Pending);
        assert!(context.try_result().is_none());
        assert_eq!(context.record_redirect(), None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(settled);
        assert!(context.is_succeeded());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_does_not_block_others() {
        let context = RequestContext::new();
        let fired = Arc::new(AtomicUsize::new(0));
        context.on_complete(|_| panic!("hook bug"));
        let counter = fired.clone();
        context.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(context.fail(Failure::ConnectionClosed));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(context.is_failed());
    }

    #[tokio::test]
    async fn test_response_future_rejects_panicking_transform() {
        let context = RequestContext::new();
        let future = ResponseFuture::new(context.clone(), |_: &FullResponse| -> u16 {
            panic!("cannot parse body")
        });
        context.succeed(response(200));

        match future.await {
            Err(Error::Failed(Failure::Transport(reason))) => {
                assert!(reason.contains("cannot parse body"))
            }
            other => panic!("Expected transform failure, got {:?}", other),
        }
        assert!(context.is_succeeded());
    }

    #[test]
    fn test_contexts_have_distinct_identity() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert!(!a.same_call(&b));
        assert!(a.same_call(&a.clone()));
        assert_ne!(a.id(), b.id());
    }
}
