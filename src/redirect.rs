//! Redirect policies.
//!
//! A policy looks at a completed response and decides whether the logical
//! call continues to another URL. The follow flag and the redirect limit of
//! the request are enforced before any policy is consulted.

use crate::request::Request;
use crate::response::FullResponse;
use http::header::LOCATION;
use http::StatusCode;
use url::Url;

/// The outcome of a redirect evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Continue the logical call at this URL.
    FollowTo(Url),
    /// Complete the logical call with the current response.
    DoNotFollow,
}

/// Decides whether a response should be followed to another URL.
///
/// # Examples
///
/// ```
/// use hopcall::redirect::{Decision, DefaultRedirectPolicy, RedirectPolicy};
/// use hopcall::{FullResponse, Request};
///
/// /// Follows redirects only while they stay on the same host.
/// struct SameHostOnly;
///
/// impl RedirectPolicy for SameHostOnly {
///     fn decide(&self, response: &FullResponse, request: &Request, count: usize) -> Decision {
///         match DefaultRedirectPolicy.decide(response, request, count) {
///             Decision::FollowTo(url) if url.host_str() == request.url().host_str() => {
///                 Decision::FollowTo(url)
///             }
///             _ => Decision::DoNotFollow,
///         }
///     }
/// }
/// ```
pub trait RedirectPolicy: Send + Sync {
    /// Evaluates `response`, received for `request` after `redirect_count`
    /// followed redirects.
    fn decide(&self, response: &FullResponse, request: &Request, redirect_count: usize)
        -> Decision;
}

/// Follows 301, 302, 303, 307 and 308 responses carrying a usable `Location`.
///
/// Relative locations are resolved against the request URL. Only `http` and
/// `https` targets are followed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRedirectPolicy;

impl RedirectPolicy for DefaultRedirectPolicy {
    fn decide(&self, response: &FullResponse, request: &Request, _redirect_count: usize) -> Decision {
        let followable = matches!(
            response.status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        if !followable {
            return Decision::DoNotFollow;
        }
        let Some(location) = response.header(LOCATION.as_str()) else {
            tracing::debug!(status = response.status.as_u16(), "redirect without location");
            return Decision::DoNotFollow;
        };
        match request.url().join(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Decision::FollowTo(url),
            Ok(url) => {
                tracing::debug!(location = %url, "refusing redirect to unsupported scheme");
                Decision::DoNotFollow
            }
            Err(e) => {
                tracing::debug!(location = %location, error = %e, "invalid redirect location");
                Decision::DoNotFollow
            }
        }
    }
}

/// Applies the request's follow flag and redirect limit, then the policy.
pub(crate) fn evaluate(
    policy: &dyn RedirectPolicy,
    response: &FullResponse,
    request: &Request,
    redirect_count: usize,
) -> Decision {
    if !request.follow_redirect() || redirect_count >= request.max_redirects() {
        return Decision::DoNotFollow;
    }
    policy.decide(response, request, redirect_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Target};
    use http::{HeaderMap, HeaderValue, Method, Version};

    fn request(max_redirects: usize, follow: bool) -> Request {
        let url = Url::parse("http://example.com/a/b").unwrap();
        Request {
            method: Method::GET,
            target: Target::from_url(&url).unwrap(),
            url,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            follow_redirect: follow,
            max_redirects,
            timeout: None,
        }
    }

    fn redirect(status: u16, location: Option<&'static str>) -> FullResponse {
        let mut headers = HeaderMap::new();
        if let Some(location) = location {
            headers.insert(LOCATION, HeaderValue::from_static(location));
        }
        FullResponse::new(
            StatusCode::from_u16(status).unwrap(),
            headers,
            "",
            "http://example.com/a/b".parse().unwrap(),
        )
    }

    #[test]
    fn test_relative_location_is_resolved() {
        let decision = evaluate(
            &DefaultRedirectPolicy,
            &redirect(302, Some("../c?x=1")),
            &request(10, true),
            0,
        );
        assert_eq!(
            decision,
            Decision::FollowTo(Url::parse("http://example.com/c?x=1").unwrap())
        );
    }

    #[test]
    fn test_limit_forces_do_not_follow() {
        let response = redirect(301, Some("/next"));
        let req = request(2, true);
        assert!(matches!(
            evaluate(&DefaultRedirectPolicy, &response, &req, 1),
            Decision::FollowTo(_)
        ));
        assert_eq!(
            evaluate(&DefaultRedirectPolicy, &response, &req, 2),
            Decision::DoNotFollow
        );
    }

    #[test]
    fn test_follow_flag_disables_redirects() {
        let decision = evaluate(
            &DefaultRedirectPolicy,
            &redirect(307, Some("/next")),
            &request(10, false),
            0,
        );
        assert_eq!(decision, Decision::DoNotFollow);
    }

    #[test]
    fn test_non_followable_responses() {
        let req = request(10, true);
        for response in [
            redirect(200, Some("/next")),
            redirect(304, Some("/next")),
            redirect(302, None),
            redirect(302, Some("ftp://example.com/file")),
        ] {
            assert_eq!(
                evaluate(&DefaultRedirectPolicy, &response, &req, 0),
                Decision::DoNotFollow
            );
        }
    }
}
