//! Middleware that keeps outgoing requests authenticated
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include a [`SessionAuthMiddleware`] in the middleware stack to attach the
//! session's bearer credential to each outbound request. The middleware is
//! the session's request interceptor: a request that finds the credential
//! expired triggers a single renewal, requests arriving while that renewal
//! is in flight wait for its outcome, and a failed renewal aborts every
//! governed request with the classified error instead of dispatching it
//! unauthenticated.
//!
//! If a request already specifies a value for the configured header by the
//! time the middleware executes, the existing value is left in place, so
//! per-request overrides always win.
//!
//! ```
//! use bearward::{ConstTokenAuthority, SessionBuilder};
//! use bearward_reqwest::SessionAuthMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let session = SessionBuilder::new(ConstTokenAuthority::new("token"))
//!     .start()
//!     .await;
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(SessionAuthMiddleware::new(session))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # let _ = req;
//! # }
//! ```
//!
//! By default the credential is attached to every request: the point of the
//! session is that nothing goes out unauthenticated. Attachment can be
//! narrowed with a predicate, for example to keep bearer tokens off
//! plaintext connections or away from third-party hosts. Predicates compose
//! through the usual combinators.
//!
//! ```
//! use bearward::{ConstTokenAuthority, SessionBuilder};
//! use bearward_reqwest::{HostEquals, HttpsOnly, SessionAuthMiddleware};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let session = SessionBuilder::new(ConstTokenAuthority::new("token")).start().await;
//! SessionAuthMiddleware::new(session)
//!     .with_predicate(HttpsOnly.and(HostEquals::new("api.example.com")));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use aliri_clock::{Clock, System};
use bearward::{AccessTokenRef, RefreshError, Session, TokenAuthority};
use bytes::{BufMut, BytesMut};
use http::Extensions;
use predicates::constant::BooleanPredicate;
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// A middleware that injects the session's credential into outgoing requests
///
/// One `handle` invocation is one pass through the session's request
/// interceptor: the middleware obtains a token that is valid right now
/// (renewing it if necessary, or waiting on an in-flight renewal if one is
/// already running) and attaches it under the session's configured header.
pub struct SessionAuthMiddleware<A, C = System, P = BooleanPredicate> {
    session: Session<A, C>,
    header_name: header::HeaderName,
    predicate: P,
}

impl<A, C> SessionAuthMiddleware<A, C, BooleanPredicate> {
    /// Constructs middleware that attaches the credential to every request
    ///
    /// To attach only conditionally, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    ///
    /// # Panics
    ///
    /// Panics if the session's configured header name is not a valid HTTP
    /// header name.
    pub fn new(session: Session<A, C>) -> Self {
        let header_name = header::HeaderName::from_bytes(session.header_name().as_bytes())
            .expect("configured header name must be a valid HTTP header name");
        Self {
            session,
            header_name,
            predicate: predicates::constant::always(),
        }
    }
}

impl<A, C, P> SessionAuthMiddleware<A, C, P> {
    /// Replaces the attachment predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> SessionAuthMiddleware<A, C, Q> {
        SessionAuthMiddleware {
            session: self.session,
            header_name: self.header_name,
            predicate,
        }
    }

    fn header_value(&self, token: &AccessTokenRef) -> Result<header::HeaderValue> {
        let rendered = self.session.format_token(token);
        let mut buf = BytesMut::with_capacity(rendered.len());
        buf.put_slice(rendered.as_bytes());
        let mut value =
            header::HeaderValue::from_maybe_shared(buf.freeze()).map_err(Error::middleware)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl<A, C, P> fmt::Debug for SessionAuthMiddleware<A, C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthMiddleware")
            .field("session", &self.session)
            .field("header_name", &self.header_name)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<A, C, P> Middleware for SessionAuthMiddleware<A, C, P>
where
    A: TokenAuthority + 'static,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        if req.headers().contains_key(&self.header_name) {
            tracing::trace!("request already carries the auth header; leaving it in place");
            return next.run(req, extensions).await;
        }

        let token = self
            .session
            .valid_token()
            .await
            .map_err(|source| Error::middleware(RequestRefreshError { source }))?;

        let value = self.header_value(&token)?;
        req.headers_mut().insert(self.header_name.clone(), value);

        next.run(req, extensions).await
    }
}

/// The classified renewal failure that aborted a request
///
/// Raised instead of dispatching a request whose governing token renewal
/// failed; the message carries the underlying cause.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unable to refresh access token for request: {source}")]
pub struct RequestRefreshError {
    source: RefreshError,
}

impl RequestRefreshError {
    /// The classified refresh failure that caused the abort
    pub fn refresh_error(&self) -> &RefreshError {
        &self.source
    }
}

/// Only attach the credential if the request is being sent over HTTPS
///
/// Keeps bearer tokens off plaintext connections.
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}

impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach the credential if the request targets the exact host given
#[derive(Clone, Debug)]
pub struct HostEquals {
    host: String,
}

impl HostEquals {
    /// Constructs a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for HostEquals {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<value not valid utf-8>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HostEquals {}

impl fmt::Display for HostEquals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use bearward::{AccessToken, AuthorityError, ConstTokenAuthority, SessionBuilder};
    use futures::future::join_all;
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_secs()
    }

    /// An unsigned compact-form token carrying only an `exp` claim
    fn unsigned_token(exp: u64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{claims}.sig")
    }

    /// Terminal middleware asserting the exact value of one header
    struct HeaderChecker {
        name: header::HeaderName,
        expected: String,
        checked: AtomicBool,
    }

    impl HeaderChecker {
        fn bearer(expected: impl Into<String>) -> Self {
            Self::header(header::AUTHORIZATION, expected)
        }

        fn header(name: header::HeaderName, expected: impl Into<String>) -> Self {
            Self {
                name,
                expected: expected.into(),
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for HeaderChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let value = req
                .headers()
                .get(&self.name)
                .expect("expected auth header was not attached")
                .to_str()
                .expect("auth header was not valid UTF-8");

            assert_eq!(value, self.expected);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::new("").into())
        }
    }

    /// Terminal middleware asserting one header is absent
    struct AbsentHeaderChecker {
        name: header::HeaderName,
        checked: AtomicBool,
    }

    impl AbsentHeaderChecker {
        fn new(name: header::HeaderName) -> Self {
            Self {
                name,
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for AbsentHeaderChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(&self.name), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::new("").into())
        }
    }

    mod when_the_session_holds_a_valid_credential {
        use super::*;

        #[tokio::test]
        async fn the_bearer_token_is_attached() {
            let token = unsigned_token(unix_now() + 3_600);
            let session = SessionBuilder::new(ConstTokenAuthority::new(token.clone()))
                .start()
                .await;

            let checker = Arc::new(HeaderChecker::bearer(format!("Bearer {token}")));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session))
                .with_arc(checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn an_explicit_authorization_header_wins() {
            let token = unsigned_token(unix_now() + 3_600);
            let session = SessionBuilder::new(ConstTokenAuthority::new(token))
                .start()
                .await;

            let checker = Arc::new(HeaderChecker::bearer("Bearer overridden!"));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session))
                .with_arc(checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn a_custom_header_name_and_format_are_respected() {
            let token = unsigned_token(unix_now() + 3_600);
            let session = SessionBuilder::new(ConstTokenAuthority::new(token.clone()))
                .with_header_name("x-api-key")
                .with_header_format(|token| format!("Key {}", token.as_str()))
                .start()
                .await;

            let name = header::HeaderName::from_static("x-api-key");
            let checker = Arc::new(HeaderChecker::header(name, format!("Key {token}")));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session))
                .with_arc(checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }
    }

    mod when_the_predicate_declines {
        use super::*;

        #[tokio::test]
        async fn nothing_is_attached() {
            let token = unsigned_token(unix_now() + 3_600);
            let session = SessionBuilder::new(ConstTokenAuthority::new(token))
                .start()
                .await;

            let checker = Arc::new(AbsentHeaderChecker::new(header::AUTHORIZATION));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session).with_predicate(predicate::never()))
                .with_arc(checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn https_only_skips_plaintext_requests() {
            let token = unsigned_token(unix_now() + 3_600);
            let session = SessionBuilder::new(ConstTokenAuthority::new(token))
                .start()
                .await;

            let checker = Arc::new(AbsentHeaderChecker::new(header::AUTHORIZATION));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session).with_predicate(HttpsOnly))
                .with_arc(checker.clone())
                .build();

            let resp = client.get("http://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }
    }

    mod when_the_credential_is_expired {
        use super::*;

        /// First call (initialization) yields an expired token; later calls
        /// yield the fresh one, after a pause that widens the race window.
        struct TwoPhaseAuthority {
            stale: AccessToken,
            fresh: AccessToken,
            refresh_calls: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl bearward::TokenAuthority for TwoPhaseAuthority {
            type Credentials = ();

            async fn login(&self, _: ()) -> std::result::Result<AccessToken, AuthorityError> {
                Ok(self.fresh.clone())
            }

            async fn logout(&self) -> std::result::Result<(), AuthorityError> {
                Ok(())
            }

            async fn refresh(&self) -> std::result::Result<AccessToken, AuthorityError> {
                let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(if call == 0 {
                    self.stale.clone()
                } else {
                    self.fresh.clone()
                })
            }
        }

        #[tokio::test(start_paused = true)]
        async fn concurrent_requests_share_one_refresh() {
            let fresh = unsigned_token(unix_now() + 3_600);
            let refresh_calls = Arc::new(AtomicUsize::new(0));
            let authority = TwoPhaseAuthority {
                stale: AccessToken::new(unsigned_token(unix_now().saturating_sub(3_600))),
                fresh: AccessToken::new(fresh.clone()),
                refresh_calls: refresh_calls.clone(),
            };

            let session = SessionBuilder::new(authority).start().await;
            assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);

            let checker = Arc::new(HeaderChecker::bearer(format!("Bearer {fresh}")));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session))
                .with_arc(checker.clone())
                .build();

            let responses = join_all(
                (0..5).map(|_| client.get("https://example.com").send()),
            )
            .await;

            for resp in responses {
                assert_eq!(resp.unwrap().status(), http::StatusCode::OK);
            }
            assert_eq!(refresh_calls.load(Ordering::SeqCst), 2);
            assert!(checker.checked.load(Ordering::Acquire));
        }
    }

    mod when_the_refresh_fails {
        use super::*;

        /// An authority whose refreshes always fail
        struct BrokenAuthority;

        #[async_trait::async_trait]
        impl bearward::TokenAuthority for BrokenAuthority {
            type Credentials = ();

            async fn login(&self, _: ()) -> std::result::Result<AccessToken, AuthorityError> {
                Err(AuthorityError::new("boom"))
            }

            async fn logout(&self) -> std::result::Result<(), AuthorityError> {
                Ok(())
            }

            async fn refresh(&self) -> std::result::Result<AccessToken, AuthorityError> {
                Err(AuthorityError::new("boom"))
            }
        }

        #[tokio::test]
        async fn the_request_is_aborted_with_the_classified_cause() {
            let session = SessionBuilder::new(BrokenAuthority).start().await;
            assert!(!session.is_authenticated());

            let checker = Arc::new(AbsentHeaderChecker::new(header::AUTHORIZATION));
            let client = ClientBuilder::new(Client::default())
                .with(SessionAuthMiddleware::new(session))
                .with_arc(checker.clone())
                .build();

            let error = client
                .get("https://example.com")
                .send()
                .await
                .expect_err("request should abort before dispatch");

            let message = error.to_string();
            assert!(message.contains("unable to refresh access token"), "{message}");
            assert!(message.contains("boom"), "{message}");
            // the request never reached the transport
            assert!(!checker.checked.load(Ordering::Acquire));
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let result = HttpsOnly.find_case(true, &request);
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let result = HttpsOnly.find_case(false, &request);
            assert!(result.is_none())
        }
    }

    mod host_equals_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_same_host() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let predicate = HostEquals::new("example.com");
            let result = predicate.find_case(true, &request);
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://does-not-match.com".parse().unwrap(),
            );
            let predicate = HostEquals::new("example.com");
            let result = predicate.find_case(false, &request);
            assert!(result.is_none())
        }
    }
}
