//! Middleware to authorize outgoing requests with the session's access token
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to send the
//! current access token held by a [`TokenProvider`], usually a
//! [`SessionManager`](tessera_tokens::SessionManager), with each outbound
//! request.
//!
//! If the server answers `401 Unauthorized`, the middleware asks the provider
//! for a refresh exactly once and replays the request once with the new
//! token. A second `401` is handed back to the caller as-is. If the refresh
//! fails, the session has been cleared and the request fails with the
//! refresh error; sending the user back to sign in is up to the caller.
//!
//! If a request already has an `Authorization` header by the time the
//! middleware executes, the existing value is left in place and the
//! response is never treated as a reason to refresh.
//!
//! ```no_run
//! use tessera_reqwest::AccessTokenMiddleware;
//! use tessera_tokens::{SessionConfig, SessionManager};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let config = SessionConfig::new("https://api.example.com".parse()?, "client")?;
//! let session = SessionManager::builder(config, ClientBuilder::new(Client::new()).build())
//!     .build()?;
//! session.init().await?;
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(session.clone()))
//!     .build();
//!
//! let resp = client
//!     .get("https://api.example.com/me")
//!     .send()
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! The middleware can also be configured to add the access token only
//! conditionally. Sharing one middleware stack between several backends is
//! safe when the token is restricted to the API that issued it:
//!
//! ```
//! use tessera_reqwest::{AccessTokenMiddleware, HttpsOnly, SameOrigin};
//! use predicates::prelude::PredicateBooleanExt;
//! # use tessera_tokens::{SessionConfig, SessionManager};
//! # use reqwest_middleware::ClientBuilder;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let config = SessionConfig::new("https://api.example.com".parse()?, "client")?;
//! # let session = SessionManager::builder(config.clone(), ClientBuilder::new(reqwest::Client::new()).build()).build()?;
//!
//! AccessTokenMiddleware::new(session)
//!     .with_predicate(HttpsOnly.and(SameOrigin::of(config.api_base_url())));
//! # Ok(()) }
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

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};
use tessera_tokens::{AccessTokenRef, TokenProvider};
use url::{Origin, Url};

/// A middleware that injects an access token into outgoing requests and
/// recovers once from a rejected token
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<T, P = HttpsOnly> {
    provider: T,
    predicate: P,
}

impl<T> AccessTokenMiddleware<T, HttpsOnly> {
    /// Construct a new middleware from a token provider
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(provider: T) -> Self {
        Self {
            provider,
            predicate: HttpsOnly,
        }
    }
}

impl<T, P> AccessTokenMiddleware<T, P> {
    /// Replaces the predicate deciding which requests carry the token
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<T, Q> {
        AccessTokenMiddleware {
            provider: self.provider,
            predicate,
        }
    }
}

fn bearer(token: &AccessTokenRef) -> Result<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
        .map_err(Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<T, P> Middleware for AccessTokenMiddleware<T, P>
where
    T: TokenProvider + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request already carries authorization");
            return next.run(req, extensions).await;
        }

        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        let Some(token) = self.provider.current_access_token() else {
            tracing::debug!("no access token, sending request without credentials");
            return next.run(req, extensions).await;
        };

        let replay = req.try_clone();
        req.headers_mut()
            .insert(header::AUTHORIZATION, bearer(&token)?);

        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        if !self.provider.can_refresh() {
            tracing::debug!("access token rejected and cannot be refreshed");
            return Ok(resp);
        }

        let Some(mut replay) = replay else {
            tracing::debug!("access token rejected, but the request body cannot be replayed");
            return Ok(resp);
        };

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "access token rejected, refreshing"
        );
        drop(resp);

        let tokens = self
            .provider
            .refresh_if_possible(&token)
            .await
            .map_err(Error::middleware)?;

        replay
            .headers_mut()
            .insert(header::AUTHORIZATION, bearer(tokens.access_token())?);

        tracing::trace!("replaying request with refreshed access token");
        next.run(replay, extensions).await
    }
}

/// Only attach an access token if the request is being sent over HTTPS
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

/// Only attach an access token if the request is being sent to the same
/// origin (scheme, host, and port) as the given URL
#[derive(Clone, Debug)]
pub struct SameOrigin {
    origin: Origin,
}

impl SameOrigin {
    /// Construct a new predicate matching the origin of `url`
    pub fn of(url: &Url) -> Self {
        Self {
            origin: url.origin(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        self.origin.is_tuple() && req.url().origin() == self.origin
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("origin == ")?;
        f.write_str(&self.origin.ascii_serialization())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use tessera_tokens::{AccessToken, SessionError, TokenSet};

    use super::*;

    const FIRST_TOKEN: &str = "first-access-token";
    const SECOND_TOKEN: &str = "second-access-token";

    /// Stands in for a session, handing out tokens from a fixed sequence
    #[derive(Default)]
    struct FakeProvider {
        current: Mutex<Option<AccessToken>>,
        next: Option<&'static str>,
        refreshes: AtomicUsize,
    }

    impl FakeProvider {
        fn holding(token: &str) -> Self {
            Self {
                current: Mutex::new(Some(AccessToken::from(token))),
                ..Self::default()
            }
        }

        fn refreshing_to(mut self, token: &'static str) -> Self {
            self.next = Some(token);
            self
        }

        fn refreshes(&self) -> usize {
            self.refreshes.load(Ordering::Acquire)
        }
    }

    #[async_trait::async_trait]
    impl TokenProvider for FakeProvider {
        type Error = SessionError;

        fn current_access_token(&self) -> Option<AccessToken> {
            self.current.lock().unwrap().clone()
        }

        fn can_refresh(&self) -> bool {
            self.current.lock().unwrap().is_some()
        }

        async fn refresh_if_possible(
            &self,
            _: &AccessTokenRef,
        ) -> std::result::Result<TokenSet, SessionError> {
            self.refreshes.fetch_add(1, Ordering::AcqRel);
            let Some(next) = self.next else {
                *self.current.lock().unwrap() = None;
                return Err(SessionError::MissingRefreshToken);
            };

            *self.current.lock().unwrap() = Some(AccessToken::from(next));
            Ok(TokenSet::new(next, "id-token", "refresh-token").unwrap())
        }
    }

    /// Plays the API: rejects listed tokens, accepts everything else
    #[derive(Default)]
    struct Api {
        rejects: Vec<String>,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl Api {
        fn rejecting(tokens: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                rejects: tokens.iter().map(|&t| t.to_owned()).collect(),
                ..Self::default()
            })
        }

        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Api {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .map(|v| {
                    v.to_str()
                        .expect("authorization header was not valid UTF-8")
                        .to_owned()
                });

            let rejected = authorization.as_deref().is_some_and(|auth| {
                self.rejects
                    .iter()
                    .any(|t| auth == format!("Bearer {t}"))
            });
            self.seen.lock().unwrap().push(authorization);

            let status = if rejected {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::OK
            };
            Ok(http::Response::builder()
                .status(status)
                .body("")
                .unwrap()
                .into())
        }
    }

    fn client<T, P>(
        middleware: AccessTokenMiddleware<T, P>,
        api: &Arc<Api>,
    ) -> reqwest_middleware::ClientWithMiddleware
    where
        T: TokenProvider + 'static,
        P: Predicate<Request> + Send + Sync + 'static,
    {
        ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(api.clone())
            .build()
    }

    fn bearer_of(token: &str) -> Option<String> {
        Some(format!("Bearer {token}"))
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_on_https_request() {
            let api = Api::rejecting(&[]);
            let middleware = AccessTokenMiddleware::new(FakeProvider::holding(FIRST_TOKEN));
            let client = client(middleware, &api);

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(api.seen(), vec![bearer_of(FIRST_TOKEN)]);
        }

        #[tokio::test]
        async fn middleware_with_defaults_does_not_attach_token_on_http_request() {
            let api = Api::rejecting(&[]);
            let middleware = AccessTokenMiddleware::new(FakeProvider::holding(FIRST_TOKEN));
            let client = client(middleware, &api);

            client.get("http://example.com").send().await.unwrap();

            assert_eq!(api.seen(), vec![None]);
        }

        #[tokio::test]
        async fn middleware_without_a_token_sends_no_credentials() {
            let api = Api::rejecting(&[]);
            let client = client(AccessTokenMiddleware::new(FakeProvider::default()), &api);

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(api.seen(), vec![None]);
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token() {
                let api = Api::rejecting(&[]);
                let middleware = AccessTokenMiddleware::new(FakeProvider::holding(FIRST_TOKEN))
                    .with_predicate(predicate::never());
                let client = client(middleware, &api);

                client.get("https://example.com").send().await.unwrap();

                assert_eq!(api.seen(), vec![None]);
            }
        }

        mod and_the_token_is_rejected {
            use super::*;

            #[tokio::test]
            async fn middleware_refreshes_once_and_replays() {
                let api = Api::rejecting(&[FIRST_TOKEN]);
                let provider =
                    Arc::new(FakeProvider::holding(FIRST_TOKEN).refreshing_to(SECOND_TOKEN));
                let client = client(AccessTokenMiddleware::new(provider.clone()), &api);

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), StatusCode::OK);
                assert_eq!(provider.refreshes(), 1);
                assert_eq!(
                    api.seen(),
                    vec![bearer_of(FIRST_TOKEN), bearer_of(SECOND_TOKEN)]
                );
            }

            #[tokio::test]
            async fn middleware_returns_a_second_rejection_as_is() {
                let api = Api::rejecting(&[FIRST_TOKEN, SECOND_TOKEN]);
                let provider =
                    Arc::new(FakeProvider::holding(FIRST_TOKEN).refreshing_to(SECOND_TOKEN));
                let client = client(AccessTokenMiddleware::new(provider.clone()), &api);

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
                assert_eq!(provider.refreshes(), 1);
                assert_eq!(api.seen().len(), 2);
            }

            #[tokio::test]
            async fn middleware_surfaces_a_failed_refresh() {
                let api = Api::rejecting(&[FIRST_TOKEN]);
                let provider = Arc::new(FakeProvider::holding(FIRST_TOKEN));
                let client = client(AccessTokenMiddleware::new(provider.clone()), &api);

                let err = client.get("https://example.com").send().await.unwrap_err();

                assert!(matches!(err, Error::Middleware(_)));
                assert_eq!(provider.refreshes(), 1);
                assert_eq!(api.seen().len(), 1);
            }

            #[tokio::test]
            async fn middleware_does_not_replay_a_streaming_body() {
                let api = Api::rejecting(&[FIRST_TOKEN]);
                let provider =
                    Arc::new(FakeProvider::holding(FIRST_TOKEN).refreshing_to(SECOND_TOKEN));
                let client = client(AccessTokenMiddleware::new(provider.clone()), &api);

                let body = reqwest::Body::wrap_stream(futures_util::stream::once(async {
                    Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"{}"))
                }));
                let resp = client
                    .post("https://example.com")
                    .body(body)
                    .send()
                    .await
                    .unwrap();

                assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
                assert_eq!(provider.refreshes(), 0);
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            // Reqwest uses a capital `B` bearer
            const BEARER_OVERRIDE_TOKEN: &str = "Bearer overridden!";

            let api = Api::rejecting(&[]);
            let middleware = AccessTokenMiddleware::new(FakeProvider::holding(FIRST_TOKEN));
            let client = client(middleware, &api);

            client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(api.seen(), vec![Some(BEARER_OVERRIDE_TOKEN.to_owned())]);
        }

        #[tokio::test]
        async fn middleware_does_not_refresh_on_rejection() {
            let api = Api::rejecting(&["overridden!"]);
            let provider =
                Arc::new(FakeProvider::holding(FIRST_TOKEN).refreshing_to(SECOND_TOKEN));
            let client = client(AccessTokenMiddleware::new(provider.clone()), &api);

            let resp = client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(provider.refreshes(), 0);
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let predicate = HttpsOnly;
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let predicate = HttpsOnly;
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }

    mod same_origin_predicate {
        use super::*;

        fn api_origin() -> SameOrigin {
            SameOrigin::of(&"https://api.example.com/dev/".parse().unwrap())
        }

        #[test]
        fn matches_any_path_on_the_same_origin() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://api.example.com/other/path".parse().unwrap(),
            );
            let predicate = api_origin();
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_another_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://cdn.example.com/dev/".parse().unwrap(),
            );
            let predicate = api_origin();
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_another_port() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://api.example.com:8443/dev/".parse().unwrap(),
            );
            let predicate = api_origin();
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }

    mod with_a_session_manager {
        use serde_json::json;
        use tessera_clock::{TestClock, UnixTime};
        use tessera_jwt::testing::forge_unsigned;
        use tessera_tokens::{store::MemoryTokenStore, SessionConfig, SessionManager};

        use super::*;

        const NOW: UnixTime = UnixTime(1_700_000_000);

        fn access_token(jti: &str) -> String {
            forge_unsigned(&json!({ "exp": NOW.0 + 600, "jti": jti }))
        }

        /// Plays the auth backend's refresh endpoint
        struct RefreshEndpoint {
            issues: String,
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl Middleware for RefreshEndpoint {
            async fn handle(
                &self,
                req: Request,
                _: &mut http::Extensions,
                _: Next<'_>,
            ) -> Result<Response> {
                assert!(req.url().path().ends_with("/auth/token/refresh"));
                self.calls.fetch_add(1, Ordering::AcqRel);

                let body = json!({
                    "accessToken": self.issues,
                    "idToken": forge_unsigned(&json!({ "email": "ada@example.com" })),
                });
                Ok(http::Response::builder()
                    .status(StatusCode::OK)
                    .body(body.to_string())
                    .unwrap()
                    .into())
            }
        }

        async fn session_holding(first: &str, backend: &Arc<RefreshEndpoint>) -> SessionManager {
            let id_claims = json!({ "email": "ada@example.com" });
            let store = MemoryTokenStore::with_record(record(first, &id_claims));
            session_over(store, backend).await
        }

        fn record(access: &str, id_claims: &serde_json::Value) -> String {
            json!({
                "accessToken": access,
                "idToken": forge_unsigned(id_claims),
                "refreshToken": "refresh-token",
            })
            .to_string()
        }

        async fn session_over(
            store: MemoryTokenStore,
            backend: &Arc<RefreshEndpoint>,
        ) -> SessionManager {
            let config =
                SessionConfig::new("https://api.example.com/".parse().unwrap(), "client").unwrap();
            let backend_client = ClientBuilder::new(Client::default())
                .with_arc(backend.clone())
                .build();

            let session = SessionManager::builder(config, backend_client)
                .with_store(store)
                .with_clock(TestClock::new(NOW))
                .build()
                .unwrap();
            session.init().await.unwrap();
            session
        }

        #[tokio::test]
        async fn rejected_token_is_refreshed_once_and_the_request_replayed() {
            let (first, second) = (access_token("first"), access_token("second"));
            let backend = Arc::new(RefreshEndpoint {
                issues: second.clone(),
                calls: AtomicUsize::new(0),
            });
            let session = session_holding(&first, &backend).await;
            let api = Api::rejecting(&[first.as_str()]);
            let client = client(AccessTokenMiddleware::new(session.clone()), &api);

            let resp = client
                .get("https://api.example.com/me")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.calls.load(Ordering::Acquire), 1);
            assert_eq!(api.seen(), vec![bearer_of(&first), bearer_of(&second)]);
            assert_eq!(
                session.current_access_token().as_deref().map(AccessTokenRef::as_str),
                Some(second.as_str())
            );
        }

        #[tokio::test]
        async fn rejected_token_without_a_known_user_ends_the_session() {
            let first = access_token("first");
            let backend = Arc::new(RefreshEndpoint {
                issues: access_token("second"),
                calls: AtomicUsize::new(0),
            });
            let store = MemoryTokenStore::with_record(record(&first, &json!({ "sub": "u" })));
            let session = session_over(store.clone(), &backend).await;
            let api = Api::rejecting(&[first.as_str()]);
            let client = client(AccessTokenMiddleware::new(session.clone()), &api);

            let err = client
                .get("https://api.example.com/me")
                .send()
                .await
                .unwrap_err();

            assert!(matches!(err, Error::Middleware(_)));
            assert_eq!(backend.calls.load(Ordering::Acquire), 0);
            assert_eq!(api.seen(), vec![bearer_of(&first)]);
            assert!(!session.is_authenticated());
            assert!(session.current_access_token().is_none());
            assert!(session.last_error().is_some());
            assert!(!store.contains_record());
        }
    }
}
