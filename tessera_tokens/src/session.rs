//! The session state machine
//!
//! A [`SessionManager`] owns the session's tokens for the lifetime of the
//! process. It recovers a session from its [`TokenStore`] at start-up, drives
//! the authorization-code login, refreshes tokens on demand, and tears the
//! session down on logout or when a refresh fails.
//!
//! ```text
//! Unauthenticated ──begin_login──▶ Authenticating ──complete_login──▶ Authenticated
//!        ▲                                                              │     ▲
//!        │                                                       refresh│     │
//!        └──────────── logout / refresh failure ◀── Refreshing ◀───────┘─────┘
//! ```
//!
//! State is published through a [`tokio::sync::watch`] channel. Reads are
//! short borrows, and [`SessionManager::subscribe()`] hands out a
//! [`SessionWatcher`] for code that wants to react to changes.

use std::{error::Error as StdError, fmt, ops, sync::Arc};

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use tessera_clock::{Clock, System};
use tessera_jwt::UnverifiedClaims;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use url::Url;

use crate::{
    backend::{AuthBackend, BackendError},
    store::{MemoryTokenStore, TokenStore, TokenStoreError},
    AccessToken, AccessTokenRef, AuthorizationCodeRef, ConfigError, IncompleteTokenSet,
    SessionConfig, TokenProvider, TokenSet,
};

/// Where the session is in its lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// No usable session
    #[default]
    Unauthenticated,
    /// A login has been started and has not yet settled
    Authenticating,
    /// Tokens were validated or freshly issued
    Authenticated,
    /// The tokens are being exchanged for new ones
    Refreshing,
}

/// A snapshot of the session
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    tokens: Option<TokenSet>,
    user: Option<UnverifiedClaims>,
    authenticated: bool,
    status: SessionStatus,
    in_flight: usize,
    last_error: Option<String>,
    epoch: u64,
}

impl SessionState {
    /// The current token set, if any
    #[inline]
    pub fn tokens(&self) -> Option<&TokenSet> {
        self.tokens.as_ref()
    }

    /// The signed-in user's claims, decoded from the ID token
    ///
    /// These claims are unverified and fit only for display and for
    /// correlating a refresh with an account.
    #[inline]
    pub fn user(&self) -> Option<&UnverifiedClaims> {
        self.user.as_ref()
    }

    /// Whether the tokens were validated or freshly issued
    ///
    /// This reflects the last check. An access token that has expired since
    /// is discovered the next time it is used.
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether any auth operation is in flight
    #[inline]
    pub fn is_loading(&self) -> bool {
        self.in_flight > 0
    }

    /// The failure of the most recent operation, if it failed
    #[inline]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The lifecycle status
    #[inline]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether an access token is held
    #[inline]
    pub fn has_access_token(&self) -> bool {
        self.tokens.is_some()
    }
}

/// An error from a session operation
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is misconfigured
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The auth backend call failed
    #[error("auth backend request failed")]
    Backend(#[from] BackendError),

    /// The authorization URL handed out by the backend was refused
    #[error("authorization URL refused: {0}")]
    InvalidAuthUrl(&'static str),

    /// There is no refresh token to exchange
    #[error("no refresh token available")]
    MissingRefreshToken,

    /// The user's email, needed to correlate a refresh, is unknown
    #[error("no user identity available to correlate the refresh")]
    MissingIdentity,

    /// The backend issued tokens that do not make a complete set
    #[error("auth backend issued an incomplete token set")]
    Incomplete(#[from] IncompleteTokenSet),

    /// The token store could not be read
    #[error("unable to access the token store")]
    Store(#[from] TokenStoreError),

    /// The session changed while the operation was in flight, and its
    /// result was discarded
    #[error("session changed while the operation was in flight")]
    Superseded,
}

/// Sends the user agent to the identity provider
///
/// Closures taking a `&Url` are redirectors.
pub trait Redirector: Send + Sync {
    /// Navigates to `url`
    fn redirect(&self, url: &Url);
}

impl<F> Redirector for F
where
    F: Fn(&Url) + Send + Sync,
{
    fn redirect(&self, url: &Url) {
        self(url)
    }
}

/// A redirector that only logs where the user should go
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRedirect;

impl Redirector for LogRedirect {
    fn redirect(&self, url: &Url) {
        tracing::info!(%url, "continue sign-in at the identity provider");
    }
}

/// An outstanding borrow of the session state
///
/// Hold this as briefly as possible; outstanding borrows block updates.
#[derive(Debug)]
pub struct BorrowedState<'a> {
    inner: watch::Ref<'a, SessionState>,
}

impl<'a> ops::Deref for BorrowedState<'a> {
    type Target = SessionState;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// The session manager was dropped and no further changes will be published
#[derive(Clone, Copy, Debug, Error)]
#[error("session manager has been dropped")]
pub struct SessionClosed;

/// A read-only view of the session that can await changes
#[derive(Clone, Debug)]
pub struct SessionWatcher {
    rx: watch::Receiver<SessionState>,
}

impl SessionWatcher {
    /// Borrows the current state
    pub fn state(&self) -> BorrowedState<'_> {
        BorrowedState {
            inner: self.rx.borrow(),
        }
    }

    /// Waits until the state changes
    ///
    /// # Errors
    ///
    /// Returns an error once the session manager has been dropped.
    pub async fn changed(&mut self) -> Result<(), SessionClosed> {
        self.rx.changed().await.map_err(|_| SessionClosed)
    }
}

/// Builds a [`SessionManager`]
pub struct SessionManagerBuilder {
    config: SessionConfig,
    client: ClientWithMiddleware,
    store: Box<dyn TokenStore>,
    redirector: Box<dyn Redirector>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for SessionManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManagerBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManagerBuilder {
    /// Persists tokens in `store`
    ///
    /// Defaults to a [`MemoryTokenStore`], which does not survive a restart.
    pub fn with_store(mut self, store: impl TokenStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Hands authorization URLs to `redirector`
    ///
    /// Defaults to [`LogRedirect`].
    pub fn with_redirector(mut self, redirector: impl Redirector + 'static) -> Self {
        self.redirector = Box::new(redirector);
        self
    }

    /// Judges token expiry against `clock`
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Constructs the session manager
    ///
    /// The session starts out unauthenticated; call
    /// [`init()`][SessionManager::init()] to recover a persisted session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend endpoints cannot be derived from the
    /// configuration.
    pub fn build(self) -> Result<SessionManager, ConfigError> {
        let backend = AuthBackend::new(self.client, &self.config)?;
        let (state, _) = watch::channel(SessionState::default());

        Ok(SessionManager {
            inner: Arc::new(Inner {
                config: self.config,
                backend,
                store: Mutex::new(self.store),
                refresh_lock: Mutex::new(()),
                state,
                redirector: self.redirector,
                clock: self.clock,
            }),
        })
    }
}

/// The owner of a client-side session
///
/// Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: SessionConfig,
    backend: AuthBackend,
    store: Mutex<Box<dyn TokenStore>>,
    refresh_lock: Mutex<()>,
    state: watch::Sender<SessionState>,
    redirector: Box<dyn Redirector>,
    clock: Arc<dyn Clock + Send + Sync>,
}

/// Marks an operation in flight until dropped
struct Operation<'a> {
    state: &'a watch::Sender<SessionState>,
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        self.state
            .send_modify(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}

impl SessionManager {
    /// Starts building a session manager that talks to the backend through
    /// `client`
    pub fn builder(config: SessionConfig, client: ClientWithMiddleware) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            client,
            store: Box::new(MemoryTokenStore::new()),
            redirector: Box::new(LogRedirect),
            clock: Arc::new(System),
        }
    }

    /// The configuration this session was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Recovers the persisted session, if there is one
    ///
    /// A usable access token restores the session directly. An expired one
    /// is refreshed; if that fails, the session is cleared and the refresh
    /// error returned. A corrupt record is cleared and treated as no session.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<(), SessionError> {
        let _op = self.inner.begin(None);

        let mut store = self.inner.store.lock().await;
        let tokens = match store.load().await {
            Ok(tokens) => tokens,
            Err(TokenStoreError::Corrupt(err)) => {
                tracing::warn!(
                    error = &err as &dyn StdError,
                    "persisted token record is corrupt, clearing"
                );
                self.inner.clear(&mut **store).await;
                None
            }
            Err(err) => return Err(self.inner.fail(err.into())),
        };

        let Some(tokens) = tokens else {
            tracing::debug!("no persisted session");
            return Ok(());
        };

        if tokens.access_token_is_valid_with_clock(&*self.inner.clock) {
            let user = decode_user(&tokens);
            self.inner.state.send_modify(|s| {
                s.tokens = Some(tokens);
                s.user = user;
                s.authenticated = true;
                s.status = SessionStatus::Authenticated;
                s.epoch += 1;
            });
            tracing::info!("restored persisted session");
            return Ok(());
        }

        tracing::debug!("persisted access token has expired, refreshing");
        let user = decode_user(&tokens);
        self.inner.state.send_modify(|s| {
            s.tokens = Some(tokens);
            s.user = user;
            s.authenticated = false;
            s.status = SessionStatus::Refreshing;
            s.epoch += 1;
        });
        drop(store);

        self.refresh().await.map(drop)
    }

    /// Starts a login by sending the user agent to the identity provider
    ///
    /// The backend is asked for the provider's authorization URL. The URL
    /// is only followed if it carries this client's ID and parses; otherwise
    /// nothing happens beyond recording the error. A logout while the
    /// backend is answering makes this return [`SessionError::Superseded`].
    #[tracing::instrument(skip(self))]
    pub async fn begin_login(&self) -> Result<(), SessionError> {
        let _op = self.inner.begin(Some(SessionStatus::Authenticating));
        let epoch = self.inner.epoch();

        let result = self.authorization_url().await;
        if self.inner.epoch() != epoch {
            tracing::debug!("session changed while starting login, not redirecting");
            return Err(SessionError::Superseded);
        }

        match result {
            Ok(url) => {
                tracing::debug!("redirecting to identity provider");
                self.inner.redirector.redirect(&url);
                Ok(())
            }
            Err(err) => {
                self.inner.settle();
                Err(self.inner.fail(err))
            }
        }
    }

    async fn authorization_url(&self) -> Result<Url, SessionError> {
        let client_id = self.inner.config.require_client_id()?;

        let raw = self
            .inner
            .backend
            .authorization_url(client_id)
            .await?
            .ok_or(SessionError::InvalidAuthUrl("backend returned no URL"))?;

        if !raw.contains(client_id.as_str()) {
            return Err(SessionError::InvalidAuthUrl(
                "URL is not for this client",
            ));
        }

        Url::parse(&raw).map_err(|_| SessionError::InvalidAuthUrl("URL does not parse"))
    }

    /// Finishes a login by exchanging the authorization code for tokens
    ///
    /// Codes are single-use; a repeated call with the same code fails at the
    /// backend.
    #[tracing::instrument(skip(self, code))]
    pub async fn complete_login(&self, code: &AuthorizationCodeRef) -> Result<(), SessionError> {
        let _op = self.inner.begin(Some(SessionStatus::Authenticating));
        let epoch = self.inner.epoch();

        let tokens = match self.inner.backend.exchange_code(code).await {
            Ok(tokens) => tokens,
            Err(err) => {
                self.inner.settle();
                return Err(self.inner.fail(err.into()));
            }
        };

        let mut store = self.inner.store.lock().await;
        if self.inner.epoch() != epoch {
            tracing::debug!("session changed during code exchange, discarding tokens");
            return Err(SessionError::Superseded);
        }

        self.inner.install(&mut **store, tokens).await;
        tracing::info!("session established");
        Ok(())
    }

    /// Exchanges the refresh token for new tokens
    ///
    /// Refreshes are serialized. A caller that waited while another refresh
    /// settled gets that refresh's outcome without contacting the backend
    /// again. Any failure clears the session. Nothing is retried.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<TokenSet, SessionError> {
        let observed = self.inner.epoch();
        let _refreshing = self.inner.refresh_lock.lock().await;

        if self.inner.epoch() != observed {
            let state = self.inner.state.borrow();
            match (state.authenticated, &state.tokens) {
                (true, Some(tokens)) => {
                    tracing::debug!("session was refreshed while waiting");
                    return Ok(tokens.clone());
                }
                (_, None) => {
                    tracing::debug!("session was cleared while waiting");
                    return Err(SessionError::MissingRefreshToken);
                }
                _ => {}
            }
        }

        self.refresh_exclusive().await
    }

    /// Performs a refresh; the caller holds the refresh lock
    async fn refresh_exclusive(&self) -> Result<TokenSet, SessionError> {
        let _op = self.inner.begin(Some(SessionStatus::Refreshing));

        let (epoch, current, username) = {
            let state = self.inner.state.borrow();
            (
                state.epoch,
                state.tokens.clone(),
                state
                    .user
                    .as_ref()
                    .and_then(UnverifiedClaims::email)
                    .map(str::to_owned),
            )
        };

        let result = async {
            let current = current.ok_or(SessionError::MissingRefreshToken)?;
            let username = username.ok_or(SessionError::MissingIdentity)?;

            let resp = self
                .inner
                .backend
                .refresh(current.refresh_token(), &username)
                .await?;

            let tokens =
                current.refreshed(resp.access_token, resp.id_token, resp.refresh_token)?;
            Ok::<_, SessionError>(tokens)
        }
        .await;

        let mut store = self.inner.store.lock().await;
        if self.inner.epoch() != epoch {
            match &result {
                Ok(_) => tracing::debug!("session changed during refresh, discarding tokens"),
                Err(err) => tracing::debug!(
                    error = err as &dyn StdError,
                    "session changed during refresh, discarding failure"
                ),
            }
            return Err(SessionError::Superseded);
        }

        match result {
            Ok(tokens) => {
                self.inner.install(&mut **store, tokens.clone()).await;
                tracing::info!("session refreshed");
                Ok(tokens)
            }
            Err(err) => {
                tracing::debug!("refresh failed, clearing session");
                self.inner.clear(&mut **store).await;
                Err(self.inner.fail(err))
            }
        }
    }

    /// Ends the session
    ///
    /// The backend is told the access token is no longer in use, if there is
    /// one. Failing to tell it is logged; the local session is cleared
    /// regardless.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self) {
        let _op = self.inner.begin(None);

        let access_token = self
            .inner
            .state
            .borrow()
            .tokens
            .as_ref()
            .map(|t| t.access_token().to_owned());

        if let Some(access_token) = access_token {
            if let Err(err) = self.inner.backend.logout(&access_token).await {
                tracing::warn!(
                    error = &err as &dyn StdError,
                    "unable to notify backend of logout, clearing local session anyway"
                );
            }
        }

        let mut store = self.inner.store.lock().await;
        self.inner.clear(&mut **store).await;
        tracing::info!("logged out");
    }

    /// Borrows the current state
    ///
    /// Hold this borrow as briefly as possible.
    pub fn state(&self) -> BorrowedState<'_> {
        BorrowedState {
            inner: self.inner.state.borrow(),
        }
    }

    /// The lifecycle status
    pub fn status(&self) -> SessionStatus {
        self.state().status()
    }

    /// The signed-in user's unverified claims
    pub fn user(&self) -> Option<UnverifiedClaims> {
        self.state().user().cloned()
    }

    /// Whether the tokens were validated or freshly issued
    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Whether any auth operation is in flight
    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    /// The failure of the most recent operation, if it failed
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error().map(str::to_owned)
    }

    /// Whether an access token is held
    pub fn has_access_token(&self) -> bool {
        self.state().has_access_token()
    }

    /// A view of the session that can await changes
    pub fn subscribe(&self) -> SessionWatcher {
        SessionWatcher {
            rx: self.inner.state.subscribe(),
        }
    }
}

impl Inner {
    fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    fn begin(&self, status: Option<SessionStatus>) -> Operation<'_> {
        self.state.send_modify(|s| {
            s.in_flight += 1;
            s.last_error = None;
            if let Some(status) = status {
                s.status = status;
            }
        });
        Operation { state: &self.state }
    }

    /// Returns the status to what the held tokens support
    fn settle(&self) {
        self.state.send_modify(|s| {
            s.status = if s.authenticated {
                SessionStatus::Authenticated
            } else {
                SessionStatus::Unauthenticated
            };
        });
    }

    fn fail(&self, err: SessionError) -> SessionError {
        let message = error_chain(&err);
        self.state.send_modify(|s| s.last_error = Some(message));
        err
    }

    async fn install(&self, store: &mut dyn TokenStore, tokens: TokenSet) {
        if let Err(err) = store.save(&tokens).await {
            tracing::warn!(
                error = &err as &dyn StdError,
                "unable to persist tokens, session will not survive a restart"
            );
        }

        let user = decode_user(&tokens);
        self.state.send_modify(|s| {
            s.tokens = Some(tokens);
            s.user = user;
            s.authenticated = true;
            s.status = SessionStatus::Authenticated;
            s.epoch += 1;
        });
    }

    async fn clear(&self, store: &mut dyn TokenStore) {
        self.state.send_modify(|s| {
            s.tokens = None;
            s.user = None;
            s.authenticated = false;
            s.status = SessionStatus::Unauthenticated;
            s.epoch += 1;
        });

        if let Err(err) = store.clear().await {
            tracing::warn!(
                error = &err as &dyn StdError,
                "unable to clear persisted tokens"
            );
        }
    }
}

fn decode_user(tokens: &TokenSet) -> Option<UnverifiedClaims> {
    match tokens.unverified_user() {
        Ok(user) => Some(user),
        Err(err) => {
            tracing::debug!(error = &err as &dyn StdError, "ID token is not readable");
            None
        }
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

#[async_trait]
impl TokenProvider for SessionManager {
    type Error = SessionError;

    fn current_access_token(&self) -> Option<AccessToken> {
        self.state()
            .tokens()
            .map(|t| t.access_token().to_owned())
    }

    fn can_refresh(&self) -> bool {
        self.state().has_access_token()
    }

    async fn refresh_if_possible(
        &self,
        rejected: &AccessTokenRef,
    ) -> Result<TokenSet, SessionError> {
        let _refreshing = self.inner.refresh_lock.lock().await;

        {
            let state = self.inner.state.borrow();
            match &state.tokens {
                Some(tokens) if state.authenticated && tokens.access_token() != rejected => {
                    tracing::debug!("access token was replaced while waiting");
                    return Ok(tokens.clone());
                }
                Some(_) => {}
                None => {
                    tracing::debug!("session was cleared while waiting");
                    return Err(SessionError::MissingRefreshToken);
                }
            }
        }

        self.refresh_exclusive().await
    }
}
