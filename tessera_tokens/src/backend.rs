//! The backend's auth endpoints
//!
//! The backend fronts the identity provider. It hands out the provider's
//! authorization URL, exchanges authorization codes for tokens, refreshes
//! tokens, and revokes them on logout. Every call is a JSON `POST`; any
//! non-2xx status fails the call.

use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    AccessTokenRef, AuthorizationCodeRef, ClientIdRef, ConfigError, RefreshTokenRef,
    SessionConfig, TokenSet,
};

pub mod dto;

const LOGIN_PATH: &str = "auth/google/login";
const CALLBACK_PATH: &str = "auth/google/callback";
const REFRESH_PATH: &str = "auth/token/refresh";
const LOGOUT_PATH: &str = "auth/logout";

/// An error while calling one of the backend's auth endpoints
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request could not be sent or no response was received
    #[error("error sending request to auth backend")]
    RequestSend(#[source] reqwest_middleware::Error),

    /// The backend responded with a non-success status
    #[error("auth backend responded with {status}: {body}")]
    ErrorStatus {
        /// The response status
        status: StatusCode,
        /// The response body, for diagnostics
        body: String,
    },

    /// The response body could not be read
    #[error("error reading auth backend response body")]
    BodyRead(#[source] reqwest::Error),

    /// The response body was not what the endpoint promises
    #[error("error deserializing auth backend response")]
    Body(#[from] serde_json::Error),
}

impl BackendError {
    /// The HTTP status the backend responded with, if it responded at all
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ErrorStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A client for the backend's auth endpoints
#[derive(Clone, Debug)]
pub struct AuthBackend {
    client: ClientWithMiddleware,
    login_url: Url,
    callback_url: Url,
    refresh_url: Url,
    logout_url: Url,
}

impl AuthBackend {
    /// Constructs a client for the backend described by `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URLs cannot be derived from the
    /// configured base URL.
    pub fn new(client: ClientWithMiddleware, config: &SessionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            login_url: config.endpoint(LOGIN_PATH)?,
            callback_url: config.endpoint(CALLBACK_PATH)?,
            refresh_url: config.endpoint(REFRESH_PATH)?,
            logout_url: config.endpoint(LOGOUT_PATH)?,
        })
    }

    /// Asks the backend where to send the user to authenticate
    ///
    /// The returned URL is whatever the backend said. Checking that it
    /// belongs to this client is the caller's job.
    #[tracing::instrument(err, skip(self), fields(url = %self.login_url))]
    pub async fn authorization_url(
        &self,
        client_id: &ClientIdRef,
    ) -> Result<Option<String>, BackendError> {
        let resp: dto::AuthUrlResponse = self
            .post_json(&self.login_url, &dto::LoginRequest { client_id })
            .await?;
        Ok(resp.auth_url)
    }

    /// Exchanges a single-use authorization code for a token set
    #[tracing::instrument(err, skip(self, code), fields(url = %self.callback_url))]
    pub async fn exchange_code(
        &self,
        code: &AuthorizationCodeRef,
    ) -> Result<TokenSet, BackendError> {
        let tokens: TokenSet = self
            .post_json(&self.callback_url, &dto::CallbackRequest { code })
            .await?;

        tracing::info!("received tokens for authorization code");
        Ok(tokens)
    }

    /// Exchanges a refresh token for fresh access and ID tokens
    ///
    /// `username` is the user's email, which the backend uses to correlate
    /// the refresh token with an account.
    #[tracing::instrument(err, skip(self, refresh_token), fields(url = %self.refresh_url))]
    pub async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
        username: &str,
    ) -> Result<dto::RefreshResponse, BackendError> {
        let resp: dto::RefreshResponse = self
            .post_json(
                &self.refresh_url,
                &dto::RefreshRequest {
                    refresh_token,
                    username,
                },
            )
            .await?;

        tracing::info!(
            has_refresh_token = resp.refresh_token.is_some(),
            "received refreshed tokens"
        );
        if resp.refresh_token.is_some() {
            tracing::info!("received new refresh token");
        }

        Ok(resp)
    }

    /// Tells the backend the access token is no longer in use
    #[tracing::instrument(err, skip(self, access_token), fields(url = %self.logout_url))]
    pub async fn logout(&self, access_token: &AccessTokenRef) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.logout_url.clone())
            .bearer_auth(access_token.as_str())
            .json(&dto::LogoutRequest { access_token })
            .send()
            .await
            .map_err(BackendError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received logout response"
        );

        check_status(resp).await.map(drop)
    }

    async fn post_json<B, R>(&self, url: &Url, body: &B) -> Result<R, BackendError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        tracing::trace!("sending request to auth backend");

        let resp = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(BackendError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from auth backend"
        );

        let resp = check_status(resp).await?;
        let body = resp.bytes().await.map_err(BackendError::BodyRead)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.map_err(BackendError::BodyRead)?;
    Err(BackendError::ErrorStatus { status, body })
}
