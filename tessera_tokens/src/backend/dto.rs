//! DTOs for interacting with the backend's auth endpoints

use serde::{Deserialize, Serialize};

use crate::{
    AccessToken, AccessTokenRef, AuthorizationCodeRef, ClientIdRef, IdToken, RefreshToken,
    RefreshTokenRef,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LoginRequest<'a> {
    pub client_id: &'a ClientIdRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AuthUrlResponse {
    #[serde(default)]
    pub auth_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct CallbackRequest<'a> {
    pub code: &'a AuthorizationCodeRef,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshRequest<'a> {
    pub refresh_token: &'a RefreshTokenRef,
    pub username: &'a str,
}

/// The tokens issued by a refresh
///
/// The refresh token is present only when the backend rotated it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    /// The new access token
    pub access_token: AccessToken,

    /// The new ID token
    pub id_token: IdToken,

    /// The rotated refresh token, if any
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LogoutRequest<'a> {
    pub access_token: &'a AccessTokenRef,
}
