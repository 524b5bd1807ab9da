use serde::{Deserialize, Serialize};
use tessera_clock::Clock;
use tessera_jwt::{DecodeError, UnverifiedClaims};
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef, IdToken, IdTokenRef, RefreshToken, RefreshTokenRef};

/// The three tokens that together make up a session
///
/// A set is always complete: every member is present and non-empty. A set
/// missing any member cannot be constructed or deserialized, so a partial
/// set can never be persisted or trusted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "TokenSetRecord")]
pub struct TokenSet {
    access_token: AccessToken,
    id_token: IdToken,
    refresh_token: RefreshToken,
}

/// A token set was missing one or more of its members
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("incomplete token set: missing {missing}")]
pub struct IncompleteTokenSet {
    missing: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenSetRecord {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TryFrom<TokenSetRecord> for TokenSet {
    type Error = IncompleteTokenSet;

    fn try_from(record: TokenSetRecord) -> Result<Self, Self::Error> {
        TokenSet::new(
            record.access_token.unwrap_or_default(),
            record.id_token.unwrap_or_default(),
            record.refresh_token.unwrap_or_default(),
        )
    }
}

impl TokenSet {
    /// Assembles a complete token set
    ///
    /// # Errors
    ///
    /// Returns an error naming the first empty member.
    pub fn new(
        access_token: impl Into<AccessToken>,
        id_token: impl Into<IdToken>,
        refresh_token: impl Into<RefreshToken>,
    ) -> Result<Self, IncompleteTokenSet> {
        let set = Self {
            access_token: access_token.into(),
            id_token: id_token.into(),
            refresh_token: refresh_token.into(),
        };

        if set.access_token.as_str().is_empty() {
            Err(IncompleteTokenSet {
                missing: "accessToken",
            })
        } else if set.id_token.as_str().is_empty() {
            Err(IncompleteTokenSet { missing: "idToken" })
        } else if set.refresh_token.as_str().is_empty() {
            Err(IncompleteTokenSet {
                missing: "refreshToken",
            })
        } else {
            Ok(set)
        }
    }

    /// The access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// The ID token
    #[inline]
    pub fn id_token(&self) -> &IdTokenRef {
        &self.id_token
    }

    /// The refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Decodes the identity claims carried by the ID token
    ///
    /// The claims are not verified; see [`tessera_jwt`].
    ///
    /// # Errors
    ///
    /// Returns an error if the ID token is not a readable JWT.
    pub fn unverified_user(&self) -> Result<UnverifiedClaims, DecodeError> {
        tessera_jwt::decode_unverified(self.id_token.as_str())
    }

    /// Whether the access token's `exp` claim is still in the future
    /// according to `clock`
    pub fn access_token_is_valid_with_clock<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        tessera_jwt::is_valid_with_clock(self.access_token.as_str(), clock)
    }

    /// Produces the set that results from a refresh
    ///
    /// The access and ID tokens are always replaced. The refresh token is
    /// replaced only if the authority rotated it; otherwise the current one
    /// is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority returned an empty token.
    pub fn refreshed(
        &self,
        access_token: AccessToken,
        id_token: IdToken,
        refresh_token: Option<RefreshToken>,
    ) -> Result<Self, IncompleteTokenSet> {
        let refresh_token = match refresh_token {
            Some(rotated) if !rotated.as_str().is_empty() => rotated,
            _ => self.refresh_token.clone(),
        };

        Self::new(access_token, id_token, refresh_token)
    }
}
