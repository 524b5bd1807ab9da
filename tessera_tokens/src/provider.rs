use async_trait::async_trait;

use crate::{AccessToken, AccessTokenRef, TokenSet};

/// A source of access tokens that can be asked to replace a rejected one
///
/// This is the narrow seam between outbound request plumbing and the
/// session that owns the tokens. Request code only ever reads the current
/// token and, after the server rejects it, asks for a refresh.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The error produced when a refresh fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// The current access token, if a session exists
    fn current_access_token(&self) -> Option<AccessToken>;

    /// Whether a refresh could possibly succeed
    fn can_refresh(&self) -> bool;

    /// Replaces `rejected` with a fresh access token
    ///
    /// If the current token is already different from `rejected`, another
    /// caller refreshed in the meantime and the current set is returned
    /// without contacting the authority.
    async fn refresh_if_possible(
        &self,
        rejected: &AccessTokenRef,
    ) -> Result<TokenSet, Self::Error>;
}

#[async_trait]
impl<T: TokenProvider + ?Sized> TokenProvider for std::sync::Arc<T> {
    type Error = T::Error;

    fn current_access_token(&self) -> Option<AccessToken> {
        (**self).current_access_token()
    }

    fn can_refresh(&self) -> bool {
        (**self).can_refresh()
    }

    async fn refresh_if_possible(
        &self,
        rejected: &AccessTokenRef,
    ) -> Result<TokenSet, Self::Error> {
        (**self).refresh_if_possible(rejected).await
    }
}
