use thiserror::Error;
use url::Url;

use crate::{ClientId, ClientIdRef};

/// Where the session's backend lives and which OAuth client it acts for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    api_base_url: Url,
    client_id: ClientId,
}

/// The session is not configured well enough to proceed
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No OAuth client identifier was supplied
    #[error("OAuth client ID is not configured")]
    MissingClientId,

    /// The API base URL cannot have paths joined onto it
    #[error("API base URL must be an http(s) URL: {0}")]
    UnsupportedBaseUrl(Url),

    /// An endpoint URL could not be derived from the base URL
    #[error("unable to derive endpoint `{path}` from the API base URL")]
    InvalidEndpoint {
        /// The endpoint path relative to the base URL
        path: &'static str,
        /// The underlying parse error
        source: url::ParseError,
    },
}

impl SessionConfig {
    /// Constructs a configuration
    ///
    /// The base URL's path is kept: endpoints resolve beneath it, so
    /// `https://api.example.com/dev` serves login at
    /// `https://api.example.com/dev/auth/google/login`.
    ///
    /// An empty client ID is accepted here and refused when a login is
    /// started.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not an http or https URL.
    pub fn new(api_base_url: Url, client_id: impl Into<ClientId>) -> Result<Self, ConfigError> {
        if !matches!(api_base_url.scheme(), "http" | "https") || api_base_url.cannot_be_a_base()
        {
            return Err(ConfigError::UnsupportedBaseUrl(api_base_url));
        }

        let mut api_base_url = api_base_url;
        if !api_base_url.path().ends_with('/') {
            let path = format!("{}/", api_base_url.path());
            api_base_url.set_path(&path);
        }

        Ok(Self {
            api_base_url,
            client_id: client_id.into(),
        })
    }

    /// The normalized API base URL, always ending in `/`
    #[inline]
    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    /// The configured client ID, which may be empty
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The configured client ID, if one was supplied
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingClientId`] if the client ID is empty.
    pub fn require_client_id(&self) -> Result<&ClientIdRef, ConfigError> {
        if self.client_id.as_str().trim().is_empty() {
            Err(ConfigError::MissingClientId)
        } else {
            Ok(&self.client_id)
        }
    }

    pub(crate) fn endpoint(&self, path: &'static str) -> Result<Url, ConfigError> {
        self.api_base_url
            .join(path)
            .map_err(|source| ConfigError::InvalidEndpoint { path, source })
    }
}
