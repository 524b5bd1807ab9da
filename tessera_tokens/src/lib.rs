//! Client-side management of an authenticated session
//!
//! A client that signs its user in through an OAuth2/OIDC authorization-code
//! flow ends up holding three tokens: an access token to present to the API,
//! an ID token describing the user, and a refresh token to obtain new ones.
//! This crate owns those tokens for the lifetime of the process.
//!
//! The [`SessionManager`] is the single owner of the session. It recovers a
//! persisted session at start-up, drives the login, refreshes expired tokens,
//! and tears the session down. Everything else only reads from it, or asks it
//! to refresh through the narrow [`TokenProvider`] interface.
//!
//! # General Flow
//!
//! On start-up, build one session manager and recover whatever the last
//! process left behind:
//!
//! ```no_run
//! use tessera_tokens::{store::FileTokenStore, SessionConfig, SessionManager};
//! use reqwest_middleware::ClientBuilder;
//! use url::Url;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new(
//!     Url::parse("https://api.example.com/")?,
//!     "client-123.apps.example.com",
//! )?;
//! let client = ClientBuilder::new(reqwest::Client::new()).build();
//!
//! let session = SessionManager::builder(config, client)
//!     .with_store(FileTokenStore::new("auth_tokens.json"))
//!     .build()?;
//!
//! if let Err(error) = session.init().await {
//!     tracing::warn!(%error, "previous session could not be recovered");
//! }
//!
//! if !session.is_authenticated() {
//!     session.begin_login().await?;
//! }
//! # Ok(()) }
//! ```
//!
//! The identity provider eventually sends the user back with an
//! authorization code, which is handed to
//! [`complete_login()`][SessionManager::complete_login()].
//!
//! Token contents are read with [`tessera_jwt`], which does **not** verify
//! signatures. The session uses the claims only to judge expiry and to
//! describe the user; the backend remains the judge of whether a token is
//! genuine.
//!
//! # Features
//!
//! * `file` (default): Provides a token store persisting to the local
//!   filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backend;
mod braids;
mod config;
mod provider;
pub mod session;
pub mod store;
mod token_set;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use config::{ConfigError, SessionConfig};
pub use provider::TokenProvider;
pub use session::{SessionError, SessionManager, SessionStatus};
pub use token_set::{IncompleteTokenSet, TokenSet};
