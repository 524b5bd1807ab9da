//! Durable persistence of the current token set
//!
//! A store holds at most one record: the session's [`TokenSet`], under a
//! single key. It is read once at start-up to recover a session and written
//! on every change, so that a restart picks up where the last process left
//! off.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::TokenSet;

#[cfg(feature = "file")]
mod file;
mod memory;

#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use file::FileTokenStore;
pub use memory::MemoryTokenStore;

/// The key under which the token set record is persisted
pub const STORAGE_KEY: &str = "auth_tokens";

/// An error reading or writing the persisted token set
#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// The underlying storage could not be accessed
    #[error("unable to access persisted tokens")]
    Io(#[from] io::Error),

    /// The record exists but is not a complete token set
    ///
    /// The record should be cleared; it will never become readable.
    #[error("persisted token record is corrupt")]
    Corrupt(#[source] serde_json::Error),

    /// The token set could not be serialized
    #[error("unable to serialize token set")]
    Serialize(#[source] serde_json::Error),
}

/// Durable storage for a single token set
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Reads the persisted token set
    ///
    /// Returns `Ok(None)` when nothing has been persisted.
    ///
    /// # Errors
    ///
    /// Returns [`TokenStoreError::Corrupt`] when a record exists but cannot
    /// be read as a complete token set. Callers treat that as "no session"
    /// and clear the record.
    async fn load(&mut self) -> Result<Option<TokenSet>, TokenStoreError>;

    /// Replaces the persisted token set
    ///
    /// Readers never observe a partially written record.
    async fn save(&mut self, tokens: &TokenSet) -> Result<(), TokenStoreError>;

    /// Removes the persisted token set, succeeding if there was none
    async fn clear(&mut self) -> Result<(), TokenStoreError>;
}

#[async_trait]
impl<S: TokenStore + ?Sized> TokenStore for Box<S> {
    async fn load(&mut self) -> Result<Option<TokenSet>, TokenStoreError> {
        (**self).load().await
    }

    async fn save(&mut self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        (**self).save(tokens).await
    }

    async fn clear(&mut self) -> Result<(), TokenStoreError> {
        (**self).clear().await
    }
}
