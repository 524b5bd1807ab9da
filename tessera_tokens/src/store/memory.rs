use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{TokenStore, TokenStoreError};
use crate::TokenSet;

/// An in-process token store
///
/// The record is kept serialized, exactly as a durable store would hold it,
/// in a slot shared by every clone. Handing one clone to a session manager
/// and keeping another lets a host (or a test) observe what was persisted.
#[derive(Clone, Debug, Default)]
pub struct MemoryTokenStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryTokenStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store already holding `record` verbatim
    pub fn with_record(record: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(record.into()))),
        }
    }

    /// The raw persisted record, if any
    pub fn record(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Whether any record is persisted
    pub fn contains_record(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&mut self) -> Result<Option<TokenSet>, TokenStoreError> {
        match self.lock().as_deref() {
            None => Ok(None),
            Some(record) => serde_json::from_str(record)
                .map(Some)
                .map_err(TokenStoreError::Corrupt),
        }
    }

    async fn save(&mut self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        let record = serde_json::to_string(tokens).map_err(TokenStoreError::Serialize)?;
        *self.lock() = Some(record);
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), TokenStoreError> {
        *self.lock() = None;
        Ok(())
    }
}
