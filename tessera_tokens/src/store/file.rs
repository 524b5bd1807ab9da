use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};

use super::{TokenStore, TokenStoreError, STORAGE_KEY};
use crate::TokenSet;

/// A token store backed by a JSON file on the local filesystem
///
/// Writes go to a sibling staging file which is then renamed over the
/// record, so the record is always either the old set or the new one. On
/// Unix the record is readable only by its owner.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Constructs a store persisting to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Constructs a store persisting to `auth_tokens.json` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{STORAGE_KEY}.json")))
    }

    /// The path of the persisted record
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| STORAGE_KEY.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&mut self) -> Result<Option<TokenSet>, TokenStoreError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(TokenStoreError::Corrupt)
    }

    async fn save(&mut self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        let data = serde_json::to_vec_pretty(tokens).map_err(TokenStoreError::Serialize)?;
        let staging = self.staging_path();

        let mut file_opts = fs::OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&staging).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &self.path).await?;
        tracing::trace!(path = %self.path.display(), "persisted token set");
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), TokenStoreError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::trace!(path = %self.path.display(), "removed persisted token set");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
