//! HuggingFace credential persistence
//!
//! The token lives in `<cache_dir>/.hf_token`. Writes go through a temp file
//! and a rename so a crash never leaves a truncated token behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const TOKEN_FILE_NAME: &str = ".hf_token";

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;

    /// Remove a file; missing files are not an error
    async fn remove(&self, path: &Path) -> Result<()>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp token file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write token file")?;
        file.sync_all().await.context("Failed to sync token file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp token file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read token file: {:?}", path)),
        }
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove token file: {:?}", path)),
        }
    }
}

// ============================================================================
// Token Store
// ============================================================================

/// File-backed store for the HuggingFace token
pub struct TokenStore {
    path: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

impl TokenStore {
    /// Store under `cache_dir` with a custom storage backend
    pub fn new_with_storage(cache_dir: &Path, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            path: cache_dir.join(TOKEN_FILE_NAME),
            storage,
        }
    }

    pub fn new(cache_dir: &Path) -> Self {
        Self::new_with_storage(cache_dir, Arc::new(FileSystemStorage::new()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted token, `None` when absent or blank
    pub async fn load(&self) -> Result<Option<String>> {
        let content = self.storage.load(&self.path).await?;
        Ok(content
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    pub async fn save(&self, token: &str) -> Result<()> {
        self.storage.save(&self.path, token.trim()).await?;
        tracing::info!(path = ?self.path, "HuggingFace token saved");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.remove(&self.path).await?;
        tracing::info!(path = ?self.path, "HuggingFace token cleared");
        Ok(())
    }

    pub async fn has_token(&self) -> bool {
        matches!(self.load().await, Ok(Some(_)))
    }
}
