//! Token persistence backends.
//!
//! Persistence is best effort: the manager logs a failed store call and
//! keeps serving the in-memory token. [`FileTokenStore`] writes a JSON
//! file; [`MemoryTokenStore`] backs tests and short-lived sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::credentials::manager::TokenRecord;
use crate::error::{LinkError, Result};

/// Storage backend for fetched tokens.
///
/// A store holds at most one record: the latest token. Implementations can
/// write files, environment-specific keychains, or nothing at all.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist the latest record, overwriting any previous one.
    async fn persist(&self, record: &TokenRecord) -> Result<()>;

    /// Load the last persisted record, `Ok(None)` when nothing is stored.
    async fn load(&self) -> Result<Option<TokenRecord>>;
}

/// JSON file backend.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn persist(&self, record: &TokenRecord) -> Result<()> {
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| LinkError::Other(format!("serialize token record: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    LinkError::Other(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| LinkError::Other(format!("write {}: {}", self.path.display(), e)))
    }

    async fn load(&self) -> Result<Option<TokenRecord>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LinkError::Other(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let record = serde_json::from_slice(&raw)
            .map_err(|e| LinkError::Other(format!("parse {}: {}", self.path.display(), e)))?;
        Ok(Some(record))
    }
}

/// In-memory backend for tests and sessions that should not touch disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    record: Arc<Mutex<Option<TokenRecord>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record without going through the async trait.
    pub fn saved(&self) -> Option<TokenRecord> {
        self.record.lock().clone()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn persist(&self, record: &TokenRecord) -> Result<()> {
        *self.record.lock() = Some(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<TokenRecord>> {
        Ok(self.record.lock().clone())
    }
}
