//! Durable credential storage.
//!
//! Defines the [`CredentialStorage`] trait used by
//! [`TokenStore`](super::TokenStore) to persist the session, plus two
//! backends:
//! - [`FileStorage`]: a JSON document on disk, keyed `token`,
//!   `refreshToken` and `username`
//! - [`MemoryStorage`]: process-local, for tests and throwaway sessions

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::Credentials;

/// Errors that can occur while persisting credentials.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or writing the session file failed.
    #[error("session file {path}: {source}")]
    Io {
        /// File that was accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The session file is not valid JSON.
    #[error("corrupt session file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence backend for the session.
///
/// Implementations are synchronous: the payload is a handful of short
/// strings and every write happens on a login, refresh or logout.
pub trait CredentialStorage: Send + Sync {
    /// Read the persisted session. `Ok(None)` means logged out.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be read.
    fn load(&self) -> Result<Option<Credentials>, StorageError>;

    /// Persist `credentials`, replacing what was stored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be written.
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError>;

    /// Remove the persisted session.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be written.
    fn clear(&self) -> Result<(), StorageError>;
}

/// On-disk shape. Every key is optional so a partially written or older
/// file still loads; a file lacking either token is a logged-out session.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

impl StoredSession {
    fn into_credentials(self) -> Option<Credentials> {
        Some(Credentials {
            access_token: self.token?,
            refresh_token: self.refresh_token?,
            username: self.username.unwrap_or_default(),
        })
    }
}

impl From<&Credentials> for StoredSession {
    fn from(c: &Credentials) -> Self {
        Self {
            token: Some(c.access_token.clone()),
            refresh_token: Some(c.refresh_token.clone()),
            username: Some(c.username.clone()),
        }
    }
}

/// JSON file backend.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Store the session at `path`. Parent directories are created on the
    /// first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File this backend reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStorage for FileStorage {
    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let stored: StoredSession = serde_json::from_str(&contents)?;
                Ok(stored.into_credentials())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(&StoredSession::from(credentials))?;
        // Write-then-rename so a crash never leaves half a file behind.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn clear(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// In-memory backend. Clones share the same slot, so a test can keep one
/// clone to inspect what the store persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    slot: Arc<Mutex<Option<Credentials>>>,
}

impl MemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a session, as if persisted by an earlier run.
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(credentials))),
        }
    }

    /// What is currently persisted.
    #[must_use]
    pub fn snapshot(&self) -> Option<Credentials> {
        self.slot.lock().clone()
    }
}

impl CredentialStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        *self.slot.lock() = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.slot.lock() = None;
        Ok(())
    }
}
