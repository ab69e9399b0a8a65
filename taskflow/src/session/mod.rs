//! Session context: the token pair, the current user, and the session
//! lifecycle signal.
//!
//! One [`TokenStore`] is built at startup and shared as an
//! `Arc<TokenStore>` by the HTTP client and the realtime bridge. Every
//! mutation is written through to a [`CredentialStorage`] backend so the
//! session survives restarts. A storage failure is logged and never undoes
//! the in-memory change.
//!
//! Storage is written while the credentials lock is held, so the file
//! always matches the last in-memory change.

pub mod storage;

use std::fmt;

use parking_lot::RwLock;
use tokio::sync::watch;

pub use storage::{CredentialStorage, FileStorage, MemoryStorage, StorageError};

/// Access/refresh token pair plus the user they belong to.
///
/// Both tokens are always present together; a logged-out session is the
/// absence of a `Credentials` value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token attached to every authenticated request.
    pub access_token: String,
    /// Token exchanged for a new pair when the access token expires.
    pub refresh_token: String,
    /// Login name.
    pub username: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}

/// Where the session stands, as observed by the application controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Credentials are present.
    Authenticated {
        /// Logged-in user.
        username: String,
    },
    /// No session, either never logged in or logged out on purpose.
    LoggedOut,
    /// The server refused to refresh the session; the user must log in again.
    Expired,
}

/// Holder of the current credentials.
///
/// Makes no network calls. Tokens are opaque strings and are never
/// inspected.
pub struct TokenStore {
    credentials: RwLock<Option<Credentials>>,
    storage: Box<dyn CredentialStorage>,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("credentials", &*self.credentials.read())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Restore whatever session `storage` holds.
    ///
    /// An unreadable backend is logged and treated as logged out.
    pub fn load(storage: impl CredentialStorage + 'static) -> Self {
        let restored = match storage.load() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "could not restore session, starting logged out");
                None
            }
        };
        let initial = restored
            .as_ref()
            .map_or(SessionState::LoggedOut, |c| SessionState::Authenticated {
                username: c.username.clone(),
            });
        if let Some(c) = &restored {
            tracing::info!(username = %c.username, "restored session");
        }
        Self {
            credentials: RwLock::new(restored),
            storage: Box::new(storage),
            state: watch::channel(initial).0,
        }
    }

    /// A logged-out store backed by process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::load(MemoryStorage::new())
    }

    /// Current bearer token.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.credentials
            .read()
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    /// Current refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.credentials
            .read()
            .as_ref()
            .map(|c| c.refresh_token.clone())
    }

    /// Logged-in user.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.credentials.read().as_ref().map(|c| c.username.clone())
    }

    /// Full credential set.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    /// Whether a token pair is held.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.credentials.read().is_some()
    }

    /// Replace the session after a login or register.
    pub fn set_credentials(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        username: impl Into<String>,
    ) {
        let credentials = Credentials {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            username: username.into(),
        };
        let username = credentials.username.clone();
        let mut guard = self.credentials.write();
        self.persist(&credentials);
        *guard = Some(credentials);
        drop(guard);
        tracing::debug!(%username, "credentials stored");
        self.state
            .send_replace(SessionState::Authenticated { username });
    }

    /// Swap in a refreshed token pair, keeping the user.
    ///
    /// Returns `false` without changing anything if the store was cleared in
    /// the meantime, so a late refresh cannot resurrect a logged-out session.
    pub fn update_tokens(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> bool {
        let mut guard = self.credentials.write();
        let Some(current) = guard.as_mut() else {
            return false;
        };
        current.access_token = access_token.into();
        current.refresh_token = refresh_token.into();
        self.persist(current);
        tracing::debug!(username = %current.username, "tokens refreshed");
        true
    }

    /// Drop the session (logout).
    pub fn clear(&self) {
        self.end(SessionState::LoggedOut);
    }

    /// Drop the session because it could not be refreshed.
    pub fn expire(&self) {
        self.end(SessionState::Expired);
    }

    /// Session lifecycle signal.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn end(&self, next: SessionState) {
        let mut guard = self.credentials.write();
        let previous = guard.take();
        if let Err(e) = self.storage.clear() {
            tracing::warn!(error = %e, "failed to remove persisted session");
        }
        drop(guard);
        if let Some(c) = previous {
            tracing::info!(username = %c.username, state = ?next, "session ended");
        }
        self.state.send_replace(next);
    }

    fn persist(&self, credentials: &Credentials) {
        if let Err(e) = self.storage.save(credentials) {
            tracing::warn!(error = %e, "failed to persist session");
        }
    }
}
