use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("credentials must carry both an access and a refresh token")]
    IncompleteCredentials,
    #[error("not logged in")]
    NotLoggedIn,
}

/// The access/refresh pair. Either both tokens are set or neither is.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    access_token: String,
    refresh_token: String,
}

impl Credentials {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();
        if access_token.trim().is_empty() || refresh_token.trim().is_empty() {
            return Err(SessionError::IncompleteCredentials);
        }
        Ok(Self {
            access_token,
            refresh_token,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_empty() { "empty" } else { "<redacted>" };
        f.debug_struct("Credentials")
            .field("access_token", &state)
            .field("refresh_token", &state)
            .finish()
    }
}

/// Durable home of the credentials between runs.
pub trait CredentialBackend: Send + Sync {
    fn load_credentials(&self) -> Result<Option<Credentials>>;
    fn save_credentials(&self, credentials: &Credentials) -> Result<()>;
    fn clear_credentials(&self) -> Result<()>;
}

/// Process-wide holder of the current credentials.
///
/// Readers always see the latest value; writers update memory first and then
/// persist. A persistence failure is logged and does not undo the change.
pub struct TokenStore {
    current: RwLock<Credentials>,
    backend: Option<Arc<dyn CredentialBackend>>,
}

impl TokenStore {
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Credentials::default()),
            backend: None,
        }
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(credentials),
            backend: None,
        }
    }

    pub fn load(backend: Arc<dyn CredentialBackend>) -> Result<Self> {
        let credentials = backend.load_credentials()?.unwrap_or_default();
        Ok(Self {
            current: RwLock::new(credentials),
            backend: Some(backend),
        })
    }

    pub fn snapshot(&self) -> Credentials {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        let current = self.current.read();
        if current.is_empty() {
            None
        } else {
            Some(current.access_token.clone())
        }
    }

    pub fn refresh_token(&self) -> Option<String> {
        let current = self.current.read();
        if current.refresh_token.is_empty() {
            None
        } else {
            Some(current.refresh_token.clone())
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !self.current.read().is_empty()
    }

    pub fn replace(&self, credentials: Credentials) -> Result<(), SessionError> {
        if credentials.is_empty() {
            return Err(SessionError::IncompleteCredentials);
        }
        *self.current.write() = credentials.clone();
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.save_credentials(&credentials) {
                warn!(error = ?err, "session: failed to persist credentials");
            }
        }
        Ok(())
    }

    pub fn clear(&self) {
        *self.current.write() = Credentials::default();
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.clear_credentials() {
                warn!(error = ?err, "session: failed to clear persisted credentials");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemoryBackend {
        saved: Mutex<Option<Credentials>>,
    }

    impl CredentialBackend for MemoryBackend {
        fn load_credentials(&self) -> Result<Option<Credentials>> {
            Ok(self.saved.lock().clone())
        }

        fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
            *self.saved.lock() = Some(credentials.clone());
            Ok(())
        }

        fn clear_credentials(&self) -> Result<()> {
            *self.saved.lock() = None;
            Ok(())
        }
    }

    #[test]
    fn rejects_half_populated_pair() {
        assert!(matches!(
            Credentials::new("access", ""),
            Err(SessionError::IncompleteCredentials)
        ));
        assert!(Credentials::new("", "refresh").is_err());
    }

    #[test]
    fn replace_and_clear_write_through() {
        let backend = Arc::new(MemoryBackend::default());
        let store = TokenStore::load(backend.clone()).unwrap();
        assert!(!store.is_logged_in());

        store
            .replace(Credentials::new("a1", "r1").unwrap())
            .unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(
            backend.saved.lock().as_ref().map(|c| c.refresh_token().to_string()),
            Some("r1".to_string())
        );

        let reloaded = TokenStore::load(backend.clone()).unwrap();
        assert_eq!(reloaded.refresh_token().as_deref(), Some("r1"));

        store.clear();
        assert!(store.access_token().is_none());
        assert!(backend.saved.lock().is_none());
    }

    #[test]
    fn debug_output_hides_tokens() {
        let creds = Credentials::new("secret-access", "secret-refresh").unwrap();
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("secret"));
    }
}
