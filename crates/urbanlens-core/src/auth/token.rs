use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use serde_json::Value;

/// Source of the bearer token for authenticated requests.
///
/// Implementations are shared across tasks, so every method takes `&self`.
pub trait TokenStore: Send + Sync {
    /// Current bearer token, if signed in.
    fn token(&self) -> Option<String>;

    fn set_token(&self, token: &str) -> Result<()>;

    /// Profile of the signed-in user, as returned by the backend.
    fn user(&self) -> Option<Value>;

    fn set_user(&self, user: Value) -> Result<()>;

    /// Remove the token and the user profile.
    fn clear(&self) -> Result<()>;

    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
}

#[derive(Debug, Default)]
struct Credentials {
    token: Option<String>,
    user: Option<Value>,
}

/// Token store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<Credentials>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Credentials {
                token: Some(token.into()),
                user: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Credentials> {
        // The guarded data is plain values, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    fn set_token(&self, token: &str) -> Result<()> {
        self.lock().token = Some(token.to_string());
        Ok(())
    }

    fn user(&self) -> Option<Value> {
        self.lock().user.clone()
    }

    fn set_user(&self, user: Value) -> Result<()> {
        self.lock().user = Some(user);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.lock() = Credentials::default();
        Ok(())
    }
}
