use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::TokenStore;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub token: String,
    #[serde(default)]
    pub user: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Token store backed by `session.json` in the cache directory.
///
/// The file is read once on construction and rewritten on every change.
pub struct FileTokenStore {
    path: PathBuf,
    data: Mutex<Option<SessionData>>,
}

impl FileTokenStore {
    /// Open the session in `cache_dir`, loading any saved session.
    ///
    /// An unreadable session file is logged and treated as signed out.
    pub fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join(SESSION_FILE);
        let data = match Self::load(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                None
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    fn load(path: &Path) -> Result<Option<SessionData>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).context("Failed to read session file")?;
        let data: SessionData =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(data))
    }

    fn save(&self, data: &Option<SessionData>) -> Result<()> {
        match data {
            Some(data) => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let contents = serde_json::to_string_pretty(data)?;
                std::fs::write(&self.path, contents).context("Failed to write session file")?;
            }
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path).context("Failed to remove session file")?;
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionData>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When the current token was stored.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.lock().as_ref().map(|d| d.created_at)
    }
}

impl TokenStore for FileTokenStore {
    fn token(&self) -> Option<String> {
        self.lock().as_ref().map(|d| d.token.clone())
    }

    fn set_token(&self, token: &str) -> Result<()> {
        let mut data = self.lock();
        let user = data.as_ref().and_then(|d| d.user.clone());
        *data = Some(SessionData {
            token: token.to_string(),
            user,
            created_at: Utc::now(),
        });
        self.save(&data)
    }

    fn user(&self) -> Option<Value> {
        self.lock().as_ref().and_then(|d| d.user.clone())
    }

    fn set_user(&self, user: Value) -> Result<()> {
        let mut data = self.lock();
        match data.as_mut() {
            Some(session) => session.user = Some(user),
            None => anyhow::bail!("Cannot store a user profile without a token"),
        }
        self.save(&data)
    }

    fn clear(&self) -> Result<()> {
        let mut data = self.lock();
        *data = None;
        self.save(&data)
    }
}
