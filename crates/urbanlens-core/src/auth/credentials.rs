use anyhow::{Context, Result};
use keyring::Entry;
use serde_json::Value;
use tracing::debug;

use super::TokenStore;

const SERVICE_NAME: &str = "urbanlens";

/// Suffix of the keychain account holding the user profile JSON.
const USER_ACCOUNT_SUFFIX: &str = ":user";

/// Token store backed by the OS keychain.
pub struct KeyringTokenStore {
    account: String,
}

impl KeyringTokenStore {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn token_entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }

    fn user_entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &format!("{}{}", self.account, USER_ACCOUNT_SUFFIX))
            .context("Failed to create keyring entry")
    }

    fn delete(entry: Entry) -> Result<()> {
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

impl TokenStore for KeyringTokenStore {
    fn token(&self) -> Option<String> {
        match self.token_entry().and_then(|e| Ok(e.get_password()?)) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(error = %e, "No token in keychain");
                None
            }
        }
    }

    fn set_token(&self, token: &str) -> Result<()> {
        self.token_entry()?
            .set_password(token)
            .context("Failed to store token in keychain")
    }

    fn user(&self) -> Option<Value> {
        let raw = self.user_entry().ok()?.get_password().ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn set_user(&self, user: Value) -> Result<()> {
        self.user_entry()?
            .set_password(&user.to_string())
            .context("Failed to store user profile in keychain")
    }

    fn clear(&self) -> Result<()> {
        Self::delete(self.token_entry()?)?;
        Self::delete(self.user_entry()?)
    }
}
