//! Client configuration.
//!
//! Settings are resolved once at startup into a `Config`. The backend base URL
//! is required and is looked up in this order, first hit wins:
//!
//! 1. explicit override (e.g. the CLI `--api-url` flag)
//! 2. `URBANLENS_API_URL`
//! 3. `NEXT_PUBLIC_API_URL`
//! 4. `EXPO_PUBLIC_API_BASE_URL`
//! 5. `api_base_url` in `~/.config/urbanlens/config.json`
//!
//! Everything else has a default and may be set in the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "urbanlens";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variables consulted for the base URL, in precedence order.
pub const BASE_URL_ENV_VARS: [&str; 3] = [
    "URBANLENS_API_URL",
    "NEXT_PUBLIC_API_URL",
    "EXPO_PUBLIC_API_BASE_URL",
];

/// Entries older than this trigger a blocking fetch.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Backoff step; retry `n` (1-based) waits `n * step`.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing backend base URL: set --api-url, one of {}, or api_base_url in {config_file}", BASE_URL_ENV_VARS.join(", "))]
    MissingBaseUrl { config_file: String },

    #[error("Invalid backend base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Could not find a {0} directory")]
    NoDirectory(&'static str),

    #[error("Failed to read config file: {0}")]
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreKind {
    #[default]
    File,
    Keyring,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    pub api_base_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub coalesce_requests: Option<bool>,
    pub token_store: Option<TokenStoreKind>,
    pub keyring_account: Option<String>,
}

impl FileConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}

/// Values that take precedence over environment and file settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_base_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL, without a trailing slash.
    pub api_base_url: String,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub coalesce_requests: bool,
    pub token_store: TokenStoreKind,
    pub keyring_account: String,
}

impl Config {
    /// Resolve from overrides, the process environment and the config file.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let file = FileConfig::load().map_err(|e| ConfigError::File(format!("{:#}", e)))?;
        Self::resolve_with(overrides, |name| std::env::var(name).ok(), file)
    }

    /// Resolve with an explicit environment lookup and file contents.
    pub fn resolve_with(
        overrides: ConfigOverrides,
        env: impl Fn(&str) -> Option<String>,
        file: FileConfig,
    ) -> Result<Self, ConfigError> {
        let raw_url = overrides
            .api_base_url
            .clone()
            .into_iter()
            .chain(BASE_URL_ENV_VARS.iter().filter_map(|name| env(name)))
            .chain(file.api_base_url.clone())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingBaseUrl {
                config_file: FileConfig::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| CONFIG_FILE.to_string()),
            })?;
        let api_base_url = Self::validate_base_url(&raw_url)?;

        let cache_dir = match overrides.cache_dir.or(file.cache_dir) {
            Some(dir) => dir,
            None => Self::default_cache_dir()?,
        };

        Ok(Self {
            api_base_url,
            cache_dir,
            cache_ttl: file
                .cache_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CACHE_TTL),
            request_timeout: file
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_retries: file.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_backoff: file
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_BACKOFF),
            coalesce_requests: file.coalesce_requests.unwrap_or(false),
            token_store: file.token_store.unwrap_or_default(),
            keyring_account: file.keyring_account.unwrap_or_else(|| "default".to_string()),
        })
    }

    /// A config with defaults for everything but the base URL and cache dir.
    pub fn new(api_base_url: &str, cache_dir: PathBuf) -> Result<Self, ConfigError> {
        Self::resolve_with(
            ConfigOverrides {
                api_base_url: Some(api_base_url.to_string()),
                cache_dir: Some(cache_dir),
            },
            |_| None,
            FileConfig::default(),
        )
    }

    fn validate_base_url(raw: &str) -> Result<String, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme {}", other))),
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(raw.trim_end_matches('/').to_string())
    }

    fn default_cache_dir() -> Result<PathBuf, ConfigError> {
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::NoDirectory("cache"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
