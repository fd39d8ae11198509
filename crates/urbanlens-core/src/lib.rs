//! Core library for the UrbanLens client.
//!
//! Provides a stale-while-revalidate cached fetch layer over the UrbanLens
//! backend REST API:
//!
//! - `api`: authenticated JSON transport with timeout and retry policy
//! - `auth`: bearer token storage (memory, session file, OS keychain)
//! - `cache`: two-tier cache store (process-local map + persistent directory)
//! - `config`: single resolved configuration, fails fast without a base URL
//! - `fetch`: `CachedFetchClient` and per-view `Subscription`s

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod fetch;

pub use api::{ApiClient, ApiError};
pub use auth::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};
pub use cache::{CacheEntry, CacheStore, DiskTier, PersistentTier};
pub use config::{Config, ConfigError, ConfigOverrides};
pub use fetch::{CachedFetchClient, Fetch, FetchState, Subscription, ViewStatus};
