//! Stale-while-revalidate data fetching.
//!
//! `CachedFetchClient::subscribe` returns a `Subscription` seeded synchronously
//! from the `CacheStore` and immediately refreshed from the network. The
//! subscription exposes `{data, loading, error}` through a `tokio::sync::watch`
//! channel so any view can render it.
//!
//! Failures are absorbed when cached data can stand in for the response;
//! session expiry is always surfaced.

pub mod client;
pub mod subscription;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::ApiError;

pub use client::CachedFetchClient;
pub use subscription::{FetchState, Subscription, ViewStatus};

/// Network source for cached reads. Implemented by `ApiClient`.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Turn an endpoint into the fully-qualified URL used as cache key.
    fn resolve_key(&self, endpoint: &str) -> String {
        endpoint.to_string()
    }

    /// GET `url` and return its JSON body.
    async fn fetch(&self, url: &str) -> Result<Value, ApiError>;
}
