use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::cache::CacheEntry;

use super::CachedFetchClient;

/// What a view should render for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    /// No key; nothing requested.
    Idle,
    /// No usable cache and a fetch is running. Show a spinner.
    Loading,
    /// Cached data is shown while a background fetch runs.
    Revalidating,
    /// Data is shown and nothing is in flight.
    Ready,
    /// The backend rejected the session. Send the user to sign in.
    SessionExpired,
    /// Nothing to show and the last fetch failed. Offer a retry.
    Failed,
}

/// Snapshot of a subscription.
#[derive(Debug, Clone)]
pub struct FetchState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<Arc<ApiError>>,
    updated_at: Option<DateTime<Utc>>,
    in_flight: usize,
}

impl<T> FetchState<T> {
    fn new(data: Option<T>, updated_at: Option<DateTime<Utc>>, loading: bool) -> Self {
        Self {
            data,
            loading,
            error: None,
            updated_at,
            in_flight: 0,
        }
    }

    /// Write time of the cache entry behind `data`.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Fetches started for this subscription that have not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn status(&self) -> ViewStatus {
        match (&self.error, &self.data) {
            (Some(err), _) if err.is_auth() => ViewStatus::SessionExpired,
            _ if self.loading => ViewStatus::Loading,
            (Some(_), None) => ViewStatus::Failed,
            (_, Some(_)) if self.in_flight > 0 => ViewStatus::Revalidating,
            (_, Some(_)) => ViewStatus::Ready,
            (_, None) if self.in_flight > 0 => ViewStatus::Loading,
            (_, None) => ViewStatus::Idle,
        }
    }
}

impl<T: DeserializeOwned> FetchState<T> {
    /// Fold a finished fetch into the state.
    fn apply(&mut self, key: &str, kind: FetchKind, result: Result<Arc<CacheEntry>, Arc<ApiError>>) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match result {
            Ok(entry) => {
                let newer = self.updated_at.map_or(true, |shown| entry.timestamp > shown);
                if !newer {
                    debug!(key, "Ignoring response older than the data already shown");
                } else {
                    match entry.decode::<T>() {
                        Ok(data) => {
                            self.data = Some(data);
                            self.updated_at = Some(entry.timestamp);
                            self.error = None;
                        }
                        Err(e) => {
                            let err = ApiError::InvalidResponse(format!(
                                "Unexpected response shape from {}: {}",
                                key, e
                            ));
                            self.fail(key, Arc::new(err));
                        }
                    }
                }
            }
            Err(err) => self.fail(key, err),
        }

        if kind == FetchKind::Mount {
            self.loading = false;
        }
    }

    fn fail(&mut self, key: &str, err: Arc<ApiError>) {
        if err.is_auth() {
            warn!(key, error = %err, "Session expired while fetching");
            self.error = Some(err);
        } else if self.data.is_some() {
            warn!(key, error = %err, "Fetch failed, serving cached data");
            self.error = None;
        } else {
            warn!(key, error = %err, "Fetch failed with nothing cached");
            self.error = Some(err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    /// First fetch after subscribing; owns the `loading` flag.
    Mount,
    /// `revalidate()`; never touches `loading`.
    Background,
}

/// One view's interest in one key.
///
/// Dropping a subscription does not cancel its fetches: they still complete
/// and update the shared cache, but their results are discarded for the view.
pub struct Subscription<T> {
    key: Option<String>,
    client: CachedFetchClient,
    state: Arc<watch::Sender<FetchState<T>>>,
    changes: watch::Receiver<FetchState<T>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn idle(client: CachedFetchClient) -> Self {
        Self::new(None, client, FetchState::new(None, None, false))
    }

    /// Subscribe to `key` seeded with `cached`, and start the mount fetch.
    pub(crate) fn start(key: String, client: CachedFetchClient, cached: Option<Arc<CacheEntry>>) -> Self {
        let mut seed = None;
        if let Some(entry) = cached {
            match entry.decode::<T>() {
                Ok(data) => seed = Some((data, entry.timestamp, client.store().is_fresh(&entry))),
                Err(e) => warn!(key = %key, error = %e, "Cached value has an unexpected shape, ignoring it"),
            }
        }

        let state = match seed {
            Some((data, updated_at, fresh)) => FetchState::new(Some(data), Some(updated_at), !fresh),
            None => FetchState::new(None, None, true),
        };

        let subscription = Self::new(Some(key), client, state);
        subscription.spawn_fetch(FetchKind::Mount);
        subscription
    }

    fn new(key: Option<String>, client: CachedFetchClient, state: FetchState<T>) -> Self {
        let (tx, rx) = watch::channel(state);
        Self {
            key,
            client,
            state: Arc::new(tx),
            changes: rx,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn spawn_fetch(&self, kind: FetchKind) {
        let Some(key) = self.key.clone() else {
            return;
        };
        self.state.send_modify(|s| s.in_flight += 1);

        let client = self.client.clone();
        let state: Weak<watch::Sender<FetchState<T>>> = Arc::downgrade(&self.state);
        let handle = tokio::spawn(async move {
            let result = client.fetch_entry(&key).await;
            match state.upgrade() {
                Some(state) => state.send_modify(|s| s.apply(&key, kind, result)),
                None => debug!(key = %key, "Subscriber dropped before fetch completed, discarding result"),
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Force a network fetch for the current key without touching `loading`.
    /// No-op for an idle subscription.
    pub fn revalidate(&self) {
        self.spawn_fetch(FetchKind::Background);
    }

    /// Wait until every fetch started so far has finished.
    pub async fn settled(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Fetch task failed");
                }
            }
        }
    }
}

impl<T: Clone> Subscription<T> {
    /// Resolved cache key, `None` when idle.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn snapshot(&self) -> FetchState<T> {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.state.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn error(&self) -> Option<Arc<ApiError>> {
        self.state.borrow().error.clone()
    }

    pub fn status(&self) -> ViewStatus {
        self.state.borrow().status()
    }

    /// A receiver that sees every later state change.
    pub fn watch(&self) -> watch::Receiver<FetchState<T>> {
        self.state.subscribe()
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> FetchState<T> {
        // The sender lives in `self`, so the channel cannot close here.
        let _ = self.changes.changed().await;
        self.changes.borrow_and_update().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::fetch::Fetch;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct AlwaysOk;

    #[async_trait]
    impl Fetch for AlwaysOk {
        async fn fetch(&self, _url: &str) -> Result<Value, ApiError> {
            Ok(json!({"ok": true}))
        }
    }

    async fn wait_idle(sub: &Subscription<Value>) {
        while sub.snapshot().in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_finished_fetches_are_not_retained() {
        let client = CachedFetchClient::new(Arc::new(AlwaysOk), Arc::new(CacheStore::memory_only()));
        let sub = client.subscribe::<Value>("/k");
        wait_idle(&sub).await;

        for _ in 0..500 {
            sub.revalidate();
            wait_idle(&sub).await;
        }

        let retained = sub.pending.lock().unwrap().len();
        assert!(retained <= 2, "retained {} task handles", retained);
        assert_eq!(sub.data(), Some(json!({"ok": true})));

        sub.settled().await;
        assert!(sub.pending.lock().unwrap().is_empty());
    }
}
