use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::{ApiClient, ApiError};
use crate::cache::{CacheEntry, CacheStore};
use crate::config::Config;

use super::{Fetch, Subscription};

type FetchResult = Result<Arc<CacheEntry>, Arc<ApiError>>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Cache-aside read client shared by every view in the process.
///
/// Clone is cheap: the fetcher, the store and the in-flight registry are
/// all behind `Arc`.
#[derive(Clone)]
pub struct CachedFetchClient {
    fetcher: Arc<dyn Fetch>,
    store: Arc<CacheStore>,
    coalesce: bool,
    in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl CachedFetchClient {
    pub fn new(fetcher: Arc<dyn Fetch>, store: Arc<CacheStore>) -> Self {
        Self {
            fetcher,
            store,
            coalesce: false,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Client over `api` with a disk-backed store in `config.cache_dir`.
    pub fn from_config(config: &Config, api: ApiClient) -> Result<Self> {
        let store = CacheStore::with_disk(config.cache_dir.clone())?.with_ttl(config.cache_ttl);
        Ok(Self::new(Arc::new(api), Arc::new(store)).with_coalescing(config.coalesce_requests))
    }

    /// Share one network call between concurrent fetches of the same key.
    #[must_use]
    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce = enabled;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn resolve_key(&self, endpoint: &str) -> String {
        self.fetcher.resolve_key(endpoint)
    }

    /// Subscribe to `endpoint`.
    ///
    /// Cached data is available on the returned subscription immediately. A
    /// network fetch is always started, so this must be called from inside a
    /// tokio runtime. An empty endpoint yields an idle subscription that never
    /// fetches.
    pub fn subscribe<T>(&self, endpoint: &str) -> Subscription<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Subscription::idle(self.clone());
        }

        let key = self.resolve_key(endpoint);
        let cached = self.store.get(&key);
        Subscription::start(key, self.clone(), cached)
    }

    /// Fetch `key` from the network and write the result to the cache.
    pub async fn fetch_entry(&self, key: &str) -> FetchResult {
        if !self.coalesce {
            return self.fetch_and_store(key).await;
        }

        let shared = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(key) {
                Some(existing) => {
                    debug!(key, "Joining in-flight request");
                    existing.clone()
                }
                None => {
                    let client = self.clone();
                    let owned_key = key.to_string();
                    let fetch = async move {
                        let result = client.fetch_and_store(&owned_key).await;
                        client.lock_in_flight().remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.to_string(), fetch.clone());
                    fetch
                }
            }
        };
        shared.await
    }

    async fn fetch_and_store(&self, key: &str) -> FetchResult {
        match self.fetcher.fetch(key).await {
            Ok(data) => Ok(self.store.set(key, data)),
            Err(e) => Err(Arc::new(e)),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedFetch>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::fetch::ViewStatus;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    const BASE: &str = "https://api.urbanlens.test";

    enum Step {
        Reply(Result<Value, ApiError>),
        Gate(oneshot::Receiver<Result<Value, ApiError>>),
    }

    /// Fetcher that plays back a script. With the script exhausted, fetches
    /// never complete.
    #[derive(Default)]
    struct ScriptedFetch {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetch {
        fn reply(self: &Arc<Self>, result: Result<Value, ApiError>) -> &Arc<Self> {
            self.steps.lock().unwrap().push_back(Step::Reply(result));
            self
        }

        fn gate(self: &Arc<Self>) -> oneshot::Sender<Result<Value, ApiError>> {
            let (tx, rx) = oneshot::channel();
            self.steps.lock().unwrap().push_back(Step::Gate(rx));
            tx
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for Arc<ScriptedFetch> {
        fn resolve_key(&self, endpoint: &str) -> String {
            format!("{}{}", BASE, endpoint)
        }

        async fn fetch(&self, _url: &str) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(result)) => result,
                Some(Step::Gate(rx)) => match rx.await {
                    Ok(result) => result,
                    Err(_) => futures::future::pending().await,
                },
                None => futures::future::pending().await,
            }
        }
    }

    fn server_error() -> ApiError {
        ApiError::Server {
            status: 500,
            message: "Internal Server Error".to_string(),
        }
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 8, 30, 0).unwrap()
    }

    fn setup() -> (Arc<ScriptedFetch>, Arc<ManualClock>, CachedFetchClient) {
        let fetch = Arc::new(ScriptedFetch::default());
        let clock = Arc::new(ManualClock::new(start()));
        let store = CacheStore::memory_only().with_clock(clock.clone());
        let client = CachedFetchClient::new(Arc::new(Arc::clone(&fetch)), Arc::new(store));
        (fetch, clock, client)
    }

    async fn wait_for_calls(fetch: &ScriptedFetch, n: usize) {
        for _ in 0..1000 {
            if fetch.calls() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {} fetch calls, saw {}", n, fetch.calls());
    }

    #[tokio::test]
    async fn test_empty_cache_success() {
        let (fetch, _clock, client) = setup();
        fetch.reply(Ok(json!({"total_issues": 42})));

        let sub = client.subscribe::<Value>("/admin/stats");
        assert!(sub.is_loading());
        assert!(sub.data().is_none());
        assert_eq!(sub.status(), ViewStatus::Loading);

        sub.settled().await;
        assert!(!sub.is_loading());
        assert_eq!(sub.data(), Some(json!({"total_issues": 42})));
        assert!(sub.error().is_none());
        assert_eq!(sub.status(), ViewStatus::Ready);

        let entry = client.store().get(&format!("{}/admin/stats", BASE)).unwrap();
        assert_eq!(entry.data, json!({"total_issues": 42}));
    }

    #[tokio::test]
    async fn test_fresh_cache_served_and_server_error_swallowed() {
        let (fetch, clock, client) = setup();
        let key = format!("{}/admin/issues?page=1", BASE);
        let cached = json!({"items": [{"id": 1}], "total": 10});
        client.store().set(&key, cached.clone());
        clock.advance(TimeDelta::minutes(1));
        fetch.reply(Err(server_error()));

        let sub = client.subscribe::<Value>("/admin/issues?page=1");
        assert!(!sub.is_loading());
        assert_eq!(sub.data(), Some(cached.clone()));
        assert_eq!(sub.status(), ViewStatus::Revalidating);

        sub.settled().await;
        assert!(!sub.is_loading());
        assert_eq!(sub.data(), Some(cached));
        assert!(sub.error().is_none());
        assert_eq!(fetch.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_cache_failure_surfaces() {
        let (fetch, _clock, client) = setup();
        fetch.reply(Err(server_error()));

        let sub = client.subscribe::<Value>("/admin/stats");
        sub.settled().await;

        assert!(!sub.is_loading());
        assert!(sub.data().is_none());
        assert_eq!(sub.error().unwrap().status(), 500);
        assert_eq!(sub.status(), ViewStatus::Failed);
    }

    #[tokio::test]
    async fn test_session_expired_without_cache() {
        let (fetch, _clock, client) = setup();
        fetch.reply(Err(ApiError::SessionExpired { status: 401 }));

        let sub = client.subscribe::<Value>("/worker/tasks");
        sub.settled().await;

        assert!(!sub.is_loading());
        assert!(sub.data().is_none());
        assert!(sub.error().unwrap().is_auth());
        assert_eq!(sub.status(), ViewStatus::SessionExpired);
    }

    #[tokio::test]
    async fn test_session_expired_surfaces_despite_cache() {
        let (fetch, _clock, client) = setup();
        client
            .store()
            .set(&format!("{}/worker/tasks", BASE), json!([{"id": 3}]));
        fetch.reply(Err(ApiError::SessionExpired { status: 401 }));

        let sub = client.subscribe::<Value>("/worker/tasks");
        sub.settled().await;

        assert!(sub.error().unwrap().is_auth());
        assert_eq!(sub.status(), ViewStatus::SessionExpired);
    }

    #[tokio::test]
    async fn test_stale_cache_blocks_until_refreshed() {
        let (fetch, clock, client) = setup();
        let key = format!("{}/admin/stats", BASE);
        client.store().set(&key, json!({"total_issues": 1}));
        clock.advance(TimeDelta::minutes(5) + TimeDelta::milliseconds(1));
        fetch.reply(Ok(json!({"total_issues": 2})));

        let sub = client.subscribe::<Value>("/admin/stats");
        // Stale data is shown, but the fetch counts as a first load
        assert!(sub.is_loading());
        assert_eq!(sub.data(), Some(json!({"total_issues": 1})));

        sub.settled().await;
        assert!(!sub.is_loading());
        assert_eq!(sub.data(), Some(json!({"total_issues": 2})));
    }

    #[tokio::test]
    async fn test_cache_just_inside_ttl_does_not_block() {
        let (_fetch, clock, client) = setup();
        client
            .store()
            .set(&format!("{}/admin/stats", BASE), json!({"total_issues": 1}));
        clock.advance(TimeDelta::minutes(5) - TimeDelta::milliseconds(1));

        let sub = client.subscribe::<Value>("/admin/stats");
        assert!(!sub.is_loading());
    }

    #[tokio::test]
    async fn test_empty_key_is_idle() {
        let (fetch, _clock, client) = setup();

        let sub = client.subscribe::<Value>("  ");
        assert!(sub.key().is_none());
        assert!(!sub.is_loading());
        assert!(sub.data().is_none());
        assert!(sub.error().is_none());
        assert_eq!(sub.status(), ViewStatus::Idle);

        sub.revalidate();
        sub.settled().await;
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn test_revalidate_runs_in_background() {
        let (fetch, _clock, client) = setup();
        fetch.reply(Ok(json!({"v": 1})));
        let sub = client.subscribe::<Value>("/admin/stats");
        sub.settled().await;

        let release = fetch.gate();
        sub.revalidate();
        assert!(!sub.is_loading());
        assert_eq!(sub.status(), ViewStatus::Revalidating);

        release.send(Ok(json!({"v": 2}))).unwrap();
        sub.settled().await;
        assert!(!sub.is_loading());
        assert_eq!(sub.data(), Some(json!({"v": 2})));
        assert_eq!(sub.status(), ViewStatus::Ready);
        assert_eq!(fetch.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_data() {
        let (fetch, _clock, client) = setup();
        fetch.reply(Ok(json!({"v": 1}))).reply(Err(ApiError::Timeout));

        let sub = client.subscribe::<Value>("/admin/stats");
        sub.settled().await;
        sub.revalidate();
        sub.settled().await;

        assert_eq!(sub.data(), Some(json!({"v": 1})));
        assert!(sub.error().is_none());
    }

    #[tokio::test]
    async fn test_last_successful_response_wins() {
        let (fetch, _clock, client) = setup();
        fetch.reply(Ok(json!({"v": 0})));
        let sub = client.subscribe::<Value>("/admin/stats");
        sub.settled().await;

        let first = fetch.gate();
        let second = fetch.gate();
        sub.revalidate();
        wait_for_calls(&fetch, 2).await;
        sub.revalidate();
        wait_for_calls(&fetch, 3).await;

        // The second request answers first, the first request answers last
        let mut changes = sub.watch();
        changes.borrow_and_update();
        second.send(Ok(json!({"v": "second"}))).unwrap();
        changes.changed().await.unwrap();
        assert_eq!(sub.data(), Some(json!({"v": "second"})));

        first.send(Ok(json!({"v": "first"}))).unwrap();
        sub.settled().await;

        assert_eq!(sub.data(), Some(json!({"v": "first"})));
        let stored = client.store().get(&format!("{}/admin/stats", BASE)).unwrap();
        assert_eq!(stored.data, json!({"v": "first"}));
        assert_eq!(sub.snapshot().updated_at(), Some(stored.timestamp));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_still_updates_cache() {
        let (fetch, _clock, client) = setup();
        let release = fetch.gate();

        let sub = client.subscribe::<Value>("/admin/stats");
        wait_for_calls(&fetch, 1).await;
        drop(sub);

        release.send(Ok(json!({"total_issues": 7}))).unwrap();
        let key = format!("{}/admin/stats", BASE);
        for _ in 0..1000 {
            if client.store().get(&key).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(client.store().get(&key).unwrap().data, json!({"total_issues": 7}));
    }

    #[tokio::test]
    async fn test_views_share_cache_but_fetch_separately() {
        let (fetch, _clock, client) = setup();
        fetch
            .reply(Ok(json!({"total_issues": 1})))
            .reply(Ok(json!({"total_issues": 1})));

        let a = client.subscribe::<Value>("/admin/stats");
        let b = client.subscribe::<Value>("/admin/stats");
        a.settled().await;
        b.settled().await;

        assert_eq!(fetch.calls(), 2);
        assert_eq!(a.data(), b.data());
        assert_eq!(client.store().len(), 1);
    }

    #[tokio::test]
    async fn test_coalescing_shares_one_request() {
        let (fetch, _clock, client) = setup();
        let client = client.with_coalescing(true);
        let release = fetch.gate();

        let a = client.subscribe::<Value>("/admin/stats");
        let b = client.subscribe::<Value>("/admin/stats");
        wait_for_calls(&fetch, 1).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        release.send(Ok(json!({"total_issues": 5}))).unwrap();
        a.settled().await;
        b.settled().await;

        assert_eq!(fetch.calls(), 1);
        assert_eq!(a.data(), Some(json!({"total_issues": 5})));
        assert_eq!(b.data(), Some(json!({"total_issues": 5})));
        assert!(client.lock_in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_identical_reads_before_response() {
        let (_fetch, _clock, client) = setup();
        client
            .store()
            .set(&format!("{}/admin/stats", BASE), json!({"total_issues": 9}));

        let a = client.subscribe::<Value>("/admin/stats");
        let b = client.subscribe::<Value>("/admin/stats");
        assert_eq!(a.data(), b.data());
        assert_eq!(a.snapshot().updated_at(), b.snapshot().updated_at());
    }

    #[tokio::test]
    async fn test_typed_subscription_ignores_incompatible_cache() {
        #[derive(Debug, Clone, PartialEq, Deserialize)]
        struct Stats {
            total_issues: u32,
        }

        let (fetch, _clock, client) = setup();
        client
            .store()
            .set(&format!("{}/admin/stats", BASE), json!({"old_shape": true}));
        fetch.reply(Ok(json!({"total_issues": 3})));

        let sub = client.subscribe::<Stats>("/admin/stats");
        assert!(sub.data().is_none());
        assert!(sub.is_loading());

        sub.settled().await;
        assert_eq!(sub.data(), Some(Stats { total_issues: 3 }));
    }

    #[tokio::test]
    async fn test_typed_subscription_rejects_wrong_shape() {
        #[derive(Debug, Clone, Deserialize)]
        struct Stats {
            #[allow(dead_code)]
            total_issues: u32,
        }

        let (fetch, _clock, client) = setup();
        fetch.reply(Ok(json!("not stats")));

        let sub = client.subscribe::<Stats>("/admin/stats");
        sub.settled().await;
        assert!(matches!(
            sub.error().as_deref(),
            Some(ApiError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_persisted_entry_survives_cold_start() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let key = format!("{}/admin/stats", BASE);
        {
            let store = CacheStore::with_disk(dir.path().to_path_buf())
                .unwrap()
                .with_clock(clock.clone());
            store.set(&key, json!({"total_issues": 42}));
        }

        clock.advance(TimeDelta::minutes(2));
        let fetch = Arc::new(ScriptedFetch::default());
        let store = CacheStore::with_disk(dir.path().to_path_buf())
            .unwrap()
            .with_clock(clock.clone())
            .with_ttl(Duration::from_secs(300));
        let client = CachedFetchClient::new(Arc::new(Arc::clone(&fetch)), Arc::new(store));

        let sub = client.subscribe::<Value>("/admin/stats");
        assert_eq!(sub.data(), Some(json!({"total_issues": 42})));
        assert!(!sub.is_loading());

        clock.advance(TimeDelta::minutes(4));
        let later = client.subscribe::<Value>("/admin/stats");
        assert_eq!(later.data(), Some(json!({"total_issues": 42})));
        assert!(later.is_loading());
    }
}
