use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::config::CacheConfig;
use crate::error::{FetchError, FetchResult};
use crate::key::QueryKey;
use crate::staleness::StaleTime;
use crate::store::{CacheStore, Subscription};
use crate::time::Instant;

/// Cloneable handle to a fetch attempt; any number of callers can await the
/// same attempt's outcome.
pub type SharedFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// The caller-supplied fetch function of a plain query.
pub type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

/// Lifecycle of a cache entry or mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing fetched yet.
    Idle,
    /// A fetch attempt is running.
    Loading,
    /// The last applied attempt resolved successfully.
    Success,
    /// The last applied attempt failed.
    Error,
}

/// Immutable snapshot of one plain-query entry.
#[derive(Clone, Debug)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    /// Last successfully resolved value. Retained through refetches and
    /// failures, so consumers can keep rendering it.
    pub data: Option<T>,
    /// Last failure, cleared by the next successful resolution.
    pub error: Option<FetchError>,
    /// Time of the last successful resolution.
    pub updated_at: Option<Instant>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            updated_at: None,
        }
    }
}

impl<T> QueryState<T> {
    /// True only while the first ever fetch for the key is running; a
    /// background refresh over existing data does not count.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading && self.data.is_none()
    }
}

/// Per-trigger options of a plain query.
#[derive(Clone)]
pub struct QueryOptions<T> {
    pub(crate) query_fn: QueryFn<T>,
    pub(crate) stale_time: StaleTime,
    pub(crate) enabled: bool,
}

impl<T> QueryOptions<T> {
    /// Creates options around the given fetch function, with data stale
    /// immediately and the query enabled.
    pub fn new<F, Fut>(query_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        Self {
            query_fn: Arc::new(move || query_fn().boxed()),
            stale_time: StaleTime::default(),
            enabled: true,
        }
    }

    /// How long a successful resolution counts as fresh.
    pub fn stale_time(mut self, stale_time: impl Into<StaleTime>) -> Self {
        self.stale_time = stale_time.into();
        self
    }

    /// A disabled query never fetches; triggers are no-ops.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

enum Trigger<T> {
    /// An attempt is already outstanding; its handle is shared.
    Reuse(SharedFetch<T>),
    /// Data is fresh, nothing to do.
    Fresh,
    /// A new attempt was installed and needs spawning.
    Start(SharedFetch<T>),
}

/// A keyed cache of async query results.
///
/// One `QueryCache` holds one result type; construct one instance per payload
/// type and share it by cloning (clones are handles to the same cache).
/// Entries are created lazily on first subscription or first trigger and are
/// mutated only by the cache itself; consumers observe them through tear-free
/// snapshots and subscriptions.
///
/// Fetch attempts are spawned onto the ambient tokio runtime, so triggers
/// must happen within one.
pub struct QueryCache<T> {
    store: CacheStore<QueryState<T>, SharedFetch<T>>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<T> Default for QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T> QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: CacheStore::new(config),
        }
    }

    /// Read-only, tear-free view of the entry for `key`.
    pub fn snapshot(&self, key: &QueryKey) -> Option<Arc<QueryState<T>>> {
        self.store.snapshot(key)
    }

    /// Registers a listener that is called with a snapshot after every
    /// entry update. Dropping the returned [`Subscription`] unregisters it.
    pub fn subscribe(
        &self,
        key: &QueryKey,
        listener: impl Fn(&QueryState<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(key, Arc::new(listener))
    }

    /// Subscribes to `key` and ensures it is fresh, returning a handle that
    /// mirrors the entry until dropped.
    pub fn query(&self, key: impl Into<QueryKey>, options: QueryOptions<T>) -> QueryHandle<T> {
        let key = key.into();
        let subscription = self.store.subscribe(&key, Arc::new(|_| {}));
        self.ensure_fresh(&key, &options);
        QueryHandle {
            cache: self.clone(),
            key,
            options,
            _subscription: subscription,
        }
    }

    /// Fetches `key` unless fresh data or an outstanding attempt makes that
    /// redundant.
    ///
    /// Returns the in-flight handle when an attempt is running (newly started
    /// or reused), `None` when the trigger was a no-op. Stale data stays
    /// visible while the new attempt runs.
    pub fn ensure_fresh(&self, key: &QueryKey, options: &QueryOptions<T>) -> Option<SharedFetch<T>> {
        self.trigger(key, options, false)
    }

    /// Fetches `key` regardless of freshness. An attempt already in flight is
    /// reused rather than duplicated.
    pub fn refetch(&self, key: &QueryKey, options: &QueryOptions<T>) -> Option<SharedFetch<T>> {
        self.trigger(key, options, true)
    }

    /// Marks the entry stale and supersedes any outstanding attempt, so the
    /// next trigger fetches fresh data and a late completion of the old
    /// attempt is discarded.
    pub fn invalidate(&self, key: &QueryKey) {
        let invalidated = self
            .store
            .with_existing_slot(key, |slot| {
                slot.attempt = self.store.next_attempt();
                slot.in_flight = None;
                let state = Arc::clone(&slot.state);
                slot.state = Arc::new(QueryState {
                    status: state.status,
                    data: state.data.clone(),
                    error: state.error.clone(),
                    updated_at: None,
                });
            })
            .is_some();
        if invalidated {
            tracing::trace!(cache = %self.store.config().name, key = %key, "invalidated entry");
            self.store.notify(key);
        }
    }

    /// Drops the entry for `key` outright. Returns whether it existed.
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.store.remove(key)
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of live entries, subscribed or not.
    pub fn entry_count(&self) -> usize {
        self.store.entry_count()
    }

    fn trigger(
        &self,
        key: &QueryKey,
        options: &QueryOptions<T>,
        force: bool,
    ) -> Option<SharedFetch<T>> {
        if !options.enabled {
            return None;
        }

        let outcome = self.store.with_slot(key, |slot| {
            if let Some(fetch) = &slot.in_flight {
                return Trigger::Reuse(fetch.clone());
            }
            let state = Arc::clone(&slot.state);
            if !force
                && state.status == QueryStatus::Success
                && !options.stale_time.is_stale(state.updated_at, Instant::now())
            {
                return Trigger::Fresh;
            }

            let attempt = self.store.next_attempt();
            slot.attempt = attempt;
            slot.state = Arc::new(QueryState {
                status: QueryStatus::Loading,
                data: state.data.clone(),
                error: state.error.clone(),
                updated_at: state.updated_at,
            });

            let query_fn = Arc::clone(&options.query_fn);
            let cache = self.clone();
            let key = key.clone();
            let fetch: SharedFetch<T> = async move {
                let result = (*query_fn)().await;
                cache.apply(&key, attempt, &result);
                result
            }
            .boxed()
            .shared();
            slot.in_flight = Some(fetch.clone());
            Trigger::Start(fetch)
        });

        match outcome {
            Trigger::Reuse(fetch) => Some(fetch),
            Trigger::Fresh => None,
            Trigger::Start(fetch) => {
                tracing::trace!(cache = %self.store.config().name, key = %key, force, "starting fetch attempt");
                // Drive the attempt to completion even if no caller awaits it.
                tokio::spawn(fetch.clone());
                self.store.notify(key);
                Some(fetch)
            }
        }
    }

    fn apply(&self, key: &QueryKey, attempt: u64, result: &FetchResult<T>) {
        let applied = self
            .store
            .with_existing_slot(key, |slot| {
                if slot.attempt != attempt {
                    return false;
                }
                let state = Arc::clone(&slot.state);
                slot.state = Arc::new(match result {
                    Ok(data) => QueryState {
                        status: QueryStatus::Success,
                        data: Some(data.clone()),
                        error: None,
                        updated_at: Some(Instant::now()),
                    },
                    Err(error) => QueryState {
                        status: QueryStatus::Error,
                        data: state.data.clone(),
                        error: Some(error.clone()),
                        updated_at: state.updated_at,
                    },
                });
                slot.in_flight = None;
                true
            })
            .unwrap_or(false);

        if applied {
            self.store.notify(key);
        } else {
            tracing::trace!(
                cache = %self.store.config().name,
                key = %key,
                attempt,
                "discarding result of superseded fetch attempt",
            );
        }
    }
}

/// Live view of one query entry: subscribed while it exists, with accessors
/// over the current snapshot.
pub struct QueryHandle<T> {
    cache: QueryCache<T>,
    key: QueryKey,
    options: QueryOptions<T>,
    _subscription: Subscription,
}

impl<T> QueryHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The entry's current snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.cache
            .snapshot(&self.key)
            .map(|state| (*state).clone())
            .unwrap_or_default()
    }

    pub fn data(&self) -> Option<T> {
        self.state().data
    }

    /// True only while the first ever fetch is running (no data resolved
    /// yet); background refreshes do not count.
    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn error(&self) -> Option<FetchError> {
        self.state().error
    }

    /// Forces a refetch, joining an attempt already in flight.
    pub fn refetch(&self) -> Option<SharedFetch<T>> {
        self.cache.refetch(&self.key, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use requery_test::CallCounter;

    use super::*;

    fn counting_options(calls: &CallCounter, value: &'static str) -> QueryOptions<String> {
        let calls = calls.clone();
        QueryOptions::new(move || {
            calls.increment();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value.to_string())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_share_one_call() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("users");
        let calls = CallCounter::default();
        let options = counting_options(&calls, "alice,bob");

        let first = cache.ensure_fresh(&key, &options).expect("fetch started");
        let second = cache.ensure_fresh(&key, &options).expect("fetch in flight");
        let third = cache.refetch(&key, &options).expect("refetch joins the in-flight attempt");

        let (a, b, c) = futures::join!(first, second, third);
        assert_eq!(a.unwrap(), "alice,bob");
        assert_eq!(b.unwrap(), "alice,bob");
        assert_eq!(c.unwrap(), "alice,bob");
        assert_eq!(calls.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_data_skips_fetch() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("user");
        let calls = CallCounter::default();
        let options = counting_options(&calls, "ada").stale_time(Duration::from_secs(30));

        cache.ensure_fresh(&key, &options).unwrap().await.unwrap();
        assert_eq!(calls.count(), 1);

        // Within the stale window nothing is fetched.
        assert!(cache.ensure_fresh(&key, &options).is_none());
        assert_eq!(calls.count(), 1);

        // A forced refetch goes out regardless.
        cache.refetch(&key, &options).unwrap().await.unwrap();
        assert_eq!(calls.count(), 2);

        // Past the stale window a plain trigger fetches again.
        tokio::time::advance(Duration::from_secs(31)).await;
        cache.ensure_fresh(&key, &options).unwrap().await.unwrap();
        assert_eq!(calls.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate_keeps_data() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("user");
        let values = Arc::new(Mutex::new(vec!["v1", "v2"].into_iter()));
        let options = QueryOptions::new(move || {
            let value = values.lock().unwrap().next().unwrap();
            async move { Ok(value.to_string()) }
        });

        cache.ensure_fresh(&key, &options).unwrap().await.unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let _sub = cache.subscribe(&key, {
            let observed = Arc::clone(&observed);
            move |state: &QueryState<String>| {
                observed.lock().unwrap().push((state.status, state.data.clone()));
            }
        });

        // Default stale time: immediately stale, so this refetches.
        let fetch = cache.ensure_fresh(&key, &options).expect("stale data refetches");
        let during = cache.snapshot(&key).unwrap();
        assert_eq!(during.status, QueryStatus::Loading);
        assert_eq!(during.data.as_deref(), Some("v1"));
        assert!(!during.is_loading(), "background refresh is not a first load");

        fetch.await.unwrap();
        assert_eq!(cache.snapshot(&key).unwrap().data.as_deref(), Some("v2"));

        let observed = observed.lock().unwrap();
        assert!(!observed.is_empty());
        assert!(observed.iter().all(|(_, data)| data.is_some()), "data never transiently cleared");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_good_data() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("user");
        let attempts = Arc::new(Mutex::new(0u32));
        let options = QueryOptions::new(move || {
            let mut attempts = attempts.lock().unwrap();
            *attempts += 1;
            let succeed = *attempts == 1;
            async move {
                if succeed {
                    Ok("good".to_string())
                } else {
                    Err(FetchError::from("backend unavailable"))
                }
            }
        });

        cache.ensure_fresh(&key, &options).unwrap().await.unwrap();
        let refetched = cache.ensure_fresh(&key, &options).unwrap().await;
        assert!(refetched.is_err());

        let state = cache.snapshot(&key).unwrap();
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.error.as_ref().unwrap().message(), "backend unavailable");
        assert_eq!(state.data.as_deref(), Some("good"), "last good data retained");
        assert!(state.updated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_fetches() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("user");
        let calls = CallCounter::default();
        let options = counting_options(&calls, "ignored").enabled(false);

        assert!(cache.ensure_fresh(&key, &options).is_none());
        assert!(cache.refetch(&key, &options).is_none());
        assert_eq!(calls.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completion_resolved_by_attempt_order() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("user");

        let (tx_a, rx_a) = tokio::sync::oneshot::channel::<&str>();
        let (tx_b, rx_b) = tokio::sync::oneshot::channel::<&str>();
        let receivers = Arc::new(Mutex::new(vec![rx_a, rx_b].into_iter()));
        let options = QueryOptions::new(move || {
            let rx = receivers.lock().unwrap().next().unwrap();
            async move { Ok(rx.await.unwrap().to_string()) }
        });

        let fetch_a = cache.ensure_fresh(&key, &options).expect("first attempt started");
        // Let the first attempt take its channel before starting the second.
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        cache.invalidate(&key);
        let fetch_b = cache.ensure_fresh(&key, &options).expect("second attempt started");

        tx_b.send("from-b").unwrap();
        assert_eq!(fetch_b.await.unwrap(), "from-b");

        // The superseded attempt resolves late; its caller still sees the
        // value, the entry does not.
        tx_a.send("from-a").unwrap();
        assert_eq!(fetch_a.await.unwrap(), "from-a");

        let state = cache.snapshot(&key).unwrap();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data.as_deref(), Some("from-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_marks_stale() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let key = QueryKey::from("user");
        let calls = CallCounter::default();
        let options = counting_options(&calls, "v").stale_time(StaleTime::Forever);

        cache.ensure_fresh(&key, &options).unwrap().await.unwrap();
        assert!(cache.ensure_fresh(&key, &options).is_none(), "never stale");

        cache.invalidate(&key);
        let state = cache.snapshot(&key).unwrap();
        assert_eq!(state.data.as_deref(), Some("v"), "data survives invalidation");
        assert!(state.updated_at.is_none());

        cache.ensure_fresh(&key, &options).unwrap().await.unwrap();
        assert_eq!(calls.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_lifecycle() {
        requery_test::setup();
        let cache = QueryCache::<String>::default();
        let calls = CallCounter::default();
        let options = counting_options(&calls, "ada").stale_time(Duration::from_secs(30));

        let handle = cache.query("user", options.clone());
        assert!(handle.is_loading());
        assert_eq!(handle.data(), None);

        handle.refetch(); // joins the in-flight attempt
        let fetch = cache.ensure_fresh(&QueryKey::from("user"), &options).unwrap();
        fetch.await.unwrap();

        assert_eq!(calls.count(), 1);
        assert!(!handle.is_loading());
        assert_eq!(handle.data().as_deref(), Some("ada"));
        assert!(handle.error().is_none());
    }
}
