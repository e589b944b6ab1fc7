use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::config::CacheConfig;
use crate::error::{FetchError, FetchResult};
use crate::key::QueryKey;
use crate::query::{QueryStatus, SharedFetch};
use crate::staleness::StaleTime;
use crate::store::{CacheStore, Subscription};
use crate::time::Instant;

/// The caller-supplied fetch function of an infinite query; receives the page
/// param of the page to fetch.
pub type PageFn<T, P> = Arc<dyn Fn(P) -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

/// Derives the next page param from the last fetched page; `None` means the
/// list is exhausted.
pub type NextPageParamFn<T, P> = Arc<dyn Fn(&T) -> Option<P> + Send + Sync>;

/// Immutable snapshot of one infinite-query entry.
///
/// `pages` and `page_params` are parallel sequences: `page_params[i]` is the
/// param that fetched `pages[i]`.
#[derive(Clone, Debug)]
pub struct InfiniteState<T, P> {
    pub status: QueryStatus,
    pub pages: Vec<T>,
    pub page_params: Vec<P>,
    /// Whether the cursor function produced a param for the page after the
    /// last one.
    pub has_next_page: bool,
    /// Whether a next-page attempt is outstanding.
    pub fetching_next_page: bool,
    /// Last failure, cleared by the next successful resolution.
    pub error: Option<FetchError>,
    /// Time of the last successful resolution (initial or next-page).
    pub updated_at: Option<Instant>,
}

impl<T, P> Default for InfiniteState<T, P> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            pages: Vec::new(),
            page_params: Vec::new(),
            has_next_page: false,
            fetching_next_page: false,
            error: None,
            updated_at: None,
        }
    }
}

impl<T, P> InfiniteState<T, P> {
    /// True only while the first page is being fetched for the first time.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading && self.pages.is_empty()
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    /// Iterates the items of all pages in arrival order.
    pub fn items<'s>(&'s self) -> impl Iterator<Item = <&'s T as IntoIterator>::Item> + 's
    where
        &'s T: IntoIterator,
    {
        self.pages.iter().flat_map(|page| page.into_iter())
    }

    /// Total item count across all pages.
    pub fn total_items<'s>(&'s self) -> usize
    where
        &'s T: IntoIterator,
    {
        self.pages.iter().map(|page| page.into_iter().count()).sum()
    }
}

/// Per-trigger options of an infinite query.
#[derive(Clone)]
pub struct InfiniteQueryOptions<T, P> {
    pub(crate) query_fn: PageFn<T, P>,
    pub(crate) get_next_page_param: NextPageParamFn<T, P>,
    pub(crate) initial_page_param: P,
    pub(crate) stale_time: StaleTime,
    pub(crate) enabled: bool,
}

impl<T, P> InfiniteQueryOptions<T, P> {
    pub fn new<F, Fut, N>(query_fn: F, get_next_page_param: N, initial_page_param: P) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
        N: Fn(&T) -> Option<P> + Send + Sync + 'static,
    {
        Self {
            query_fn: Arc::new(move |param| query_fn(param).boxed()),
            get_next_page_param: Arc::new(get_next_page_param),
            initial_page_param,
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
    Reuse(SharedFetch<T>),
    Fresh,
    Start(SharedFetch<T>),
}

/// A keyed cache of paginated query results.
///
/// Works like [`QueryCache`](crate::QueryCache) for the first page, and
/// accumulates further pages through [`fetch_next_page`](Self::fetch_next_page)
/// with the same deduplication and attempt-ordering discipline. At most one
/// attempt of any kind is in flight per entry.
pub struct InfiniteQueryCache<T, P> {
    store: CacheStore<InfiniteState<T, P>, SharedFetch<T>>,
}

impl<T, P> Clone for InfiniteQueryCache<T, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<T, P> Default for InfiniteQueryCache<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T, P> InfiniteQueryCache<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: CacheStore::new(config),
        }
    }

    /// Read-only, tear-free view of the entry for `key`.
    pub fn snapshot(&self, key: &QueryKey) -> Option<Arc<InfiniteState<T, P>>> {
        self.store.snapshot(key)
    }

    /// Registers a listener that is called with a snapshot after every entry
    /// update. Dropping the returned [`Subscription`] unregisters it.
    pub fn subscribe(
        &self,
        key: &QueryKey,
        listener: impl Fn(&InfiniteState<T, P>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(key, Arc::new(listener))
    }

    /// Subscribes to `key` and ensures its first page is fresh, returning a
    /// handle that mirrors the entry until dropped.
    pub fn query(
        &self,
        key: impl Into<QueryKey>,
        options: InfiniteQueryOptions<T, P>,
    ) -> InfiniteQueryHandle<T, P> {
        let key = key.into();
        let subscription = self.store.subscribe(&key, Arc::new(|_| {}));
        self.ensure_fresh(&key, &options);
        InfiniteQueryHandle {
            cache: self.clone(),
            key,
            options,
            _subscription: subscription,
        }
    }

    /// Fetches the first page unless fresh data or an outstanding attempt
    /// makes that redundant.
    ///
    /// A stale re-trigger replaces the accumulated page list with the fresh
    /// first page once it resolves; until then the previous pages remain
    /// visible.
    pub fn ensure_fresh(
        &self,
        key: &QueryKey,
        options: &InfiniteQueryOptions<T, P>,
    ) -> Option<SharedFetch<T>> {
        self.trigger(key, options, false)
    }

    /// Fetches the first page regardless of freshness, joining an attempt
    /// already in flight.
    pub fn refetch(
        &self,
        key: &QueryKey,
        options: &InfiniteQueryOptions<T, P>,
    ) -> Option<SharedFetch<T>> {
        self.trigger(key, options, true)
    }

    /// Fetches the page after the last one, if the cursor function produced a
    /// param for it.
    ///
    /// No-op when the list is exhausted, when no page was fetched yet, or
    /// while any attempt for the entry is outstanding (the outstanding handle
    /// is returned instead of issuing a second call).
    pub fn fetch_next_page(
        &self,
        key: &QueryKey,
        options: &InfiniteQueryOptions<T, P>,
    ) -> Option<SharedFetch<T>> {
        // Inspect under lock; the cursor function runs outside of it.
        let last_page = self.store.with_existing_slot(key, |slot| {
            if let Some(fetch) = &slot.in_flight {
                return Err(Some(fetch.clone()));
            }
            let state = &slot.state;
            if !state.has_next_page {
                return Err(None);
            }
            let Some(last) = state.pages.last() else {
                return Err(None);
            };
            Ok(last.clone())
        });
        let last_page = match last_page {
            None | Some(Err(None)) => return None,
            Some(Err(Some(fetch))) => return Some(fetch),
            Some(Ok(page)) => page,
        };

        let Some(param) = (*options.get_next_page_param)(&last_page) else {
            // Exhausted; record it so further calls no-op cheaply.
            let changed = self
                .store
                .with_existing_slot(key, |slot| {
                    if slot.state.has_next_page {
                        let mut state = (*slot.state).clone();
                        state.has_next_page = false;
                        slot.state = Arc::new(state);
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if changed {
                self.store.notify(key);
            }
            return None;
        };

        let outcome = self.store.with_existing_slot(key, |slot| {
            // Re-check: another trigger may have won the race meanwhile.
            if let Some(fetch) = &slot.in_flight {
                return Trigger::Reuse(fetch.clone());
            }
            if !slot.state.has_next_page || slot.state.pages.is_empty() {
                return Trigger::Fresh;
            }

            let attempt = self.store.next_attempt();
            slot.attempt = attempt;
            let mut state = (*slot.state).clone();
            state.fetching_next_page = true;
            slot.state = Arc::new(state);

            let query_fn = Arc::clone(&options.query_fn);
            let get_next = Arc::clone(&options.get_next_page_param);
            let cache = self.clone();
            let key = key.clone();
            let param = param.clone();
            let fetch: SharedFetch<T> = async move {
                let result = (*query_fn)(param.clone()).await;
                cache.apply_next_page(&key, attempt, param, &get_next, &result);
                result
            }
            .boxed()
            .shared();
            slot.in_flight = Some(fetch.clone());
            Trigger::Start(fetch)
        })?;

        match outcome {
            Trigger::Reuse(fetch) => Some(fetch),
            Trigger::Fresh => None,
            Trigger::Start(fetch) => {
                tracing::trace!(cache = %self.store.config().name, key = %key, "fetching next page");
                tokio::spawn(fetch.clone());
                self.store.notify(key);
                Some(fetch)
            }
        }
    }

    /// Marks the entry stale and supersedes any outstanding attempt; see
    /// [`QueryCache::invalidate`](crate::QueryCache::invalidate).
    pub fn invalidate(&self, key: &QueryKey) {
        let invalidated = self
            .store
            .with_existing_slot(key, |slot| {
                slot.attempt = self.store.next_attempt();
                slot.in_flight = None;
                let mut state = (*slot.state).clone();
                state.fetching_next_page = false;
                state.updated_at = None;
                slot.state = Arc::new(state);
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
        options: &InfiniteQueryOptions<T, P>,
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
            let mut loading = (*state).clone();
            loading.status = QueryStatus::Loading;
            loading.fetching_next_page = false;
            slot.state = Arc::new(loading);

            let query_fn = Arc::clone(&options.query_fn);
            let get_next = Arc::clone(&options.get_next_page_param);
            let initial_param = options.initial_page_param.clone();
            let cache = self.clone();
            let key = key.clone();
            let fetch: SharedFetch<T> = async move {
                let result = (*query_fn)(initial_param.clone()).await;
                cache.apply_first_page(&key, attempt, initial_param, &get_next, &result);
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
                tracing::trace!(cache = %self.store.config().name, key = %key, force, "fetching first page");
                tokio::spawn(fetch.clone());
                self.store.notify(key);
                Some(fetch)
            }
        }
    }

    /// Applies an initial-fetch result: the fresh first page replaces the
    /// whole accumulated list.
    fn apply_first_page(
        &self,
        key: &QueryKey,
        attempt: u64,
        param: P,
        get_next: &NextPageParamFn<T, P>,
        result: &FetchResult<T>,
    ) {
        let has_next = match result {
            Ok(page) => (**get_next)(page).is_some(),
            Err(_) => false,
        };

        let applied = self
            .store
            .with_existing_slot(key, |slot| {
                if slot.attempt != attempt {
                    return false;
                }
                let state = Arc::clone(&slot.state);
                slot.state = Arc::new(match result {
                    Ok(page) => InfiniteState {
                        status: QueryStatus::Success,
                        pages: vec![page.clone()],
                        page_params: vec![param.clone()],
                        has_next_page: has_next,
                        fetching_next_page: false,
                        error: None,
                        updated_at: Some(Instant::now()),
                    },
                    Err(error) => InfiniteState {
                        status: QueryStatus::Error,
                        pages: state.pages.clone(),
                        page_params: state.page_params.clone(),
                        has_next_page: state.has_next_page,
                        fetching_next_page: false,
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
                "discarding result of superseded first-page attempt",
            );
        }
    }

    fn apply_next_page(
        &self,
        key: &QueryKey,
        attempt: u64,
        param: P,
        get_next: &NextPageParamFn<T, P>,
        result: &FetchResult<T>,
    ) {
        let has_next = match result {
            Ok(page) => (**get_next)(page).is_some(),
            Err(_) => false,
        };

        let applied = self
            .store
            .with_existing_slot(key, |slot| {
                if slot.attempt != attempt {
                    return false;
                }
                let mut state = (*slot.state).clone();
                match result {
                    Ok(page) => {
                        state.status = QueryStatus::Success;
                        state.pages.push(page.clone());
                        state.page_params.push(param.clone());
                        state.has_next_page = has_next;
                        state.error = None;
                        state.updated_at = Some(Instant::now());
                    }
                    Err(error) => {
                        state.status = QueryStatus::Error;
                        state.error = Some(error.clone());
                    }
                }
                state.fetching_next_page = false;
                slot.state = Arc::new(state);
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
                "discarding result of superseded next-page attempt",
            );
        }
    }
}

/// Live view of one infinite-query entry; subscribed while it exists.
pub struct InfiniteQueryHandle<T, P> {
    cache: InfiniteQueryCache<T, P>,
    key: QueryKey,
    options: InfiniteQueryOptions<T, P>,
    _subscription: Subscription,
}

impl<T, P> InfiniteQueryHandle<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The entry's current snapshot.
    pub fn state(&self) -> InfiniteState<T, P> {
        self.cache
            .snapshot(&self.key)
            .map(|state| (*state).clone())
            .unwrap_or_default()
    }

    pub fn pages(&self) -> Vec<T> {
        self.state().pages
    }

    /// True only while the first page is being fetched for the first time.
    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn error(&self) -> Option<FetchError> {
        self.state().error
    }

    pub fn has_next_page(&self) -> bool {
        self.state().has_next_page
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.state().fetching_next_page
    }

    /// Fetches the page after the last one; see
    /// [`InfiniteQueryCache::fetch_next_page`].
    pub fn fetch_next_page(&self) -> Option<SharedFetch<T>> {
        self.cache.fetch_next_page(&self.key, &self.options)
    }

    /// Forces a first-page refetch, joining an attempt already in flight.
    pub fn refetch(&self) -> Option<SharedFetch<T>> {
        self.cache.refetch(&self.key, &self.options)
    }
}
