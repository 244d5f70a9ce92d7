use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use serde_json::Value;

use crate::{
    error::{CancelOptions, FetchError, QueryError},
    focus_manager::focus_manager,
    key::{hash_query_key, partial_match_key, QueryFilters, QueryKey, QueryTypeFilter},
    mutation_cache::MutationCache,
    notify_manager::notify_manager,
    online_manager::online_manager,
    query_cache::QueryCache,
    query_options::{DefaultOptions, MutationOptions, QueryOptions},
    query_state::{FetchStatus, QueryState},
    subscribable::Subscription,
    util::try_spawn_local,
};

/// Which queries an invalidation should refetch after marking them stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefetchType {
    /// Refetch matching queries with observers (the default).
    #[default]
    Active,
    /// Refetch matching queries without observers.
    Inactive,
    /// Refetch every matching query.
    All,
    /// Only mark stale; let observers refetch on their own triggers.
    None,
}

/// Construction-time wiring for a [`QueryClient`].
#[derive(Clone, Default)]
pub struct QueryClientConfig {
    /// An externally created query cache, e.g. one shared for inspection.
    pub query_cache: Option<QueryCache>,
    /// An externally created mutation cache, e.g. one carrying cache-level
    /// hooks.
    pub mutation_cache: Option<MutationCache>,
    /// Client-wide defaults.
    pub default_options: DefaultOptions,
}

/// The facade over both caches: data access, bulk operations, defaulting and
/// lifecycle wiring.
///
/// Cloning is shallow; clones share the caches. Timer-driven behavior (gc,
/// retry backoff) requires running inside a [`tokio::task::LocalSet`] on a
/// current-thread runtime.
#[derive(Clone)]
pub struct QueryClient {
    inner: Rc<QueryClientInner>,
}

struct QueryClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    default_options: RefCell<DefaultOptions>,
    query_defaults: RefCell<Vec<(QueryKey, QueryOptions)>>,
    mutation_defaults: RefCell<Vec<(QueryKey, MutationOptions)>>,
    mount_count: Cell<usize>,
    focus_subscription: RefCell<Option<Subscription>>,
    online_subscription: RefCell<Option<Subscription>>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// A client with fresh caches and no defaults.
    pub fn new() -> Self {
        Self::with_config(QueryClientConfig::default())
    }

    /// A client using the caches and defaults from `config`.
    pub fn with_config(config: QueryClientConfig) -> Self {
        Self {
            inner: Rc::new(QueryClientInner {
                query_cache: config.query_cache.unwrap_or_default(),
                mutation_cache: config.mutation_cache.unwrap_or_default(),
                default_options: RefCell::new(config.default_options),
                query_defaults: RefCell::new(Vec::new()),
                mutation_defaults: RefCell::new(Vec::new()),
                mount_count: Cell::new(0),
                focus_subscription: RefCell::new(None),
                online_subscription: RefCell::new(None),
            }),
        }
    }

    /// The underlying query cache.
    pub fn query_cache(&self) -> QueryCache {
        self.inner.query_cache.clone()
    }

    /// The underlying mutation cache.
    pub fn mutation_cache(&self) -> MutationCache {
        self.inner.mutation_cache.clone()
    }

    /// Hook the client up to the focus and online managers. Reference
    /// counted: the first mount subscribes, the matching last unmount
    /// unsubscribes.
    pub fn mount(&self) {
        let count = self.inner.mount_count.get() + 1;
        self.inner.mount_count.set(count);
        if count != 1 {
            return;
        }
        let focus_client = self.clone();
        let focus = focus_manager().subscribe(move |focused| {
            if focused {
                focus_client.resume_then(|client| client.query_cache().on_focus());
            }
        });
        let online_client = self.clone();
        let online = online_manager().subscribe(move |online| {
            if online {
                online_client.resume_then(|client| client.query_cache().on_online());
            }
        });
        *self.inner.focus_subscription.borrow_mut() = Some(focus);
        *self.inner.online_subscription.borrow_mut() = Some(online);
    }

    /// Undo one [`mount`](QueryClient::mount).
    pub fn unmount(&self) {
        let count = self.inner.mount_count.get();
        if count == 0 {
            return;
        }
        self.inner.mount_count.set(count - 1);
        if count == 1 {
            self.inner.focus_subscription.borrow_mut().take();
            self.inner.online_subscription.borrow_mut().take();
        }
    }

    fn resume_then(&self, after: impl Fn(&QueryClient) + 'static) {
        let after = Rc::new(after);
        let client = self.clone();
        let spawned = {
            let after = after.clone();
            try_spawn_local(async move {
                client.resume_paused_mutations().await;
                after(&client);
            })
        };
        if spawned.is_none() {
            after(self);
        }
    }

    /// The cached data for a key, if any.
    pub fn get_query_data(&self, query_key: &QueryKey) -> Option<Rc<Value>> {
        self.inner
            .query_cache
            .find(query_key.clone().into())
            .and_then(|query| query.state().data)
    }

    /// The full cached state for a key, if any.
    pub fn get_query_state(&self, query_key: &QueryKey) -> Option<QueryState> {
        self.inner
            .query_cache
            .find(query_key.clone().into())
            .map(|query| query.state())
    }

    /// Key and data of every matching query that holds data.
    pub fn get_queries_data(&self, filters: QueryFilters) -> Vec<(QueryKey, Rc<Value>)> {
        self.inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .filter_map(|query| {
                query
                    .state()
                    .data
                    .map(|data| (query.query_key().clone(), data))
            })
            .collect()
    }

    /// Write data for a key, creating the entry if absent. Structural
    /// sharing applies, so writing equal data keeps the old allocation and
    /// produces no observer notification.
    pub fn set_query_data(&self, query_key: QueryKey, data: Value) -> Rc<Value> {
        let options = self.default_query_options(QueryOptions::new().set_query_key(query_key));
        let query = self.inner.query_cache.build(options, None);
        query.set_data(data, None)
    }

    /// Transform the cached data for a key. No-op when the key holds no data.
    pub fn update_query_data(
        &self,
        query_key: &QueryKey,
        updater: impl FnOnce(&Value) -> Value,
    ) -> Option<Rc<Value>> {
        let current = self.get_query_data(query_key)?;
        Some(self.set_query_data(query_key.clone(), updater(&current)))
    }

    /// Write the same data into every matching query.
    pub fn set_queries_data(
        &self,
        filters: QueryFilters,
        data: Value,
    ) -> Vec<(QueryKey, Rc<Value>)> {
        notify_manager().batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| {
                    (
                        query.query_key().clone(),
                        query.set_data(data.clone(), None),
                    )
                })
                .collect()
        })
    }

    /// Mark matching queries stale and refetch the active ones.
    pub async fn invalidate_queries(&self, filters: QueryFilters) {
        self.invalidate_queries_with(filters, RefetchType::Active)
            .await;
    }

    /// Mark matching queries stale, then refetch per `refetch`. Refetch
    /// failures land in each query's own state rather than propagating.
    pub async fn invalidate_queries_with(&self, filters: QueryFilters, refetch: RefetchType) {
        notify_manager().batch(|| {
            for query in self.inner.query_cache.find_all(filters.clone()) {
                query.invalidate();
            }
        });
        let query_type = match refetch {
            RefetchType::Active => QueryTypeFilter::Active,
            RefetchType::Inactive => QueryTypeFilter::Inactive,
            RefetchType::All => QueryTypeFilter::All,
            RefetchType::None => return,
        };
        let refetch_filters = QueryFilters {
            query_type,
            ..filters
        };
        let _ = self.refetch_queries(refetch_filters).await;
    }

    /// Refetch matching enabled queries, replacing fetches already in
    /// flight. Resolves once all settle; the first fetch error is returned.
    pub async fn refetch_queries(&self, filters: QueryFilters) -> Result<(), FetchError> {
        let promises: Vec<_> = notify_manager().batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .filter(|query| query.options().is_enabled())
                .map(|query| query.fetch(true))
                .collect()
        });
        let mut first_error = None;
        for result in futures::future::join_all(promises).await {
            if let Err(QueryError::Fetch(error)) = result {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Cancel in-flight fetches of matching queries, reverting each to its
    /// pre-fetch state, and wait for them to settle.
    pub async fn cancel_queries(&self, filters: QueryFilters) {
        let waits: Vec<_> = self
            .inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .map(|query| query.cancel(CancelOptions::reverting()))
            .collect();
        futures::future::join_all(waits).await;
    }

    /// Drop matching queries from the cache entirely.
    pub fn remove_queries(&self, filters: QueryFilters) {
        notify_manager().batch(|| {
            for query in self.inner.query_cache.find_all(filters.clone()) {
                self.inner.query_cache.remove(&query);
            }
        });
    }

    /// Put matching queries back to their initial state, then refetch the
    /// active ones.
    pub async fn reset_queries(&self, filters: QueryFilters) -> Result<(), FetchError> {
        notify_manager().batch(|| {
            for query in self.inner.query_cache.find_all(filters.clone()) {
                query.reset();
            }
        });
        let refetch_filters = QueryFilters {
            query_type: QueryTypeFilter::Active,
            ..filters
        };
        self.refetch_queries(refetch_filters).await
    }

    /// Fetch a query imperatively, serving cached data when it is still
    /// fresh under the options' `stale_time`.
    pub async fn fetch_query(&self, options: QueryOptions) -> Result<Rc<Value>, QueryError> {
        let options = self.default_query_options(options);
        if options.query_key.is_none() {
            return Err(QueryError::Fetch(FetchError::new(
                "query options require a query key",
            )));
        }
        let query = self.inner.query_cache.build(options.clone(), None);
        if !query.is_stale_by_time(options.resolved_stale_time()) {
            if let Some(data) = query.state().data {
                return Ok(data);
            }
        }
        query.fetch(false).await
    }

    /// Like [`fetch_query`](QueryClient::fetch_query) but outcome-blind:
    /// errors stay in the cache entry for later consumers.
    pub async fn prefetch_query(&self, options: QueryOptions) {
        let _ = self.fetch_query(options).await;
    }

    /// Serve cached data for the options' key regardless of freshness,
    /// fetching only when the cache holds none.
    pub async fn ensure_query_data(&self, options: QueryOptions) -> Result<Rc<Value>, QueryError> {
        if let Some(key) = &options.query_key {
            if let Some(data) = self.get_query_data(key) {
                return Ok(data);
            }
        }
        self.fetch_query(options).await
    }

    /// How many matching queries are actively fetching.
    pub fn is_fetching(&self, filters: QueryFilters) -> usize {
        let filters = QueryFilters {
            fetch_status: Some(FetchStatus::Fetching),
            ..filters
        };
        self.inner.query_cache.find_all(filters).len()
    }

    /// How many mutations are currently pending (including paused ones).
    pub fn is_mutating(&self) -> usize {
        self.inner
            .mutation_cache
            .get_all()
            .into_iter()
            .filter(|mutation| {
                mutation.state().status == crate::mutation::MutationStatus::Pending
            })
            .count()
    }

    /// Resume every paused mutation, in submission order.
    pub async fn resume_paused_mutations(&self) {
        self.inner.mutation_cache.resume_paused_mutations().await;
    }

    /// Register defaults for every query whose key starts with `query_key`.
    /// Registering the same prefix again replaces the earlier entry.
    pub fn set_query_defaults(&self, query_key: QueryKey, options: QueryOptions) {
        let mut defaults = self.inner.query_defaults.borrow_mut();
        if let Some(entry) = defaults.iter_mut().find(|(key, _)| *key == query_key) {
            entry.1 = options;
        } else {
            defaults.push((query_key, options));
        }
    }

    /// The merged prefix defaults applying to `query_key`, in registration
    /// order (earlier registrations win for fields both set).
    pub fn get_query_defaults(&self, query_key: &QueryKey) -> QueryOptions {
        self.inner
            .query_defaults
            .borrow()
            .iter()
            .filter(|(prefix, _)| partial_match_key(query_key, prefix))
            .fold(QueryOptions::new(), |merged, (_, options)| {
                merged.merge(options)
            })
    }

    /// Register defaults for mutations whose key starts with `mutation_key`.
    pub fn set_mutation_defaults(&self, mutation_key: QueryKey, options: MutationOptions) {
        let mut defaults = self.inner.mutation_defaults.borrow_mut();
        if let Some(entry) = defaults.iter_mut().find(|(key, _)| *key == mutation_key) {
            entry.1 = options;
        } else {
            defaults.push((mutation_key, options));
        }
    }

    /// The merged prefix defaults applying to `mutation_key`.
    pub fn get_mutation_defaults(&self, mutation_key: &QueryKey) -> MutationOptions {
        self.inner
            .mutation_defaults
            .borrow()
            .iter()
            .filter(|(prefix, _)| partial_match_key(mutation_key, prefix))
            .fold(MutationOptions::new(), |merged, (_, options)| {
                merged.merge(options)
            })
    }

    /// Resolve `options` against prefix defaults and client defaults, and
    /// stamp in the key hash. Idempotent; already-defaulted options pass
    /// through untouched.
    pub fn default_query_options(&self, options: QueryOptions) -> QueryOptions {
        if options.defaulted {
            return options;
        }
        let mut merged = options;
        if let Some(key) = merged.query_key.clone() {
            merged = merged.merge(&self.get_query_defaults(&key));
        }
        merged = merged.merge(&self.inner.default_options.borrow().queries);
        if merged.query_hash.is_none() {
            if let Some(key) = &merged.query_key {
                merged.query_hash = Some(hash_query_key(key));
            }
        }
        merged.defaulted = true;
        merged
    }

    /// Resolve mutation options against prefix defaults and client defaults.
    pub fn default_mutation_options(&self, options: MutationOptions) -> MutationOptions {
        if options.defaulted {
            return options;
        }
        let mut merged = options;
        if let Some(key) = merged.mutation_key.clone() {
            merged = merged.merge(&self.get_mutation_defaults(&key));
        }
        merged = merged.merge(&self.inner.default_options.borrow().mutations);
        merged.defaulted = true;
        merged
    }

    /// Empty both caches.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query_key,
        query_options::{query_fn, RetryPolicy},
        util::test::{run_local, run_paused},
    };
    use serde_json::json;
    use std::{cell::Cell as StdCell, time::Duration};

    fn counting_fetcher(
        calls: Rc<StdCell<u32>>,
        payload: Value,
    ) -> crate::query_options::QueryFunction {
        query_fn(move |_key| {
            calls.set(calls.get() + 1);
            let payload = payload.clone();
            async move { Ok(payload) }
        })
    }

    #[test]
    fn fetch_query_serves_fresh_data_without_refetching() {
        run_local(async {
            let client = QueryClient::new();
            let calls = Rc::new(StdCell::new(0));
            let options = QueryOptions::new()
                .set_query_key(query_key!["todos"])
                .set_query_fn(counting_fetcher(calls.clone(), json!([1])))
                .set_stale_time(Duration::from_secs(3600));
            let first = client.fetch_query(options.clone()).await.expect("fetch");
            let second = client.fetch_query(options).await.expect("fetch");
            assert!(Rc::ptr_eq(&first, &second));
            assert_eq!(calls.get(), 1);
        });
    }

    #[test]
    fn seeded_entries_are_garbage_collected() {
        run_paused(async {
            let client = QueryClient::with_config(QueryClientConfig {
                default_options: DefaultOptions {
                    queries: QueryOptions::new().set_gc_time(Duration::from_secs(10)),
                    ..Default::default()
                },
                ..Default::default()
            });
            client.set_query_data(query_key!["seeded"], json!(1));
            tokio::time::advance(Duration::from_secs(9)).await;
            tokio::task::yield_now().await;
            assert_eq!(client.query_cache().get_all().len(), 1);
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
            assert!(client.query_cache().get_all().is_empty());
        });
    }

    #[test]
    fn resume_then_falls_back_to_synchronous_delivery_without_a_runtime() {
        let client = QueryClient::new();
        let called = Rc::new(StdCell::new(false));
        {
            let called = called.clone();
            client.resume_then(move |_client| called.set(true));
        }
        assert!(called.get());
    }

    #[test]
    fn fetch_query_refetches_stale_data() {
        run_local(async {
            let client = QueryClient::new();
            let calls = Rc::new(StdCell::new(0));
            let options = QueryOptions::new()
                .set_query_key(query_key!["todos"])
                .set_query_fn(counting_fetcher(calls.clone(), json!([1])));
            client.fetch_query(options.clone()).await.expect("fetch");
            client.fetch_query(options).await.expect("fetch");
            assert_eq!(calls.get(), 2);
        });
    }

    #[test]
    fn fetch_query_without_a_key_errors() {
        run_local(async {
            let client = QueryClient::new();
            let result = client
                .fetch_query(QueryOptions::new().set_query_fn(query_fn(|_key| async {
                    Ok(json!(1))
                })))
                .await;
            assert!(result.is_err());
        });
    }

    #[test]
    fn set_and_get_query_data_round_trip() {
        let client = QueryClient::new();
        let key = query_key!["todos", 1];
        assert!(client.get_query_data(&key).is_none());
        client.set_query_data(key.clone(), json!({ "title": "write tests" }));
        assert_eq!(
            client.get_query_data(&key),
            Some(Rc::new(json!({ "title": "write tests" })))
        );
        let state = client.get_query_state(&key).expect("state exists");
        assert_eq!(state.status, crate::QueryStatus::Success);
    }

    #[test]
    fn update_query_data_transforms_in_place() {
        let client = QueryClient::new();
        let key = query_key!["counter"];
        assert!(client.update_query_data(&key, |_| json!(1)).is_none());
        client.set_query_data(key.clone(), json!(1));
        let updated = client.update_query_data(&key, |value| {
            json!(value.as_i64().unwrap_or(0) + 1)
        });
        assert_eq!(updated, Some(Rc::new(json!(2))));
    }

    #[test]
    fn setting_equal_data_keeps_the_allocation() {
        let client = QueryClient::new();
        let key = query_key!["todos"];
        let first = client.set_query_data(key.clone(), json!({ "a": [1, 2] }));
        let second = client.set_query_data(key, json!({ "a": [1, 2] }));
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn set_queries_data_writes_every_match() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["todos", 1], json!(1));
        client.set_query_data(query_key!["todos", 2], json!(2));
        client.set_query_data(query_key!["posts"], json!(3));
        let written = client.set_queries_data(query_key!["todos"].into(), json!(0));
        assert_eq!(written.len(), 2);
        assert_eq!(
            client.get_query_data(&query_key!["todos", 1]),
            Some(Rc::new(json!(0)))
        );
        assert_eq!(
            client.get_query_data(&query_key!["posts"]),
            Some(Rc::new(json!(3)))
        );
    }

    #[test]
    fn invalidation_marks_matches_stale_and_refetches_active_only() {
        run_local(async {
            let client = QueryClient::new();
            let active_calls = Rc::new(StdCell::new(0));
            let inactive_calls = Rc::new(StdCell::new(0));

            let active_options = QueryOptions::new()
                .set_query_key(query_key!["todos", "active"])
                .set_query_fn(counting_fetcher(active_calls.clone(), json!("a")))
                .set_stale_time(Duration::from_secs(3600));
            let inactive_options = QueryOptions::new()
                .set_query_key(query_key!["todos", "inactive"])
                .set_query_fn(counting_fetcher(inactive_calls.clone(), json!("i")))
                .set_stale_time(Duration::from_secs(3600));

            client
                .fetch_query(active_options.clone())
                .await
                .expect("seed active");
            client
                .fetch_query(inactive_options)
                .await
                .expect("seed inactive");

            let observer = crate::QueryObserver::new(&client, active_options);
            let _subscription = observer.subscribe(|_result| {});
            assert_eq!(active_calls.get(), 1);

            client.invalidate_queries(query_key!["todos"].into()).await;

            assert_eq!(active_calls.get(), 2);
            assert_eq!(inactive_calls.get(), 1);
            let inactive_state = client
                .get_query_state(&query_key!["todos", "inactive"])
                .expect("state");
            assert!(inactive_state.is_invalidated);
        });
    }

    #[test]
    fn refetch_queries_surfaces_the_first_error() {
        run_local(async {
            let client = QueryClient::new();
            let options = QueryOptions::new()
                .set_query_key(query_key!["broken"])
                .set_retry(RetryPolicy::Never)
                .set_query_fn(query_fn(|_key| async {
                    Err::<Value, _>(FetchError::new("down"))
                }));
            let _ = client.fetch_query(options).await;
            let result = client.refetch_queries(query_key!["broken"].into()).await;
            assert_eq!(result, Err(FetchError::new("down")));
        });
    }

    #[test]
    fn cancel_queries_reverts_to_the_previous_data() {
        run_local(async {
            let client = QueryClient::new();
            let key = query_key!["slow"];
            client.set_query_data(key.clone(), json!("old"));
            let query = client
                .query_cache()
                .build(
                    client.default_query_options(
                        QueryOptions::new()
                            .set_query_key(key.clone())
                            .set_query_fn(query_fn(|_key| async {
                                futures::future::pending::<()>().await;
                                Ok(json!("new"))
                            })),
                    ),
                    None,
                )
                .clone();
            let promise = query.fetch(false);
            client.cancel_queries(key.clone().into()).await;
            let _ = promise.await;
            assert_eq!(client.get_query_data(&key), Some(Rc::new(json!("old"))));
            assert_eq!(
                client.get_query_state(&key).expect("state").fetch_status,
                FetchStatus::Idle
            );
        });
    }

    #[test]
    fn remove_queries_drops_matching_entries() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["todos", 1], json!(1));
        client.set_query_data(query_key!["posts"], json!(2));
        client.remove_queries(query_key!["todos"].into());
        assert!(client.get_query_data(&query_key!["todos", 1]).is_none());
        assert!(client.get_query_data(&query_key!["posts"]).is_some());
    }

    #[test]
    fn reset_queries_restores_the_initial_state() {
        run_local(async {
            let client = QueryClient::new();
            let key = query_key!["todos"];
            client.set_query_data(key.clone(), json!("seeded"));
            client
                .reset_queries(key.clone().into())
                .await
                .expect("reset");
            let state = client.get_query_state(&key).expect("entry kept");
            assert!(state.data.is_none());
            assert_eq!(state.status, crate::QueryStatus::Idle);
        });
    }

    #[test]
    fn ensure_query_data_prefers_cached_data_regardless_of_age() {
        run_local(async {
            let client = QueryClient::new();
            let calls = Rc::new(StdCell::new(0));
            let key = query_key!["todos"];
            client.set_query_data(key.clone(), json!("cached"));
            let data = client
                .ensure_query_data(
                    QueryOptions::new()
                        .set_query_key(key)
                        .set_query_fn(counting_fetcher(calls.clone(), json!("fetched"))),
                )
                .await
                .expect("ensure");
            assert_eq!(data, Rc::new(json!("cached")));
            assert_eq!(calls.get(), 0);
        });
    }

    #[test]
    fn global_defaults_fill_unset_options() {
        let client = QueryClient::with_config(QueryClientConfig {
            default_options: DefaultOptions {
                queries: QueryOptions::new().set_stale_time(Duration::from_secs(60)),
                ..Default::default()
            },
            ..Default::default()
        });
        let defaulted =
            client.default_query_options(QueryOptions::new().set_query_key(query_key!["a"]));
        assert_eq!(defaulted.stale_time, Some(Duration::from_secs(60)));
        assert!(defaulted.query_hash.is_some());

        let explicit = client.default_query_options(
            QueryOptions::new()
                .set_query_key(query_key!["a"])
                .set_stale_time(Duration::ZERO),
        );
        assert_eq!(explicit.stale_time, Some(Duration::ZERO));
    }

    #[test]
    fn prefix_defaults_beat_global_defaults() {
        let client = QueryClient::with_config(QueryClientConfig {
            default_options: DefaultOptions {
                queries: QueryOptions::new().set_gc_time(Duration::from_secs(10)),
                ..Default::default()
            },
            ..Default::default()
        });
        client.set_query_defaults(
            query_key!["todos"],
            QueryOptions::new().set_gc_time(Duration::from_secs(99)),
        );
        let todos =
            client.default_query_options(QueryOptions::new().set_query_key(query_key!["todos", 1]));
        assert_eq!(todos.gc_time, Some(Duration::from_secs(99)));
        let posts =
            client.default_query_options(QueryOptions::new().set_query_key(query_key!["posts"]));
        assert_eq!(posts.gc_time, Some(Duration::from_secs(10)));
    }

    #[test]
    fn is_fetching_counts_in_flight_queries() {
        run_local(async {
            let client = QueryClient::new();
            let options = QueryOptions::new()
                .set_query_key(query_key!["slow"])
                .set_query_fn(query_fn(|_key| async {
                    tokio::task::yield_now().await;
                    Ok(json!(1))
                }));
            let query = client
                .query_cache()
                .build(client.default_query_options(options), None);
            assert_eq!(client.is_fetching(QueryFilters::default()), 0);
            let promise = query.fetch(false);
            assert_eq!(client.is_fetching(QueryFilters::default()), 1);
            let _ = promise.await;
            assert_eq!(client.is_fetching(QueryFilters::default()), 0);
        });
    }

    #[test]
    fn writes_inside_a_batch_notify_after_the_batch_ends() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["a"], json!(0));
        client.set_query_data(query_key!["b"], json!(0));

        let during = Rc::new(StdCell::new(0usize));
        let events = Rc::new(StdCell::new(0usize));
        let _subscription = {
            let events = events.clone();
            client.query_cache().subscribe(move |event| {
                if matches!(event, crate::QueryCacheEvent::Updated { .. }) {
                    events.set(events.get() + 1);
                }
            })
        };

        notify_manager().batch(|| {
            for i in 0..5 {
                client.set_query_data(query_key!["a"], json!(i + 1));
            }
            during.set(events.get());
        });

        assert_eq!(during.get(), 0);
        assert_eq!(events.get(), 5);
    }

    #[test]
    fn clear_empties_both_caches() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["a"], json!(1));
        client
            .mutation_cache()
            .build(MutationOptions::new(), None);
        client.clear();
        assert!(client.query_cache().get_all().is_empty());
        assert!(client.mutation_cache().get_all().is_empty());
    }

    #[test]
    fn mount_and_unmount_are_reference_counted() {
        let client = QueryClient::new();
        client.mount();
        client.mount();
        client.unmount();
        assert!(client.inner.focus_subscription.borrow().is_some());
        client.unmount();
        assert!(client.inner.focus_subscription.borrow().is_none());
        client.unmount();
    }
}
