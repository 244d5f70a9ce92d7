use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use serde_json::Value;
use slotmap::SlotMap;

use crate::{
    error::{CancelOptions, FetchError, QueryError},
    garbage_collector::GcTimer,
    instant::Instant,
    key::QueryKey,
    notify_manager::notify_manager,
    query_cache::{QueryCacheEvent, QueryCacheInner},
    query_options::QueryOptions,
    query_state::{reduce, FetchStatus, QueryAction, QueryState},
    retryer::{Retryer, RetryerConfig},
    subscribable::ObserverKey,
    util::{replace_equal_deep, time_until_stale, try_spawn_local},
};

/// How the query entity talks back to whoever observes it. Implemented by
/// [`QueryObserver`](crate::QueryObserver); kept as a trait so the entity
/// never depends on observer internals.
pub(crate) trait QueryObserverLink {
    fn on_query_update(&self, action: &QueryAction);
    fn should_fetch_on_window_focus(&self) -> bool;
    fn should_fetch_on_reconnect(&self) -> bool;
    fn observer_refetch(&self);
    fn observer_stale_time(&self) -> Duration;
}

pub(crate) type FetchPromise = Shared<LocalBoxFuture<'static, Result<Rc<Value>, QueryError>>>;

/// One cache entry: a key, its state machine, and the machinery to fetch it.
///
/// Cloning is shallow; all clones address the same entry. Queries are created
/// by [`QueryCache::build`](crate::QueryCache) and removed by garbage
/// collection or explicit removal, never constructed directly.
#[derive(Clone)]
pub struct Query {
    inner: Rc<QueryInner>,
}

pub(crate) struct QueryInner {
    query_key: QueryKey,
    query_hash: String,
    cache: Weak<QueryCacheInner>,
    options: RefCell<QueryOptions>,
    state: RefCell<QueryState>,
    initial_state: QueryState,
    revert_state: RefCell<Option<QueryState>>,
    observers: RefCell<SlotMap<ObserverKey, Weak<dyn QueryObserverLink>>>,
    retryer: RefCell<Option<Retryer<Rc<Value>>>>,
    promise: RefCell<Option<FetchPromise>>,
    fetch_id: Cell<u64>,
    gc: GcTimer,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCacheInner>,
        query_key: QueryKey,
        query_hash: String,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Self {
        let initial_state = state.unwrap_or_default();
        let gc = GcTimer::new(options.resolved_gc_time());
        let query = Self {
            inner: Rc::new(QueryInner {
                query_key,
                query_hash,
                cache,
                state: RefCell::new(initial_state.clone()),
                initial_state,
                revert_state: RefCell::new(None),
                options: RefCell::new(options),
                observers: RefCell::new(SlotMap::with_key()),
                retryer: RefCell::new(None),
                promise: RefCell::new(None),
                fetch_id: Cell::new(0),
                gc,
            }),
        };
        // Entries are born unobserved; the first observer disarms this.
        query.schedule_gc();
        query
    }

    /// The structured key this entry was built from.
    pub fn query_key(&self) -> &QueryKey {
        &self.inner.query_key
    }

    /// The stable hash indexing this entry in its cache.
    pub fn query_hash(&self) -> &str {
        &self.inner.query_hash
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.inner.state.borrow().clone()
    }

    /// The entry's current options (after defaulting).
    pub fn options(&self) -> QueryOptions {
        self.inner.options.borrow().clone()
    }

    /// Whether at least one observer is attached.
    pub fn is_active(&self) -> bool {
        self.inner
            .observers
            .borrow()
            .values()
            .any(|observer| observer.strong_count() > 0)
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .borrow()
            .values()
            .filter(|observer| observer.strong_count() > 0)
            .count()
    }

    /// Whether this entry should be refetched before being served.
    ///
    /// Invalidated or data-less entries are always stale. Otherwise the
    /// smallest `stale_time` among attached observers decides, falling back
    /// to the entry's own options when unobserved.
    pub fn is_stale(&self) -> bool {
        let state = self.state();
        if state.is_invalidated || state.data.is_none() {
            return true;
        }
        let stale_time = self
            .observers_snapshot()
            .iter()
            .map(|observer| observer.observer_stale_time())
            .min()
            .unwrap_or_else(|| self.inner.options.borrow().resolved_stale_time());
        self.is_stale_by_time(stale_time)
    }

    /// Staleness against an explicit freshness window.
    pub(crate) fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.inner.state.borrow();
        if state.is_invalidated {
            return true;
        }
        match state.data_updated_at {
            None => true,
            Some(updated_at) => time_until_stale(updated_at, stale_time).is_zero(),
        }
    }

    /// Start a fetch, or join the one already in flight.
    ///
    /// With `cancel_refetch` the in-flight fetch is silently replaced
    /// instead of joined. The returned promise is shared: every concurrent
    /// caller settles with the same outcome from a single invocation of the
    /// query function.
    pub(crate) fn fetch(&self, cancel_refetch: bool) -> FetchPromise {
        let in_flight = self.state().fetch_status != FetchStatus::Idle;
        if in_flight {
            if let Some(existing) = self.inner.promise.borrow().clone() {
                if !cancel_refetch {
                    return existing;
                }
            }
            self.cancel_in_flight(CancelOptions::silent());
        }

        let query_fn = match self.inner.options.borrow().query_fn.clone() {
            Some(query_fn) => query_fn,
            None => {
                tracing::warn!(query_hash = %self.inner.query_hash, "fetch without a query function");
                return futures::future::ready(Err(QueryError::Fetch(FetchError::new(
                    "no query function configured",
                ))))
                .boxed_local()
                .shared();
            }
        };

        let fetch_id = self.inner.fetch_id.get() + 1;
        self.inner.fetch_id.set(fetch_id);
        *self.inner.revert_state.borrow_mut() = Some(self.state());

        let options = self.inner.options.borrow().clone();
        let operation = {
            let query_key = self.inner.query_key.clone();
            Rc::new(move || {
                let fut = query_fn(query_key.clone());
                async move { fut.await.map(Rc::new) }.boxed_local()
            })
        };

        let retryer = Retryer::start(RetryerConfig {
            operation,
            retry: options.resolved_retry(),
            retry_delay: options.resolved_retry_delay(),
            network_mode: options.resolved_network_mode(),
            on_fail: {
                let query = self.clone();
                Rc::new(move |failure_count, error| {
                    if query.inner.fetch_id.get() == fetch_id {
                        query.dispatch(QueryAction::Failed {
                            failure_count,
                            error,
                        });
                    }
                })
            },
            on_pause: {
                let query = self.clone();
                Rc::new(move || {
                    if query.inner.fetch_id.get() == fetch_id {
                        query.dispatch(QueryAction::Pause);
                    }
                })
            },
            on_continue: {
                let query = self.clone();
                Rc::new(move || {
                    if query.inner.fetch_id.get() == fetch_id {
                        query.dispatch(QueryAction::Continue);
                    }
                })
            },
        });

        self.dispatch(QueryAction::Fetch);

        let promise: FetchPromise = {
            let query = self.clone();
            let retry_promise = retryer.promise();
            async move {
                let result = retry_promise.await;
                // Settling returns the allocation actually stored in state
                // (structural sharing may keep the previous one).
                query.on_fetch_settled(fetch_id, result)
            }
            .boxed_local()
            .shared()
        };

        *self.inner.retryer.borrow_mut() = Some(retryer);
        *self.inner.promise.borrow_mut() = Some(promise.clone());
        // Drive to completion even if no caller awaits the promise.
        try_spawn_local(promise.clone().map(|_| ()));
        promise
    }

    fn on_fetch_settled(
        &self,
        fetch_id: u64,
        result: Result<Rc<Value>, QueryError>,
    ) -> Result<Rc<Value>, QueryError> {
        if self.inner.fetch_id.get() != fetch_id {
            // Superseded by a newer fetch; that fetch owns the state now.
            return result;
        }
        *self.inner.retryer.borrow_mut() = None;
        *self.inner.promise.borrow_mut() = None;
        let revert_state = self.inner.revert_state.borrow_mut().take();

        let settled = match result {
            Ok(value) => {
                let data = self.share_with_previous((*value).clone());
                self.dispatch(QueryAction::Success {
                    data: data.clone(),
                    updated_at: None,
                    manual: false,
                });
                Ok(data)
            }
            Err(QueryError::Fetch(error)) => {
                tracing::debug!(query_hash = %self.inner.query_hash, error = %error, "fetch failed");
                self.dispatch(QueryAction::Error {
                    error: error.clone(),
                });
                Err(QueryError::Fetch(error))
            }
            Err(QueryError::Cancelled(options)) => {
                if options.revert {
                    if let Some(state) = revert_state {
                        self.dispatch(QueryAction::SetState { state });
                    }
                } else if options.silent {
                    let state = QueryState {
                        fetch_status: FetchStatus::Idle,
                        ..self.state()
                    };
                    self.dispatch(QueryAction::SetState { state });
                } else {
                    self.dispatch(QueryAction::Error {
                        error: FetchError::new("query was cancelled"),
                    });
                }
                Err(QueryError::Cancelled(options))
            }
        };

        if !self.is_active() {
            self.schedule_gc();
        }
        settled
    }

    /// Cancel the in-flight fetch, if any, and wait for it to settle.
    pub fn cancel(&self, options: CancelOptions) -> LocalBoxFuture<'static, ()> {
        let promise = self.inner.promise.borrow().clone();
        self.cancel_in_flight(options);
        async move {
            if let Some(promise) = promise {
                let _ = promise.await;
            }
        }
        .boxed_local()
    }

    fn cancel_in_flight(&self, options: CancelOptions) {
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.cancel(options);
        }
    }

    /// Write data directly, bypassing the fetcher. Applies structural sharing
    /// and dispatches a manual success.
    pub fn set_data(&self, data: Value, updated_at: Option<Instant>) -> Rc<Value> {
        let data = self.share_with_previous(data);
        self.dispatch(QueryAction::Success {
            data: data.clone(),
            updated_at,
            manual: true,
        });
        data
    }

    fn share_with_previous(&self, next: Value) -> Rc<Value> {
        let sharing = self
            .inner
            .options
            .borrow()
            .structural_sharing
            .unwrap_or(true);
        let previous = self.inner.state.borrow().data.clone();
        match (previous, sharing) {
            (Some(previous), true) => replace_equal_deep(&previous, next),
            _ => Rc::new(next),
        }
    }

    /// Mark stale regardless of age. Idempotent.
    pub fn invalidate(&self) {
        if !self.inner.state.borrow().is_invalidated {
            self.dispatch(QueryAction::Invalidate);
        }
    }

    /// Drop back to the state the entry was created with, cancelling any
    /// in-flight fetch.
    pub fn reset(&self) {
        self.cancel_in_flight(CancelOptions::silent());
        self.dispatch(QueryAction::SetState {
            state: self.inner.initial_state.clone(),
        });
    }

    /// Replace the state wholesale (hydration).
    pub(crate) fn set_state(&self, state: QueryState) {
        self.dispatch(QueryAction::SetState { state });
    }

    /// Swap in new options; the gc window only grows.
    pub(crate) fn set_options(&self, options: QueryOptions) {
        self.inner.gc.update_gc_time(options.resolved_gc_time());
        *self.inner.options.borrow_mut() = options;
    }

    pub(crate) fn add_observer(&self, observer: &Rc<dyn QueryObserverLink>) -> ObserverKey {
        let key = self
            .inner
            .observers
            .borrow_mut()
            .insert(Rc::downgrade(observer));
        self.inner.gc.clear();
        self.notify_cache(QueryCacheEvent::ObserverAdded { query: self.clone() });
        key
    }

    pub(crate) fn remove_observer(&self, key: ObserverKey) {
        self.inner.observers.borrow_mut().remove(key);
        if !self.is_active() {
            self.schedule_gc();
        }
        self.notify_cache(QueryCacheEvent::ObserverRemoved { query: self.clone() });
    }

    /// React to the application regaining focus: resume a paused retry and
    /// let the first willing observer refetch.
    pub(crate) fn on_focus(&self) {
        if let Some(observer) = self
            .observers_snapshot()
            .into_iter()
            .find(|observer| observer.should_fetch_on_window_focus())
        {
            observer.observer_refetch();
        }
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.continue_retry();
        }
    }

    /// React to connectivity returning.
    pub(crate) fn on_online(&self) {
        if let Some(observer) = self
            .observers_snapshot()
            .into_iter()
            .find(|observer| observer.should_fetch_on_reconnect())
        {
            observer.observer_refetch();
        }
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.continue_retry();
        }
    }

    /// Tear the entry down on removal from the cache.
    pub(crate) fn destroy(&self) {
        self.inner.gc.clear();
        self.cancel_in_flight(CancelOptions::silent());
    }

    fn schedule_gc(&self) {
        let query = self.clone();
        self.inner.gc.schedule(move || {
            let unobserved = !query.is_active();
            let idle = query.state().fetch_status == FetchStatus::Idle;
            if unobserved && idle {
                if let Some(cache) = query.inner.cache.upgrade() {
                    cache.remove(&query);
                }
            }
        });
    }

    pub(crate) fn dispatch(&self, action: QueryAction) {
        let next = {
            let state = self.inner.state.borrow();
            reduce(&state, &action)
        };
        *self.inner.state.borrow_mut() = next;
        notify_manager().batch(|| {
            for observer in self.observers_snapshot() {
                observer.on_query_update(&action);
            }
            self.notify_cache(QueryCacheEvent::Updated {
                query: self.clone(),
                action: action.clone(),
            });
        });
    }

    /// Whether `other` is the same cache entry, not just an equal one.
    pub(crate) fn same_entry(&self, other: &Query) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn notify_cache(&self, event: QueryCacheEvent) {
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(event);
        }
    }

    fn observers_snapshot(&self) -> Vec<Rc<dyn QueryObserverLink>> {
        let mut observers = self.inner.observers.borrow_mut();
        observers.retain(|_, observer| observer.strong_count() > 0);
        observers.values().filter_map(Weak::upgrade).collect()
    }
}
