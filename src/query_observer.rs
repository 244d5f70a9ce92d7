use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::Rc,
    time::Duration,
};

use serde_json::Value;

use crate::{
    error::FetchError,
    instant::Instant,
    notify_manager::notify_manager,
    query::{FetchPromise, Query, QueryObserverLink},
    query_client::QueryClient,
    query_options::{QueryOptions, RefetchPolicy},
    query_state::{FetchStatus, QueryAction, QueryStatus},
    subscribable::{Listeners, ObserverKey, Subscription},
};

/// A field of [`QueryObserverResult`], used for change-notification scoping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultProp {
    /// The `data` field.
    Data,
    /// The `error` field.
    Error,
    /// The `status` field.
    Status,
    /// The `fetch_status` field.
    FetchStatus,
    /// The `is_stale` field.
    IsStale,
    /// The `failure_count` field.
    FailureCount,
    /// The `data_updated_at` field.
    DataUpdatedAt,
    /// The `error_updated_at` field.
    ErrorUpdatedAt,
}

/// What an observer derives from its query for consumption: state fields plus
/// computed staleness, with `select` already applied to `data`.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryObserverResult {
    /// The (possibly projected) data.
    pub data: Option<Rc<Value>>,
    /// The terminal error of the most recent failed fetch.
    pub error: Option<FetchError>,
    /// Result status.
    pub status: QueryStatus,
    /// Fetch activity.
    pub fetch_status: FetchStatus,
    /// Staleness under this observer's `stale_time`.
    pub is_stale: bool,
    /// Failures within the current fetch cycle.
    pub failure_count: u32,
    /// The most recent failure within the current fetch cycle.
    pub failure_reason: Option<FetchError>,
    /// When `data` last changed.
    pub data_updated_at: Option<Instant>,
    /// When `error` last changed.
    pub error_updated_at: Option<Instant>,
    /// Whether the query is currently invalidated.
    pub is_invalidated: bool,
}

impl QueryObserverResult {
    /// First fetch in flight, nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Data is available.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The most recent fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A fetch is in flight (initial or background).
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// The fetch is paused waiting for connectivity.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    fn prop_equal(&self, other: &Self, prop: ResultProp) -> bool {
        match prop {
            ResultProp::Data => self.data == other.data,
            ResultProp::Error => self.error == other.error,
            ResultProp::Status => self.status == other.status,
            ResultProp::FetchStatus => self.fetch_status == other.fetch_status,
            ResultProp::IsStale => self.is_stale == other.is_stale,
            ResultProp::FailureCount => self.failure_count == other.failure_count,
            ResultProp::DataUpdatedAt => self.data_updated_at == other.data_updated_at,
            ResultProp::ErrorUpdatedAt => self.error_updated_at == other.error_updated_at,
        }
    }
}

/// A result wrapper that records which fields get read.
///
/// Consumers that read through a `TrackedResult` teach the observer which
/// fields they depend on, so later updates that only change unread fields
/// produce no notification.
pub struct TrackedResult {
    result: QueryObserverResult,
    tracked: Rc<RefCell<HashSet<ResultProp>>>,
}

impl TrackedResult {
    /// Read the data, marking it tracked.
    pub fn data(&self) -> Option<&Rc<Value>> {
        self.tracked.borrow_mut().insert(ResultProp::Data);
        self.result.data.as_ref()
    }

    /// Read the error, marking it tracked.
    pub fn error(&self) -> Option<&FetchError> {
        self.tracked.borrow_mut().insert(ResultProp::Error);
        self.result.error.as_ref()
    }

    /// Read the status, marking it tracked.
    pub fn status(&self) -> QueryStatus {
        self.tracked.borrow_mut().insert(ResultProp::Status);
        self.result.status
    }

    /// Read the fetch status, marking it tracked.
    pub fn fetch_status(&self) -> FetchStatus {
        self.tracked.borrow_mut().insert(ResultProp::FetchStatus);
        self.result.fetch_status
    }

    /// Read the staleness flag, marking it tracked.
    pub fn is_stale(&self) -> bool {
        self.tracked.borrow_mut().insert(ResultProp::IsStale);
        self.result.is_stale
    }

    /// Read the failure count, marking it tracked.
    pub fn failure_count(&self) -> u32 {
        self.tracked.borrow_mut().insert(ResultProp::FailureCount);
        self.result.failure_count
    }

    /// The full untracked result, for one-off inspection.
    pub fn into_inner(self) -> QueryObserverResult {
        self.result
    }
}

pub(crate) fn build_result(query: &Query, options: &QueryOptions) -> QueryObserverResult {
    let state = query.state();
    let data = match (&state.data, &options.select) {
        (Some(data), Some(select)) => Some(Rc::new(select(data))),
        (data, _) => data.clone(),
    };
    QueryObserverResult {
        data,
        error: state.error,
        status: state.status,
        fetch_status: state.fetch_status,
        is_stale: query.is_stale_by_time(options.resolved_stale_time()),
        failure_count: state.fetch_failure_count,
        failure_reason: state.fetch_failure_reason,
        data_updated_at: state.data_updated_at,
        error_updated_at: state.error_updated_at,
        is_invalidated: state.is_invalidated,
    }
}

type ResultListener = dyn Fn(&QueryObserverResult);

/// Binds a set of options to the query the options address, and turns query
/// state transitions into result notifications.
///
/// The observer attaches to its query when the first listener subscribes
/// (fetching on mount if the data is missing or stale) and detaches when the
/// last one leaves, which is what starts the query's gc countdown. Cloning is
/// shallow.
#[derive(Clone)]
pub struct QueryObserver {
    inner: Rc<QueryObserverInner>,
}

pub(crate) struct QueryObserverInner {
    client: QueryClient,
    options: RefCell<QueryOptions>,
    query: RefCell<Query>,
    observer_key: Cell<Option<ObserverKey>>,
    current_result: RefCell<QueryObserverResult>,
    tracked: Rc<RefCell<HashSet<ResultProp>>>,
    listeners: Listeners<ResultListener>,
}

impl QueryObserver {
    /// Create an observer for `options` on `client`. Does not attach or
    /// fetch until the first [`subscribe`](QueryObserver::subscribe).
    pub fn new(client: &QueryClient, options: QueryOptions) -> Self {
        let options = client.default_query_options(options);
        let query = client.query_cache().build(options.clone(), None);
        let current_result = build_result(&query, &options);
        Self {
            inner: Rc::new(QueryObserverInner {
                client: client.clone(),
                options: RefCell::new(options),
                query: RefCell::new(query),
                observer_key: Cell::new(None),
                current_result: RefCell::new(current_result),
                tracked: Rc::new(RefCell::new(HashSet::new())),
                listeners: Listeners::default(),
            }),
        }
    }

    /// Listen for result changes. The first subscription attaches the
    /// observer to its query and triggers the fetch-on-mount check.
    pub fn subscribe(&self, listener: impl Fn(&QueryObserverResult) + 'static) -> Subscription {
        let first = self.inner.listeners.is_empty();
        let key = self.inner.listeners.insert(Rc::new(listener));
        if first {
            self.attach();
        }
        let observer = self.clone();
        Subscription::new(move || {
            observer.inner.listeners.remove(key);
            if observer.inner.listeners.is_empty() {
                observer.detach();
            }
        })
    }

    /// Re-point the observer. When the new options address a different key
    /// the observer detaches from the old query, attaches to the new one and
    /// notifies with the new query's result.
    pub fn set_options(&self, options: QueryOptions) {
        let options = self.inner.client.default_query_options(options);
        let current_hash = self.inner.query.borrow().query_hash().to_string();
        let next_hash = options
            .query_hash
            .clone()
            .unwrap_or_else(|| current_hash.clone());

        if next_hash != current_hash {
            let attached = self.inner.observer_key.get().is_some();
            if attached {
                self.detach();
            }
            let query = self.inner.client.query_cache().build(options.clone(), None);
            *self.inner.options.borrow_mut() = options;
            *self.inner.query.borrow_mut() = query;
            if attached {
                self.attach();
            }
        } else {
            let query = self.inner.query.borrow().clone();
            query.set_options(options.clone());
            *self.inner.options.borrow_mut() = options;
        }
        self.inner.update_result();
    }

    /// The latest computed result.
    pub fn get_current_result(&self) -> QueryObserverResult {
        self.inner.refresh_result();
        self.inner.current_result.borrow().clone()
    }

    /// The latest result, wrapped so reads are recorded for notification
    /// scoping.
    pub fn track_result(&self) -> TrackedResult {
        TrackedResult {
            result: self.get_current_result(),
            tracked: self.inner.tracked.clone(),
        }
    }

    /// The result `options` would produce right now, without re-pointing this
    /// observer. Builds the target query if absent so seeded state shows
    /// through.
    pub fn get_optimistic_result(&self, options: QueryOptions) -> QueryObserverResult {
        let options = self.inner.client.default_query_options(options);
        let query = self.inner.client.query_cache().build(options.clone(), None);
        build_result(&query, &options)
    }

    /// Force a fetch of the observed query, joining one already in flight.
    pub fn refetch(&self) -> FetchPromise {
        self.inner.query.borrow().fetch(false)
    }

    /// The observed query.
    pub fn query(&self) -> Query {
        self.inner.query.borrow().clone()
    }

    /// The observer's defaulted options.
    pub fn options(&self) -> QueryOptions {
        self.inner.options.borrow().clone()
    }

    fn attach(&self) {
        let query = self.inner.query.borrow().clone();
        let link: Rc<dyn QueryObserverLink> = self.inner.clone();
        let key = query.add_observer(&link);
        self.inner.observer_key.set(Some(key));

        let options = self.inner.options.borrow().clone();
        if options.is_enabled() && query.is_stale_by_time(options.resolved_stale_time()) {
            let _ = query.fetch(false);
        }
        self.inner.refresh_result();
    }

    fn detach(&self) {
        if let Some(key) = self.inner.observer_key.take() {
            self.inner.query.borrow().remove_observer(key);
        }
    }
}

impl QueryObserverInner {
    /// Recompute the result without notifying; used on reads.
    fn refresh_result(&self) {
        let query = self.query.borrow().clone();
        let options = self.options.borrow().clone();
        let next = build_result(&query, &options);
        *self.current_result.borrow_mut() = next;
    }

    fn update_result(&self) {
        let query = self.query.borrow().clone();
        let options = self.options.borrow().clone();
        let next = build_result(&query, &options);
        let prev = self.current_result.borrow().clone();
        if next == prev {
            return;
        }
        *self.current_result.borrow_mut() = next.clone();
        if !self.should_notify(&prev, &next, &options) {
            return;
        }
        for listener in self.listeners.snapshot() {
            let result = next.clone();
            notify_manager().schedule(move || listener(&result));
        }
    }

    fn should_notify(
        &self,
        prev: &QueryObserverResult,
        next: &QueryObserverResult,
        options: &QueryOptions,
    ) -> bool {
        if let Some(props) = &options.notify_on_change_props {
            return props.iter().any(|prop| !prev.prop_equal(next, *prop));
        }
        let tracked = self.tracked.borrow();
        if !tracked.is_empty() {
            return tracked.iter().any(|prop| !prev.prop_equal(next, *prop));
        }
        true
    }
}

impl QueryObserverLink for QueryObserverInner {
    fn on_query_update(&self, _action: &QueryAction) {
        self.update_result();
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let options = self.options.borrow().clone();
        if !options.is_enabled() {
            return false;
        }
        match options.refetch_on_window_focus.unwrap_or_default() {
            RefetchPolicy::Always => true,
            RefetchPolicy::Stale => self
                .query
                .borrow()
                .is_stale_by_time(options.resolved_stale_time()),
            RefetchPolicy::Never => false,
        }
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let options = self.options.borrow().clone();
        if !options.is_enabled() {
            return false;
        }
        match options.refetch_on_reconnect.unwrap_or_default() {
            RefetchPolicy::Always => true,
            RefetchPolicy::Stale => self
                .query
                .borrow()
                .is_stale_by_time(options.resolved_stale_time()),
            RefetchPolicy::Never => false,
        }
    }

    fn observer_refetch(&self) {
        let _ = self.query.borrow().fetch(false);
    }

    fn observer_stale_time(&self) -> Duration {
        self.options.borrow().resolved_stale_time()
    }
}
