use std::{rc::Rc, time::Duration};

use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::Value;

use crate::{error::FetchError, key::QueryKey, query_observer::ResultProp};

/// Data considered stale as soon as it lands, matching the behavior users
/// expect from a cache that refetches eagerly.
pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
/// Unobserved entries linger for five minutes before collection.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(300);

/// The async function that produces a query's data.
pub type QueryFunction = Rc<dyn Fn(QueryKey) -> LocalBoxFuture<'static, Result<Value, FetchError>>>;

/// The async function that performs a mutation's side effect.
pub type MutationFn = Rc<dyn Fn(Rc<Value>) -> LocalBoxFuture<'static, Result<Value, FetchError>>>;

/// Pre-mutation hook. Runs before the mutation function; its `Ok` payload is
/// stored as the mutation's context. An `Err` aborts the mutation.
pub type OnMutateFn =
    Rc<dyn Fn(Rc<Value>) -> LocalBoxFuture<'static, Result<Option<Value>, FetchError>>>;

/// Success hook: `(data, variables, context)`.
pub type OnSuccessFn =
    Rc<dyn Fn(Rc<Value>, Rc<Value>, Option<Rc<Value>>) -> LocalBoxFuture<'static, ()>>;

/// Error hook: `(error, variables, context)`.
pub type OnErrorFn =
    Rc<dyn Fn(FetchError, Rc<Value>, Option<Rc<Value>>) -> LocalBoxFuture<'static, ()>>;

/// Settled hook: `(data, error, variables, context)`, runs on either outcome.
pub type OnSettledFn = Rc<
    dyn Fn(
        Option<Rc<Value>>,
        Option<FetchError>,
        Rc<Value>,
        Option<Rc<Value>>,
    ) -> LocalBoxFuture<'static, ()>,
>;

/// Projection applied to cached data before it reaches an observer's result.
pub type SelectFn = Rc<dyn Fn(&Value) -> Value>;

/// Wrap an async closure as a [`QueryFunction`].
pub fn query_fn<F, Fut>(f: F) -> QueryFunction
where
    F: Fn(QueryKey) -> Fut + 'static,
    Fut: std::future::Future<Output = Result<Value, FetchError>> + 'static,
{
    Rc::new(move |key| f(key).boxed_local())
}

/// Wrap an async closure as a [`MutationFn`].
pub fn mutation_fn<F, Fut>(f: F) -> MutationFn
where
    F: Fn(Rc<Value>) -> Fut + 'static,
    Fut: std::future::Future<Output = Result<Value, FetchError>> + 'static,
{
    Rc::new(move |variables| f(variables).boxed_local())
}

/// When a failed attempt should be retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Fail on the first error.
    Never,
    /// Retry up to this many times after the initial attempt.
    Count(u32),
    /// Retry indefinitely.
    Always,
    /// Decide per failure; receives the failure count so far and the error.
    Predicate(Rc<dyn Fn(u32, &FetchError) -> bool>),
}

impl RetryPolicy {
    /// Whether another attempt should follow, given the number of failures so
    /// far (the first failure is count 1).
    pub fn should_retry(&self, failure_count: u32, error: &FetchError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Count(retries) => failure_count <= *retries,
            RetryPolicy::Always => true,
            RetryPolicy::Predicate(predicate) => predicate(failure_count, error),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Count(retries) => f.debug_tuple("Count").field(retries).finish(),
            RetryPolicy::Always => write!(f, "Always"),
            RetryPolicy::Predicate(_) => write!(f, "Predicate"),
        }
    }
}

/// How long to wait before each retry attempt.
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay before every retry.
    Fixed(Duration),
    /// Exponential backoff: `base * 2^(failure_count - 1)`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound for the computed delay.
        max: Duration,
    },
    /// Compute the delay from the failure count.
    Custom(Rc<dyn Fn(u32) -> Duration>),
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryDelay {
    /// The delay preceding the retry that follows failure number
    /// `failure_count`.
    pub fn for_failure(&self, failure_count: u32) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Exponential { base, max } => {
                let exponent = failure_count.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent).unwrap_or(*max).min(*max)
            }
            RetryDelay::Custom(delay_fn) => delay_fn(failure_count),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryDelay::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// How an operation behaves while the [`OnlineManager`](crate::OnlineManager)
/// reports the network as unreachable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Pause while offline; resume when connectivity returns.
    #[default]
    Online,
    /// Ignore connectivity entirely.
    Always,
    /// Run the first attempt regardless, then behave like [`Always`] between
    /// retries.
    ///
    /// [`Always`]: NetworkMode::Always
    OfflineFirst,
}

/// Whether a query refetches when the application regains focus or
/// connectivity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefetchPolicy {
    /// Refetch unconditionally.
    Always,
    /// Refetch only if the query is stale.
    #[default]
    Stale,
    /// Never refetch on this trigger.
    Never,
}

/// Per-query configuration.
///
/// All fields are optional; unset fields are filled in from key-prefix
/// defaults and then the client's global defaults when the query is built.
/// Setters consume and return `self` for chaining:
///
/// ```
/// use std::time::Duration;
/// use refetch::{query_fn, query_key, QueryOptions};
/// use serde_json::json;
///
/// let options = QueryOptions::new()
///     .set_query_key(query_key!["todos"])
///     .set_query_fn(query_fn(|_key| async { Ok(json!([])) }))
///     .set_stale_time(Duration::from_secs(10));
/// ```
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// The structured key identifying the query.
    pub query_key: Option<QueryKey>,
    /// Precomputed hash; derived from the key when unset.
    pub query_hash: Option<String>,
    /// The fetcher. Required to fetch; queries seeded via `set_query_data`
    /// can exist without one.
    pub query_fn: Option<QueryFunction>,
    /// How long data stays fresh after a successful fetch.
    pub stale_time: Option<Duration>,
    /// How long an unobserved query is kept before collection.
    pub gc_time: Option<Duration>,
    /// Retry policy; queries default to three retries.
    pub retry: Option<RetryPolicy>,
    /// Backoff between retries; defaults to exponential from 1s capped at 30s.
    pub retry_delay: Option<RetryDelay>,
    /// Offline behavior; defaults to pausing while offline.
    pub network_mode: Option<NetworkMode>,
    /// Keep previous allocations for structurally equal data; defaults on.
    pub structural_sharing: Option<bool>,
    /// A disabled query never fetches automatically.
    pub enabled: Option<bool>,
    /// Refetch behavior when the application regains focus.
    pub refetch_on_window_focus: Option<RefetchPolicy>,
    /// Refetch behavior when connectivity returns.
    pub refetch_on_reconnect: Option<RefetchPolicy>,
    /// Projection applied to data in observer results.
    pub select: Option<SelectFn>,
    /// Restrict observer notifications to changes of these result fields.
    /// Unset means tracked-access detection (or whole-result comparison if
    /// nothing was tracked).
    pub notify_on_change_props: Option<Vec<ResultProp>>,
    pub(crate) defaulted: bool,
}

impl QueryOptions {
    /// Empty options; every field falls back to a default at build time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the query key.
    pub fn set_query_key(mut self, query_key: QueryKey) -> Self {
        self.query_key = Some(query_key);
        self
    }

    /// Set the fetcher.
    pub fn set_query_fn(mut self, query_fn: QueryFunction) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    /// Set the freshness window.
    pub fn set_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Set the unobserved retention window.
    pub fn set_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Set the retry policy.
    pub fn set_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the retry backoff.
    pub fn set_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Set the offline behavior.
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    /// Enable or disable structural sharing.
    pub fn set_structural_sharing(mut self, structural_sharing: bool) -> Self {
        self.structural_sharing = Some(structural_sharing);
        self
    }

    /// Enable or disable automatic fetching.
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the focus refetch policy.
    pub fn set_refetch_on_window_focus(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_window_focus = Some(policy);
        self
    }

    /// Set the reconnect refetch policy.
    pub fn set_refetch_on_reconnect(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_reconnect = Some(policy);
        self
    }

    /// Set the result projection.
    pub fn set_select(mut self, select: SelectFn) -> Self {
        self.select = Some(select);
        self
    }

    /// Restrict notifications to the listed result fields.
    pub fn set_notify_on_change_props(mut self, props: Vec<ResultProp>) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    /// Fill unset fields from `defaults`, leaving set fields untouched.
    pub(crate) fn merge(mut self, defaults: &QueryOptions) -> Self {
        self.query_key = self.query_key.or_else(|| defaults.query_key.clone());
        self.query_fn = self.query_fn.or_else(|| defaults.query_fn.clone());
        self.stale_time = self.stale_time.or(defaults.stale_time);
        self.gc_time = self.gc_time.or(defaults.gc_time);
        self.retry = self.retry.or_else(|| defaults.retry.clone());
        self.retry_delay = self.retry_delay.or_else(|| defaults.retry_delay.clone());
        self.network_mode = self.network_mode.or(defaults.network_mode);
        self.structural_sharing = self.structural_sharing.or(defaults.structural_sharing);
        self.enabled = self.enabled.or(defaults.enabled);
        self.refetch_on_window_focus = self
            .refetch_on_window_focus
            .or(defaults.refetch_on_window_focus);
        self.refetch_on_reconnect = self.refetch_on_reconnect.or(defaults.refetch_on_reconnect);
        self.select = self.select.or_else(|| defaults.select.clone());
        self.notify_on_change_props = self
            .notify_on_change_props
            .or_else(|| defaults.notify_on_change_props.clone());
        self
    }

    /// The effective freshness window, clamped to the gc window.
    pub(crate) fn resolved_stale_time(&self) -> Duration {
        ensure_valid_stale_time(
            self.stale_time.unwrap_or(DEFAULT_STALE_TIME),
            self.resolved_gc_time(),
        )
    }

    /// The effective retention window.
    pub(crate) fn resolved_gc_time(&self) -> Duration {
        self.gc_time.unwrap_or(DEFAULT_GC_TIME)
    }

    pub(crate) fn resolved_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy::Count(3))
    }

    pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("query_hash", &self.query_hash)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Per-mutation configuration. Mirrors [`QueryOptions`] minus the
/// freshness-related fields, plus lifecycle hooks.
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// Optional key used for defaults lookup, filters and dehydration.
    pub mutation_key: Option<QueryKey>,
    /// The mutation side effect. Required to execute.
    pub mutation_fn: Option<MutationFn>,
    /// Retry policy; mutations default to no retries.
    pub retry: Option<RetryPolicy>,
    /// Backoff between retries.
    pub retry_delay: Option<RetryDelay>,
    /// Offline behavior.
    pub network_mode: Option<NetworkMode>,
    /// Retention window once the mutation has no observers.
    pub gc_time: Option<Duration>,
    /// Runs before the mutation function; may produce a context and may abort.
    pub on_mutate: Option<OnMutateFn>,
    /// Runs after a successful mutation.
    pub on_success: Option<OnSuccessFn>,
    /// Runs after a failed mutation.
    pub on_error: Option<OnErrorFn>,
    /// Runs after either outcome.
    pub on_settled: Option<OnSettledFn>,
    pub(crate) defaulted: bool,
}

impl MutationOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mutation key.
    pub fn set_mutation_key(mut self, mutation_key: QueryKey) -> Self {
        self.mutation_key = Some(mutation_key);
        self
    }

    /// Set the mutation function.
    pub fn set_mutation_fn(mut self, mutation_fn: MutationFn) -> Self {
        self.mutation_fn = Some(mutation_fn);
        self
    }

    /// Set the retry policy.
    pub fn set_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the retry backoff.
    pub fn set_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Set the offline behavior.
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    /// Set the retention window.
    pub fn set_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Set the pre-mutation hook.
    pub fn set_on_mutate(mut self, on_mutate: OnMutateFn) -> Self {
        self.on_mutate = Some(on_mutate);
        self
    }

    /// Set the success hook.
    pub fn set_on_success(mut self, on_success: OnSuccessFn) -> Self {
        self.on_success = Some(on_success);
        self
    }

    /// Set the error hook.
    pub fn set_on_error(mut self, on_error: OnErrorFn) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Set the settled hook.
    pub fn set_on_settled(mut self, on_settled: OnSettledFn) -> Self {
        self.on_settled = Some(on_settled);
        self
    }

    /// Fill unset fields from `defaults`.
    pub(crate) fn merge(mut self, defaults: &MutationOptions) -> Self {
        self.mutation_key = self.mutation_key.or_else(|| defaults.mutation_key.clone());
        self.mutation_fn = self.mutation_fn.or_else(|| defaults.mutation_fn.clone());
        self.retry = self.retry.or_else(|| defaults.retry.clone());
        self.retry_delay = self.retry_delay.or_else(|| defaults.retry_delay.clone());
        self.network_mode = self.network_mode.or(defaults.network_mode);
        self.gc_time = self.gc_time.or(defaults.gc_time);
        self.on_mutate = self.on_mutate.or_else(|| defaults.on_mutate.clone());
        self.on_success = self.on_success.or_else(|| defaults.on_success.clone());
        self.on_error = self.on_error.or_else(|| defaults.on_error.clone());
        self.on_settled = self.on_settled.or_else(|| defaults.on_settled.clone());
        self
    }

    pub(crate) fn resolved_gc_time(&self) -> Duration {
        self.gc_time.unwrap_or(DEFAULT_GC_TIME)
    }

    pub(crate) fn resolved_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy::Never)
    }

    pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }
}

/// Client-wide defaults applied to every query and mutation that does not set
/// its own values.
#[derive(Clone, Default)]
pub struct DefaultOptions {
    /// Defaults for queries.
    pub queries: QueryOptions,
    /// Defaults for mutations.
    pub mutations: MutationOptions,
}

/// Clamp the freshness window to the retention window.
///
/// Data that outlives its cache entry can never be served, so a stale time
/// beyond the gc time is a configuration mistake.
pub(crate) fn ensure_valid_stale_time(stale_time: Duration, gc_time: Duration) -> Duration {
    if stale_time > gc_time {
        tracing::warn!(
            stale_time_ms = stale_time.as_millis() as u64,
            gc_time_ms = gc_time.as_millis() as u64,
            "stale time exceeds gc time; clamping stale time to gc time"
        );
        gc_time
    } else {
        stale_time
    }
}
