#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! A client-side cache for asynchronous state.
//!
//! `refetch` tracks server data (or any other async source of truth) as
//! queries and mutations: queries are identified by structural keys, share a
//! single in-flight fetch per key, go stale, refetch on focus or reconnect,
//! and are garbage collected once unobserved; mutations run side effects
//! with retry, offline pausing and lifecycle hooks. Observers turn cache
//! writes into change notifications, and the whole cache can be dehydrated
//! to a serializable snapshot and restored later.
//!
//! The crate is single-threaded and cooperative: run it inside a
//! [`tokio::task::LocalSet`] on a current-thread runtime so retry backoff
//! and garbage collection timers have somewhere to live.
//!
//! ```
//! use refetch::{query_fn, query_key, QueryClient, QueryOptions};
//! use serde_json::json;
//!
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//! tokio::task::LocalSet::new().block_on(&rt, async {
//!     let client = QueryClient::new();
//!     let todos = client
//!         .fetch_query(
//!             QueryOptions::new()
//!                 .set_query_key(query_key!["todos", { "done": false }])
//!                 .set_query_fn(query_fn(|_key| async { Ok(json!(["write docs"])) })),
//!         )
//!         .await
//!         .unwrap();
//!     assert_eq!(*todos, json!(["write docs"]));
//!
//!     // Same key, still fresh: served from the cache.
//!     assert_eq!(
//!         client.get_query_data(&query_key!["todos", { "done": false }]),
//!         Some(todos)
//!     );
//! });
//! ```

mod error;
mod focus_manager;
mod garbage_collector;
mod instant;
mod key;
mod mutation;
mod mutation_cache;
mod mutation_observer;
mod notify_manager;
mod online_manager;
mod persist;
mod queries_observer;
mod query;
mod query_cache;
mod query_client;
mod query_observer;
mod query_options;
mod query_state;
mod retryer;
mod subscribable;
mod util;

pub use error::{CancelOptions, FetchError, PersistError, QueryError};
pub use focus_manager::{focus_manager, FocusManager};
pub use instant::Instant;
pub use key::{
    hash_query_key, match_mutation, match_query, partial_match_key, MutationFilters, QueryFilters,
    QueryKey, QueryTypeFilter,
};
pub use mutation::{Mutation, MutationAction, MutationState, MutationStatus};
pub use mutation_cache::{
    CacheOnErrorFn, CacheOnMutateFn, CacheOnSettledFn, CacheOnSuccessFn, MutationCache,
    MutationCacheConfig, MutationCacheEvent,
};
pub use mutation_observer::{MutateOptions, MutationObserver, MutationObserverResult};
pub use notify_manager::{notify_manager, NotifyManager};
pub use online_manager::{online_manager, OnlineManager};
pub use persist::{
    dehydrate, hydrate, persist_client_restore, persist_client_save, DehydrateOptions,
    DehydratedMutation, DehydratedQuery, DehydratedState, PersistOptions, PersistedClient,
    Persister,
};
pub use queries_observer::QueriesObserver;
pub use query::Query;
pub use query_cache::{QueryCache, QueryCacheEvent};
pub use query_client::{QueryClient, QueryClientConfig, RefetchType};
pub use query_observer::{QueryObserver, QueryObserverResult, ResultProp, TrackedResult};
pub use query_options::{
    mutation_fn, query_fn, DefaultOptions, MutationFn, MutationOptions, NetworkMode, OnErrorFn,
    OnMutateFn, OnSettledFn, OnSuccessFn, QueryFunction, QueryOptions, RefetchPolicy, RetryDelay,
    RetryPolicy, SelectFn, DEFAULT_GC_TIME, DEFAULT_STALE_TIME,
};
pub use query_state::{FetchStatus, QueryAction, QueryState, QueryStatus};
pub use subscribable::Subscription;

#[doc(hidden)]
pub use serde_json as __serde_json;
