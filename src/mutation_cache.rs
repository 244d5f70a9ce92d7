use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::future::LocalBoxFuture;
use serde_json::Value;

use crate::{
    error::FetchError,
    key::{match_mutation, MutationFilters},
    mutation::{Mutation, MutationAction, MutationState},
    notify_manager::notify_manager,
    query_options::MutationOptions,
    subscribable::{Listeners, Subscription},
};

/// Cache-level pre-mutation hook: `(variables, mutation)`.
pub type CacheOnMutateFn = Rc<dyn Fn(Rc<Value>, Mutation) -> LocalBoxFuture<'static, ()>>;
/// Cache-level success hook: `(data, variables, context, mutation)`.
pub type CacheOnSuccessFn =
    Rc<dyn Fn(Rc<Value>, Rc<Value>, Option<Rc<Value>>, Mutation) -> LocalBoxFuture<'static, ()>>;
/// Cache-level error hook: `(error, variables, context, mutation)`.
pub type CacheOnErrorFn =
    Rc<dyn Fn(FetchError, Rc<Value>, Option<Rc<Value>>, Mutation) -> LocalBoxFuture<'static, ()>>;
/// Cache-level settled hook: `(data, error, variables, context, mutation)`.
pub type CacheOnSettledFn = Rc<
    dyn Fn(
        Option<Rc<Value>>,
        Option<FetchError>,
        Rc<Value>,
        Option<Rc<Value>>,
        Mutation,
    ) -> LocalBoxFuture<'static, ()>,
>;

/// Hooks that run for every mutation in the cache, before the mutation's own
/// hooks on the same path. The usual place to invalidate affected queries.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    /// Runs before each mutation function.
    pub on_mutate: Option<CacheOnMutateFn>,
    /// Runs after each successful mutation.
    pub on_success: Option<CacheOnSuccessFn>,
    /// Runs after each failed mutation.
    pub on_error: Option<CacheOnErrorFn>,
    /// Runs after either outcome.
    pub on_settled: Option<CacheOnSettledFn>,
}

/// Something that happened inside a [`MutationCache`].
#[derive(Clone)]
pub enum MutationCacheEvent {
    /// A mutation was registered.
    Added {
        /// The new mutation.
        mutation: Mutation,
    },
    /// A mutation was removed.
    Removed {
        /// The removed mutation.
        mutation: Mutation,
    },
    /// A mutation's state changed.
    Updated {
        /// The mutation that changed.
        mutation: Mutation,
        /// The transition that was applied.
        action: MutationAction,
    },
}

type CacheListener = dyn Fn(&MutationCacheEvent);

/// The registry of all [`Mutation`]s, in submission order.
///
/// Unlike queries, mutations are not deduplicated: every call produces a new
/// entry with its own id, so concurrent submissions of the same logical
/// operation each run.
#[derive(Clone, Default)]
pub struct MutationCache {
    inner: Rc<MutationCacheInner>,
}

#[derive(Default)]
pub(crate) struct MutationCacheInner {
    mutations: RefCell<Vec<Mutation>>,
    next_id: Cell<u64>,
    config: RefCell<MutationCacheConfig>,
    listeners: Listeners<CacheListener>,
}

impl MutationCacheInner {
    pub(crate) fn config(&self) -> MutationCacheConfig {
        self.config.borrow().clone()
    }

    pub(crate) fn notify(&self, event: MutationCacheEvent) {
        for listener in self.listeners.snapshot() {
            let event = event.clone();
            notify_manager().schedule(move || listener(&event));
        }
    }

    pub(crate) fn remove(&self, mutation: &Mutation) {
        let mut mutations = self.mutations.borrow_mut();
        let before = mutations.len();
        mutations.retain(|entry| !entry.same_entry(mutation));
        let removed = mutations.len() != before;
        drop(mutations);
        if removed {
            mutation.destroy();
            self.notify(MutationCacheEvent::Removed {
                mutation: mutation.clone(),
            });
        }
    }
}

impl MutationCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache with cache-level hooks installed.
    pub fn with_config(config: MutationCacheConfig) -> Self {
        let cache = Self::default();
        *cache.inner.config.borrow_mut() = config;
        cache
    }

    /// Register a new mutation. `state` seeds a mutation restored from a
    /// persisted snapshot.
    pub fn build(&self, options: MutationOptions, state: Option<MutationState>) -> Mutation {
        let mutation_id = self.inner.next_id.get() + 1;
        self.inner.next_id.set(mutation_id);
        let mutation = Mutation::new(Rc::downgrade(&self.inner), mutation_id, options, state);
        self.inner.mutations.borrow_mut().push(mutation.clone());
        self.inner.notify(MutationCacheEvent::Added {
            mutation: mutation.clone(),
        });
        mutation
    }

    /// Remove a mutation, tearing down its retryer and gc timer.
    pub fn remove(&self, mutation: &Mutation) {
        self.inner.remove(mutation);
    }

    /// Remove every mutation.
    pub fn clear(&self) {
        notify_manager().batch(|| {
            for mutation in self.get_all() {
                self.remove(&mutation);
            }
        });
    }

    /// All mutations in submission order.
    pub fn get_all(&self) -> Vec<Mutation> {
        self.inner.mutations.borrow().clone()
    }

    /// The first mutation matching `filters`; key matching defaults to exact.
    pub fn find(&self, mut filters: MutationFilters) -> Option<Mutation> {
        filters.exact.get_or_insert(true);
        self.get_all()
            .into_iter()
            .find(|mutation| match_mutation(&filters, mutation))
    }

    /// All mutations matching `filters`.
    pub fn find_all(&self, filters: MutationFilters) -> Vec<Mutation> {
        self.get_all()
            .into_iter()
            .filter(|mutation| match_mutation(&filters, mutation))
            .collect()
    }

    /// Resume every paused mutation, in submission order. Individual failures
    /// surface through each mutation's own hooks and state.
    pub async fn resume_paused_mutations(&self) {
        let paused: Vec<Mutation> = self
            .get_all()
            .into_iter()
            .filter(|mutation| mutation.state().is_paused)
            .collect();
        futures::future::join_all(
            paused
                .iter()
                .map(|mutation| async move { mutation.continue_execute().await }),
        )
        .await;
    }

    /// Subscribe to cache events.
    pub fn subscribe(&self, listener: impl Fn(&MutationCacheEvent) + 'static) -> Subscription {
        self.inner.listeners.subscribe(Rc::new(listener))
    }
}
