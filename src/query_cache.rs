use std::{cell::RefCell, collections::HashMap, rc::Rc};

use crate::{
    key::{hash_query_key, match_query, QueryFilters},
    notify_manager::notify_manager,
    query::Query,
    query_options::QueryOptions,
    query_state::{QueryAction, QueryState},
    subscribable::{Listeners, Subscription},
};

/// Something that happened inside a [`QueryCache`], delivered to subscribers.
#[derive(Clone)]
pub enum QueryCacheEvent {
    /// A new entry was inserted.
    Added {
        /// The inserted entry.
        query: Query,
    },
    /// An entry was removed (manually or by garbage collection).
    Removed {
        /// The removed entry.
        query: Query,
    },
    /// An entry's state changed.
    Updated {
        /// The entry that changed.
        query: Query,
        /// The transition that was applied.
        action: QueryAction,
    },
    /// An observer attached to an entry.
    ObserverAdded {
        /// The observed entry.
        query: Query,
    },
    /// An observer detached from an entry.
    ObserverRemoved {
        /// The entry losing an observer.
        query: Query,
    },
}

type CacheListener = dyn Fn(&QueryCacheEvent);

/// The registry of all [`Query`] entries, indexed by key hash.
///
/// One entry per distinct hash: building with a key that is already present
/// returns the existing entry, which is what makes every consumer of a key
/// share data, fetches and state transitions. Cloning the cache is shallow.
#[derive(Clone, Default)]
pub struct QueryCache {
    inner: Rc<QueryCacheInner>,
}

#[derive(Default)]
pub(crate) struct QueryCacheInner {
    queries: RefCell<HashMap<String, Query>>,
    listeners: Listeners<CacheListener>,
}

impl QueryCacheInner {
    pub(crate) fn notify(&self, event: QueryCacheEvent) {
        for listener in self.listeners.snapshot() {
            let event = event.clone();
            notify_manager().schedule(move || listener(&event));
        }
    }

    pub(crate) fn remove(&self, query: &Query) {
        let current = self.queries.borrow().get(query.query_hash()).cloned();
        if let Some(current) = current {
            query.destroy();
            // Only drop the index entry if it still points at this instance;
            // a same-key rebuild may have replaced it.
            if current.same_entry(query) {
                self.queries.borrow_mut().remove(query.query_hash());
                self.notify(QueryCacheEvent::Removed {
                    query: query.clone(),
                });
            }
        }
    }
}

impl QueryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `options`' key, creating it when absent.
    ///
    /// An existing entry has its options replaced (its gc window only
    /// grows). `state` seeds a newly created entry, as during hydration.
    pub fn build(&self, mut options: QueryOptions, state: Option<QueryState>) -> Query {
        let query_key = options.query_key.clone().unwrap_or_default();
        let query_hash = options
            .query_hash
            .clone()
            .unwrap_or_else(|| hash_query_key(&query_key));
        options.query_hash = Some(query_hash.clone());

        if let Some(existing) = self.get(&query_hash) {
            existing.set_options(options);
            return existing;
        }

        let query = Query::new(
            Rc::downgrade(&self.inner),
            query_key,
            query_hash.clone(),
            options,
            state,
        );
        self.inner
            .queries
            .borrow_mut()
            .insert(query_hash, query.clone());
        self.inner.notify(QueryCacheEvent::Added {
            query: query.clone(),
        });
        query
    }

    /// Look up an entry by its exact hash.
    pub fn get(&self, query_hash: &str) -> Option<Query> {
        self.inner.queries.borrow().get(query_hash).cloned()
    }

    /// All entries, in no particular order.
    pub fn get_all(&self) -> Vec<Query> {
        self.inner.queries.borrow().values().cloned().collect()
    }

    /// The first entry matching `filters`. Key matching defaults to exact
    /// here, unlike [`find_all`](QueryCache::find_all).
    pub fn find(&self, mut filters: QueryFilters) -> Option<Query> {
        filters.exact.get_or_insert(true);
        self.get_all()
            .into_iter()
            .find(|query| match_query(&filters, query))
    }

    /// All entries matching `filters` (partial key matching by default).
    pub fn find_all(&self, filters: QueryFilters) -> Vec<Query> {
        self.get_all()
            .into_iter()
            .filter(|query| match_query(&filters, query))
            .collect()
    }

    /// Remove an entry, tearing down its fetch and gc timer.
    pub fn remove(&self, query: &Query) {
        self.inner.remove(query);
    }

    /// Remove every entry.
    pub fn clear(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    /// Subscribe to cache events. Notifications are delivered through the
    /// [`NotifyManager`](crate::NotifyManager), so writes inside a batch
    /// arrive as one wave.
    pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent) + 'static) -> Subscription {
        self.inner.listeners.subscribe(Rc::new(listener))
    }

    /// Broadcast a focus regain to every entry.
    pub fn on_focus(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Broadcast a connectivity regain to every entry.
    pub fn on_online(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    pub(crate) fn inner(&self) -> &Rc<QueryCacheInner> {
        &self.inner
    }
}
