use std::{cell::RefCell, rc::Rc};

use crate::{
    notify_manager::notify_manager,
    query_client::QueryClient,
    query_observer::{QueryObserver, QueryObserverResult},
    query_options::QueryOptions,
    subscribable::{Listeners, Subscription},
};

type ResultsListener = dyn Fn(&[QueryObserverResult]);

/// Observes a dynamic list of queries as one unit.
///
/// [`set_queries`](QueriesObserver::set_queries) diffs positionally: the
/// observer at index `i` is reused when the options at `i` still address the
/// same key, re-pointed when they don't, created or dropped as the list grows
/// or shrinks. Listeners receive the full result list whenever any member
/// changes.
#[derive(Clone)]
pub struct QueriesObserver {
    inner: Rc<QueriesObserverInner>,
}

struct QueriesObserverInner {
    client: QueryClient,
    observers: RefCell<Vec<QueryObserver>>,
    member_subscriptions: RefCell<Vec<Subscription>>,
    listeners: Listeners<ResultsListener>,
}

impl QueriesObserver {
    /// An observer over the given list of query options.
    pub fn new(client: &QueryClient, queries: Vec<QueryOptions>) -> Self {
        let observers = queries
            .into_iter()
            .map(|options| QueryObserver::new(client, options))
            .collect();
        Self {
            inner: Rc::new(QueriesObserverInner {
                client: client.clone(),
                observers: RefCell::new(observers),
                member_subscriptions: RefCell::new(Vec::new()),
                listeners: Listeners::default(),
            }),
        }
    }

    /// Replace the observed list, reusing observers positionally.
    pub fn set_queries(&self, queries: Vec<QueryOptions>) {
        let subscribed = !self.inner.listeners.is_empty();
        notify_manager().batch(|| {
            let mut observers = self.inner.observers.borrow_mut();
            for (index, options) in queries.iter().enumerate() {
                let defaulted = self.inner.client.default_query_options(options.clone());
                match observers.get(index) {
                    Some(observer) => observer.set_options(defaulted),
                    None => observers.push(QueryObserver::new(&self.inner.client, defaulted)),
                }
            }
            observers.truncate(queries.len());
        });
        if subscribed {
            self.resubscribe_members();
            self.emit();
        }
    }

    /// The current result of every member, in list order.
    pub fn get_current_results(&self) -> Vec<QueryObserverResult> {
        self.inner
            .observers
            .borrow()
            .iter()
            .map(QueryObserver::get_current_result)
            .collect()
    }

    /// Listen for changes to any member.
    pub fn subscribe(&self, listener: impl Fn(&[QueryObserverResult]) + 'static) -> Subscription {
        let first = self.inner.listeners.is_empty();
        let key = self.inner.listeners.insert(Rc::new(listener));
        if first {
            self.resubscribe_members();
        }
        let observer = self.clone();
        Subscription::new(move || {
            observer.inner.listeners.remove(key);
            if observer.inner.listeners.is_empty() {
                observer.inner.member_subscriptions.borrow_mut().clear();
            }
        })
    }

    fn resubscribe_members(&self) {
        let mut subscriptions = self.inner.member_subscriptions.borrow_mut();
        subscriptions.clear();
        let members = self.inner.observers.borrow().clone();
        for member in members {
            let aggregate = self.clone();
            subscriptions.push(member.subscribe(move |_result| aggregate.emit()));
        }
    }

    fn emit(&self) {
        let results = self.get_current_results();
        for listener in self.inner.listeners.snapshot() {
            listener(&results);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query_key,
        query_options::query_fn,
        query_state::QueryStatus,
        util::test::run_local,
    };
    use serde_json::json;

    fn options_for(id: u32) -> QueryOptions {
        QueryOptions::new()
            .set_query_key(query_key!["todo", id])
            .set_query_fn(query_fn(move |_key| async move { Ok(json!(id)) }))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn subscribing_fetches_every_member() {
        run_local(async {
            let client = QueryClient::new();
            let observer = QueriesObserver::new(&client, vec![options_for(1), options_for(2)]);
            let _subscription = observer.subscribe(|_results| {});
            settle().await;

            let results = observer.get_current_results();
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].data, Some(Rc::new(json!(1))));
            assert_eq!(results[1].data, Some(Rc::new(json!(2))));
        });
    }

    #[test]
    fn set_queries_grows_and_shrinks_the_list() {
        run_local(async {
            let client = QueryClient::new();
            let observer = QueriesObserver::new(&client, vec![options_for(1)]);
            let _subscription = observer.subscribe(|_results| {});
            settle().await;

            observer.set_queries(vec![options_for(1), options_for(2), options_for(3)]);
            settle().await;
            assert_eq!(observer.get_current_results().len(), 3);

            observer.set_queries(vec![options_for(1)]);
            let results = observer.get_current_results();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].data, Some(Rc::new(json!(1))));
        });
    }

    #[test]
    fn a_member_update_delivers_the_full_result_list() {
        run_local(async {
            let client = QueryClient::new();
            let observer = QueriesObserver::new(&client, vec![options_for(1), options_for(2)]);
            let seen = Rc::new(RefCell::new(Vec::new()));
            let _subscription = {
                let seen = seen.clone();
                observer.subscribe(move |results| {
                    seen.borrow_mut()
                        .push(results.iter().map(|result| result.status).collect::<Vec<_>>())
                })
            };
            settle().await;

            let last = seen.borrow().last().cloned().expect("at least one emission");
            assert_eq!(last, vec![QueryStatus::Success, QueryStatus::Success]);
        });
    }

    #[test]
    fn unsubscribed_observer_does_not_fetch() {
        run_local(async {
            let client = QueryClient::new();
            let observer = QueriesObserver::new(&client, vec![options_for(9)]);
            settle().await;
            assert_eq!(observer.get_current_results()[0].status, QueryStatus::Idle);
            assert_eq!(client.get_query_data(&query_key!["todo", 9]), None);
        });
    }
}
