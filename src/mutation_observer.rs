use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use serde_json::Value;

use crate::{
    error::FetchError,
    mutation::{Mutation, MutationAction, MutationObserverLink, MutationState},
    notify_manager::notify_manager,
    query_client::QueryClient,
    query_options::{MutationOptions, OnErrorFn, OnSettledFn, OnSuccessFn},
    subscribable::{Listeners, ObserverKey, Subscription},
};

/// What a mutation observer reports: the observed mutation's state.
pub type MutationObserverResult = MutationState;

/// Callbacks for a single [`mutate`](MutationObserver::mutate) call. These
/// run after the mutation-level hooks on the same path, and only for the call
/// they were passed to.
#[derive(Clone, Default)]
pub struct MutateOptions {
    /// Runs after the mutation-level success hook.
    pub on_success: Option<OnSuccessFn>,
    /// Runs after the mutation-level error hook.
    pub on_error: Option<OnErrorFn>,
    /// Runs after the mutation-level settled hook.
    pub on_settled: Option<OnSettledFn>,
}

type ResultListener = dyn Fn(&MutationObserverResult);

/// Binds mutation options to whatever mutation is currently running for them.
///
/// Each [`mutate`](MutationObserver::mutate) call builds a fresh
/// [`Mutation`] in the cache and re-points the observer at it; the previous
/// mutation is released to garbage collection. Cloning is shallow.
#[derive(Clone)]
pub struct MutationObserver {
    inner: Rc<MutationObserverInner>,
}

struct MutationObserverInner {
    client: QueryClient,
    options: RefCell<MutationOptions>,
    mutation: RefCell<Option<Mutation>>,
    observer_key: Cell<Option<ObserverKey>>,
    current_result: RefCell<MutationObserverResult>,
    listeners: Listeners<ResultListener>,
}

impl MutationObserver {
    /// An observer for `options` on `client`. Nothing runs until
    /// [`mutate`](MutationObserver::mutate).
    pub fn new(client: &QueryClient, options: MutationOptions) -> Self {
        let options = client.default_mutation_options(options);
        Self {
            inner: Rc::new(MutationObserverInner {
                client: client.clone(),
                options: RefCell::new(options),
                mutation: RefCell::new(None),
                observer_key: Cell::new(None),
                current_result: RefCell::new(MutationObserverResult::default()),
                listeners: Listeners::default(),
            }),
        }
    }

    /// Replace the options used by subsequent [`mutate`] calls.
    ///
    /// [`mutate`]: MutationObserver::mutate
    pub fn set_options(&self, options: MutationOptions) {
        let options = self.inner.client.default_mutation_options(options);
        if let Some(mutation) = self.inner.mutation.borrow().as_ref() {
            mutation.set_options(options.clone());
        }
        *self.inner.options.borrow_mut() = options;
    }

    /// Run the mutation. Call-site callbacks in `mutate_options` fire after
    /// the mutation-level hooks; the returned result is the same outcome the
    /// hooks saw.
    pub async fn mutate(
        &self,
        variables: Value,
        mutate_options: MutateOptions,
    ) -> Result<Rc<Value>, FetchError> {
        self.detach();

        let options = self.inner.options.borrow().clone();
        let mutation = self.inner.client.mutation_cache().build(options, None);
        let link: Rc<dyn MutationObserverLink> = self.inner.clone();
        let key = mutation.add_observer(&link);
        self.inner.observer_key.set(Some(key));
        *self.inner.mutation.borrow_mut() = Some(mutation.clone());

        let variables = Rc::new(variables);
        let result = mutation.execute(variables.clone()).await;

        let context = mutation.state().context;
        match &result {
            Ok(data) => {
                if let Some(on_success) = mutate_options.on_success {
                    on_success(data.clone(), variables.clone(), context.clone()).await;
                }
                if let Some(on_settled) = mutate_options.on_settled {
                    on_settled(Some(data.clone()), None, variables.clone(), context).await;
                }
            }
            Err(error) => {
                if let Some(on_error) = mutate_options.on_error {
                    on_error(error.clone(), variables.clone(), context.clone()).await;
                }
                if let Some(on_settled) = mutate_options.on_settled {
                    on_settled(None, Some(error.clone()), variables.clone(), context).await;
                }
            }
        }
        result
    }

    /// Forget the current mutation and report an idle result.
    pub fn reset(&self) {
        self.detach();
        *self.inner.mutation.borrow_mut() = None;
        let result = MutationObserverResult::default();
        *self.inner.current_result.borrow_mut() = result.clone();
        self.inner.notify(&result);
    }

    /// The state of the current mutation, idle when none has run.
    pub fn get_current_result(&self) -> MutationObserverResult {
        self.inner.current_result.borrow().clone()
    }

    /// Listen for state changes of the current mutation.
    pub fn subscribe(&self, listener: impl Fn(&MutationObserverResult) + 'static) -> Subscription {
        self.inner.listeners.subscribe(Rc::new(listener))
    }

    fn detach(&self) {
        if let Some(key) = self.inner.observer_key.take() {
            if let Some(mutation) = self.inner.mutation.borrow().as_ref() {
                mutation.remove_observer(key);
            }
        }
    }
}

impl MutationObserverInner {
    fn notify(&self, result: &MutationObserverResult) {
        for listener in self.listeners.snapshot() {
            let result = result.clone();
            notify_manager().schedule(move || listener(&result));
        }
    }
}

impl MutationObserverLink for MutationObserverInner {
    fn on_mutation_update(&self, _action: &MutationAction) {
        let result = match self.mutation.borrow().as_ref() {
            Some(mutation) => mutation.state(),
            None => MutationObserverResult::default(),
        };
        *self.current_result.borrow_mut() = result.clone();
        self.notify(&result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mutation::MutationStatus, query_key, query_options::mutation_fn, util::test::run_local,
    };
    use serde_json::json;

    #[test]
    fn call_site_callbacks_run_after_mutation_level_hooks() {
        run_local(async {
            let client = QueryClient::new();
            let order = Rc::new(RefCell::new(Vec::new()));
            let options = {
                let order = order.clone();
                MutationOptions::new()
                    .set_mutation_fn(mutation_fn(|_vars| async { Ok(json!("done")) }))
                    .set_on_success(Rc::new(move |_data, _vars, _ctx| {
                        let order = order.clone();
                        Box::pin(async move { order.borrow_mut().push("mutation_success") })
                    }))
            };
            let observer = MutationObserver::new(&client, options);
            let mutate_options = {
                let on_success_order = order.clone();
                let on_settled_order = order.clone();
                MutateOptions {
                    on_success: Some(Rc::new(move |_data, _vars, _ctx| {
                        let order = on_success_order.clone();
                        Box::pin(async move { order.borrow_mut().push("call_site_success") })
                    })),
                    on_settled: Some(Rc::new(move |_data, _err, _vars, _ctx| {
                        let order = on_settled_order.clone();
                        Box::pin(async move { order.borrow_mut().push("call_site_settled") })
                    })),
                    ..Default::default()
                }
            };
            let result = observer.mutate(json!({ "id": 1 }), mutate_options).await;
            assert_eq!(result, Ok(Rc::new(json!("done"))));
            assert_eq!(
                *order.borrow(),
                vec!["mutation_success", "call_site_success", "call_site_settled"]
            );
        });
    }

    #[test]
    fn observer_reports_the_mutation_lifecycle() {
        run_local(async {
            let client = QueryClient::new();
            let observer = MutationObserver::new(
                &client,
                MutationOptions::new()
                    .set_mutation_key(query_key!["add-todo"])
                    .set_mutation_fn(mutation_fn(|_vars| async { Ok(json!(7)) })),
            );
            let statuses = Rc::new(RefCell::new(Vec::new()));
            let _subscription = {
                let statuses = statuses.clone();
                observer.subscribe(move |result| statuses.borrow_mut().push(result.status))
            };
            assert_eq!(observer.get_current_result().status, MutationStatus::Idle);
            observer
                .mutate(json!(null), MutateOptions::default())
                .await
                .expect("mutation succeeds");
            assert_eq!(
                observer.get_current_result().status,
                MutationStatus::Success
            );
            assert_eq!(
                *statuses.borrow(),
                vec![MutationStatus::Pending, MutationStatus::Success]
            );
            assert_eq!(client.is_mutating(), 0);
        });
    }

    #[test]
    fn reset_returns_to_idle() {
        run_local(async {
            let client = QueryClient::new();
            let observer = MutationObserver::new(
                &client,
                MutationOptions::new()
                    .set_mutation_fn(mutation_fn(|_vars| async { Ok(json!(1)) })),
            );
            observer
                .mutate(json!(null), MutateOptions::default())
                .await
                .expect("mutation succeeds");
            assert_eq!(
                observer.get_current_result().status,
                MutationStatus::Success
            );
            observer.reset();
            assert_eq!(observer.get_current_result().status, MutationStatus::Idle);
        });
    }
}
