use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use futures::future::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slotmap::SlotMap;

use crate::{
    error::{CancelOptions, FetchError, QueryError},
    garbage_collector::GcTimer,
    instant::Instant,
    key::QueryKey,
    mutation_cache::{MutationCacheEvent, MutationCacheInner},
    notify_manager::notify_manager,
    query_options::MutationOptions,
    retryer::{can_fetch, Retryer, RetryerConfig},
    subscribable::ObserverKey,
};

/// Lifecycle status of a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Not yet executed.
    #[default]
    Idle,
    /// Executing (possibly paused while offline).
    Pending,
    /// Settled successfully.
    Success,
    /// Settled with an error.
    Error,
}

/// The complete observable state of one mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationState {
    /// Whatever `on_mutate` returned, threaded into the later hooks.
    pub context: Option<Rc<Value>>,
    /// The result of a successful mutation.
    pub data: Option<Rc<Value>>,
    /// The terminal error of a failed mutation.
    pub error: Option<FetchError>,
    /// Failures in the current execution.
    pub failure_count: u32,
    /// The most recent failure, retained across retries.
    pub failure_reason: Option<FetchError>,
    /// Paused waiting for connectivity. Survives dehydration so a persisted
    /// offline mutation can resume after a restart.
    pub is_paused: bool,
    /// Lifecycle status.
    pub status: MutationStatus,
    /// The variables the mutation was invoked with.
    pub variables: Option<Rc<Value>>,
    /// When execution began.
    pub submitted_at: Option<Instant>,
}

/// A transition applied to [`MutationState`].
#[derive(Clone, Debug)]
pub enum MutationAction {
    /// One attempt failed and a retry follows.
    Failed {
        /// Failures in this execution so far.
        failure_count: u32,
        /// The error from this attempt.
        error: FetchError,
    },
    /// Execution began (or its context arrived).
    Pending {
        /// The invocation variables.
        variables: Rc<Value>,
        /// The `on_mutate` context, once known.
        context: Option<Rc<Value>>,
        /// Whether execution is starting paused (offline).
        is_paused: bool,
    },
    /// Execution settled successfully.
    Success {
        /// The mutation result.
        data: Rc<Value>,
    },
    /// Execution settled with an error.
    Error {
        /// The terminal error.
        error: FetchError,
    },
    /// Execution paused waiting for connectivity.
    Pause,
    /// Execution resumed.
    Continue,
}

pub(crate) fn reduce(state: &MutationState, action: &MutationAction) -> MutationState {
    match action {
        MutationAction::Failed {
            failure_count,
            error,
        } => MutationState {
            failure_count: *failure_count,
            failure_reason: Some(error.clone()),
            ..state.clone()
        },
        MutationAction::Pending {
            variables,
            context,
            is_paused,
        } => MutationState {
            context: context.clone(),
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: *is_paused,
            status: MutationStatus::Pending,
            variables: Some(variables.clone()),
            submitted_at: Some(Instant::now()),
        },
        MutationAction::Success { data } => MutationState {
            data: Some(data.clone()),
            error: None,
            status: MutationStatus::Success,
            is_paused: false,
            ..state.clone()
        },
        MutationAction::Error { error } => MutationState {
            data: None,
            error: Some(error.clone()),
            failure_count: state.failure_count + 1,
            failure_reason: Some(error.clone()),
            is_paused: false,
            status: MutationStatus::Error,
            ..state.clone()
        },
        MutationAction::Pause => MutationState {
            is_paused: true,
            ..state.clone()
        },
        MutationAction::Continue => MutationState {
            is_paused: false,
            ..state.clone()
        },
    }
}

pub(crate) trait MutationObserverLink {
    fn on_mutation_update(&self, action: &MutationAction);
}

/// One tracked side effect: variables in, data or error out, with retry and
/// offline-pause handling in between. Created by
/// [`MutationCache::build`](crate::MutationCache); cloning is shallow.
#[derive(Clone)]
pub struct Mutation {
    inner: Rc<MutationInner>,
}

struct MutationInner {
    mutation_id: u64,
    cache: Weak<MutationCacheInner>,
    options: RefCell<MutationOptions>,
    state: RefCell<MutationState>,
    observers: RefCell<SlotMap<ObserverKey, Weak<dyn MutationObserverLink>>>,
    retryer: RefCell<Option<Retryer<Rc<Value>>>>,
    gc: GcTimer,
}

impl Mutation {
    pub(crate) fn new(
        cache: Weak<MutationCacheInner>,
        mutation_id: u64,
        options: MutationOptions,
        state: Option<MutationState>,
    ) -> Self {
        let gc = GcTimer::new(options.resolved_gc_time());
        let mutation = Self {
            inner: Rc::new(MutationInner {
                mutation_id,
                cache,
                state: RefCell::new(state.unwrap_or_default()),
                options: RefCell::new(options),
                observers: RefCell::new(SlotMap::with_key()),
                retryer: RefCell::new(None),
                gc,
            }),
        };
        // Entries are born unobserved; the first observer disarms this.
        mutation.schedule_gc();
        mutation
    }

    /// The cache-assigned sequence number, reflecting submission order.
    pub fn mutation_id(&self) -> u64 {
        self.inner.mutation_id
    }

    /// The optional key used for filtering and dehydration.
    pub fn mutation_key(&self) -> Option<QueryKey> {
        self.inner.options.borrow().mutation_key.clone()
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> MutationState {
        self.inner.state.borrow().clone()
    }

    pub(crate) fn options(&self) -> MutationOptions {
        self.inner.options.borrow().clone()
    }

    pub(crate) fn set_options(&self, options: MutationOptions) {
        self.inner.gc.update_gc_time(options.resolved_gc_time());
        *self.inner.options.borrow_mut() = options;
    }

    /// Whether any observer is attached.
    pub fn is_active(&self) -> bool {
        self.inner
            .observers
            .borrow()
            .values()
            .any(|observer| observer.strong_count() > 0)
    }

    pub(crate) fn same_entry(&self, other: &Mutation) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the mutation to completion.
    ///
    /// Hook order on each path is fixed: cache-level hooks run before the
    /// mutation's own, `on_settled` runs on both paths, and the terminal
    /// state dispatch happens only after every hook has finished.
    pub(crate) async fn execute(&self, variables: Rc<Value>) -> Result<Rc<Value>, FetchError> {
        let options = self.options();
        let network_mode = options.resolved_network_mode();
        // A restored paused mutation is already pending; skip the pre-hooks
        // that ran before it was persisted.
        let restored = self.state().status == MutationStatus::Pending;

        let operation = {
            let mutation_fn = options.mutation_fn.clone();
            let variables = variables.clone();
            Rc::new(move || match mutation_fn.clone() {
                Some(mutation_fn) => {
                    let fut = mutation_fn(variables.clone());
                    async move { fut.await.map(Rc::new) }.boxed_local()
                }
                None => futures::future::ready(Err(FetchError::new(
                    "no mutation function configured",
                )))
                .boxed_local(),
            })
        };

        let retryer = Retryer::start(RetryerConfig {
            operation,
            retry: options.resolved_retry(),
            retry_delay: options.resolved_retry_delay(),
            network_mode,
            on_fail: {
                let mutation = self.clone();
                Rc::new(move |failure_count, error| {
                    mutation.dispatch(MutationAction::Failed {
                        failure_count,
                        error,
                    });
                })
            },
            on_pause: {
                let mutation = self.clone();
                Rc::new(move || mutation.dispatch(MutationAction::Pause))
            },
            on_continue: {
                let mutation = self.clone();
                Rc::new(move || mutation.dispatch(MutationAction::Continue))
            },
        });
        *self.inner.retryer.borrow_mut() = Some(retryer.clone());

        let result: Result<Rc<Value>, FetchError> = async {
            if !restored {
                self.dispatch(MutationAction::Pending {
                    variables: variables.clone(),
                    context: None,
                    is_paused: !can_fetch(network_mode),
                });
                if let Some(cache) = self.cache() {
                    if let Some(on_mutate) = cache.config().on_mutate.clone() {
                        on_mutate(variables.clone(), self.clone()).await;
                    }
                }
                if let Some(on_mutate) = options.on_mutate.clone() {
                    if let Some(context) = on_mutate(variables.clone()).await? {
                        self.dispatch(MutationAction::Pending {
                            variables: variables.clone(),
                            context: Some(Rc::new(context)),
                            is_paused: self.state().is_paused,
                        });
                    }
                }
            }
            retryer.promise().await.map_err(|error| match error {
                QueryError::Fetch(error) => error,
                QueryError::Cancelled(_) => FetchError::new("mutation was cancelled"),
            })
        }
        .await;

        let context = self.state().context;
        match &result {
            Ok(data) => {
                if let Some(cache) = self.cache() {
                    if let Some(on_success) = cache.config().on_success.clone() {
                        on_success(data.clone(), variables.clone(), context.clone(), self.clone())
                            .await;
                    }
                }
                if let Some(on_success) = options.on_success.clone() {
                    on_success(data.clone(), variables.clone(), context.clone()).await;
                }
                if let Some(cache) = self.cache() {
                    if let Some(on_settled) = cache.config().on_settled.clone() {
                        on_settled(
                            Some(data.clone()),
                            None,
                            variables.clone(),
                            context.clone(),
                            self.clone(),
                        )
                        .await;
                    }
                }
                if let Some(on_settled) = options.on_settled.clone() {
                    on_settled(Some(data.clone()), None, variables.clone(), context.clone()).await;
                }
                self.dispatch(MutationAction::Success { data: data.clone() });
            }
            Err(error) => {
                tracing::debug!(mutation_id = self.inner.mutation_id, error = %error, "mutation failed");
                if let Some(cache) = self.cache() {
                    if let Some(on_error) = cache.config().on_error.clone() {
                        on_error(error.clone(), variables.clone(), context.clone(), self.clone())
                            .await;
                    }
                }
                if let Some(on_error) = options.on_error.clone() {
                    on_error(error.clone(), variables.clone(), context.clone()).await;
                }
                if let Some(cache) = self.cache() {
                    if let Some(on_settled) = cache.config().on_settled.clone() {
                        on_settled(
                            None,
                            Some(error.clone()),
                            variables.clone(),
                            context.clone(),
                            self.clone(),
                        )
                        .await;
                    }
                }
                if let Some(on_settled) = options.on_settled.clone() {
                    on_settled(None, Some(error.clone()), variables.clone(), context.clone()).await;
                }
                self.dispatch(MutationAction::Error {
                    error: error.clone(),
                });
            }
        }

        *self.inner.retryer.borrow_mut() = None;
        if !self.is_active() {
            self.schedule_gc();
        }
        result
    }

    /// Resume a paused execution, or re-execute a mutation restored from a
    /// persisted snapshot (which has state but no live retryer).
    pub(crate) async fn continue_execute(&self) -> Result<Rc<Value>, FetchError> {
        let retryer = self.inner.retryer.borrow().clone();
        match retryer {
            Some(retryer) => {
                retryer.continue_retry();
                retryer.promise().await.map_err(|error| match error {
                    QueryError::Fetch(error) => error,
                    QueryError::Cancelled(_) => FetchError::new("mutation was cancelled"),
                })
            }
            None => match self.state().variables {
                Some(variables) => self.execute(variables).await,
                None => Err(FetchError::new("cannot resume a mutation without variables")),
            },
        }
    }

    pub(crate) fn add_observer(&self, observer: &Rc<dyn MutationObserverLink>) -> ObserverKey {
        let key = self
            .inner
            .observers
            .borrow_mut()
            .insert(Rc::downgrade(observer));
        self.inner.gc.clear();
        key
    }

    pub(crate) fn remove_observer(&self, key: ObserverKey) {
        self.inner.observers.borrow_mut().remove(key);
        if !self.is_active() {
            self.schedule_gc();
        }
    }

    pub(crate) fn destroy(&self) {
        self.inner.gc.clear();
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.cancel(CancelOptions::silent());
        }
    }

    fn schedule_gc(&self) {
        let mutation = self.clone();
        self.inner.gc.schedule(move || {
            let finished = mutation.state().status != MutationStatus::Pending;
            if finished && !mutation.is_active() {
                if let Some(cache) = mutation.cache() {
                    cache.remove(&mutation);
                }
            }
        });
    }

    pub(crate) fn dispatch(&self, action: MutationAction) {
        let next = {
            let state = self.inner.state.borrow();
            reduce(&state, &action)
        };
        *self.inner.state.borrow_mut() = next;
        notify_manager().batch(|| {
            let observers: Vec<_> = {
                let mut observers = self.inner.observers.borrow_mut();
                observers.retain(|_, observer| observer.strong_count() > 0);
                observers.values().filter_map(Weak::upgrade).collect()
            };
            for observer in observers {
                observer.on_mutation_update(&action);
            }
            if let Some(cache) = self.cache() {
                cache.notify(MutationCacheEvent::Updated {
                    mutation: self.clone(),
                    action: action.clone(),
                });
            }
        });
    }

    fn cache(&self) -> Option<Rc<MutationCacheInner>> {
        self.inner.cache.upgrade()
    }
}
