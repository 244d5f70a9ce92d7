use std::{cell::Cell, rc::Rc};

use futures::{
    future::{self, Either, FutureExt, LocalBoxFuture, Shared},
    StreamExt,
};
use futures_channel::{mpsc, oneshot};

use crate::{
    error::{CancelOptions, FetchError, QueryError},
    online_manager::online_manager,
    query_options::{NetworkMode, RetryDelay, RetryPolicy},
};

/// Whether an operation under `network_mode` may attempt right now.
pub(crate) fn can_fetch(network_mode: NetworkMode) -> bool {
    network_mode != NetworkMode::Online || online_manager().is_online()
}

type Operation<T> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<T, FetchError>>>;
type CancelSignal = Shared<LocalBoxFuture<'static, CancelOptions>>;

/// Everything the retry loop needs. The `on_*` hooks let the owning entity
/// dispatch state transitions (failure counts, pause, continue) as they
/// happen, before the promise settles.
pub(crate) struct RetryerConfig<T> {
    pub operation: Operation<T>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub on_fail: Rc<dyn Fn(u32, FetchError)>,
    pub on_pause: Rc<dyn Fn()>,
    pub on_continue: Rc<dyn Fn()>,
}

/// Drives one operation to completion through retries, backoff, offline
/// pauses and cancellation.
///
/// The retryer does not spawn; [`promise`](Retryer::promise) is a shared
/// future the owner must drive (queries spawn a driver task, mutations await
/// it inline). Every clone of the promise resolves to the same outcome, which
/// is what makes fetch deduplication possible.
pub(crate) struct Retryer<T: Clone + 'static> {
    promise: Shared<LocalBoxFuture<'static, Result<T, QueryError>>>,
    cancel_tx: Rc<Cell<Option<oneshot::Sender<CancelOptions>>>>,
    continue_tx: mpsc::UnboundedSender<()>,
    paused: Rc<Cell<bool>>,
}

impl<T: Clone + 'static> Clone for Retryer<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            cancel_tx: self.cancel_tx.clone(),
            continue_tx: self.continue_tx.clone(),
            paused: self.paused.clone(),
        }
    }
}

impl<T: Clone + 'static> Retryer<T> {
    pub(crate) fn start(config: RetryerConfig<T>) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel::<CancelOptions>();
        // A dropped sender means the retryer itself was torn down; treat it
        // as a silent cancellation.
        let cancel_signal: CancelSignal = cancel_rx
            .map(|received| received.unwrap_or_else(|_| CancelOptions::silent()))
            .boxed_local()
            .shared();
        let (continue_tx, mut continue_rx) = mpsc::unbounded::<()>();
        let paused = Rc::new(Cell::new(false));

        let run = {
            let paused = paused.clone();
            let cancel_signal = cancel_signal.clone();
            async move {
                let RetryerConfig {
                    operation,
                    retry,
                    retry_delay,
                    network_mode,
                    on_fail,
                    on_pause,
                    on_continue,
                } = config;
                let mut failure_count: u32 = 0;

                if !can_fetch(network_mode) {
                    wait_for_continue(&paused, &mut continue_rx, &cancel_signal, &on_pause, &on_continue)
                        .await?;
                }

                loop {
                    let attempt = operation();
                    match future::select(attempt, cancel_signal.clone()).await {
                        Either::Left((Ok(value), _)) => return Ok(value),
                        Either::Left((Err(error), _)) => {
                            failure_count += 1;
                            if !retry.should_retry(failure_count, &error) {
                                return Err(QueryError::Fetch(error));
                            }
                            // Only reported when a retry follows; the terminal
                            // failure is counted by the Error transition.
                            on_fail(failure_count, error);
                            let delay = retry_delay.for_failure(failure_count);
                            if !delay.is_zero() {
                                let sleep = Box::pin(tokio::time::sleep(delay));
                                if let Either::Right((options, _)) =
                                    future::select(sleep, cancel_signal.clone()).await
                                {
                                    return Err(QueryError::Cancelled(options));
                                }
                            }
                            if !can_fetch(network_mode) {
                                wait_for_continue(
                                    &paused,
                                    &mut continue_rx,
                                    &cancel_signal,
                                    &on_pause,
                                    &on_continue,
                                )
                                .await?;
                            }
                        }
                        Either::Right((options, _)) => return Err(QueryError::Cancelled(options)),
                    }
                }
            }
        };

        Self {
            promise: run.boxed_local().shared(),
            cancel_tx: Rc::new(Cell::new(Some(cancel_tx))),
            continue_tx,
            paused,
        }
    }

    /// A clone of the outcome future. Cheap; all clones settle together.
    pub(crate) fn promise(
        &self,
    ) -> Shared<LocalBoxFuture<'static, Result<T, QueryError>>> {
        self.promise.clone()
    }

    /// Cancel the operation. No-op once the promise has settled.
    pub(crate) fn cancel(&self, options: CancelOptions) {
        if let Some(sender) = self.cancel_tx.take() {
            let _ = sender.send(options);
        }
    }

    /// Resume a paused operation (e.g. on reconnect).
    pub(crate) fn continue_retry(&self) {
        let _ = self.continue_tx.unbounded_send(());
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.get()
    }
}

async fn wait_for_continue(
    paused: &Cell<bool>,
    continue_rx: &mut mpsc::UnboundedReceiver<()>,
    cancel_signal: &CancelSignal,
    on_pause: &Rc<dyn Fn()>,
    on_continue: &Rc<dyn Fn()>,
) -> Result<(), QueryError> {
    paused.set(true);
    on_pause();
    let outcome = future::select(continue_rx.next(), cancel_signal.clone()).await;
    paused.set(false);
    match outcome {
        Either::Left(_) => {
            on_continue();
            Ok(())
        }
        Either::Right((options, _)) => Err(QueryError::Cancelled(options)),
    }
}
