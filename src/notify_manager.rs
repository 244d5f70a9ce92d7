use std::{cell::Cell, cell::RefCell, rc::Rc};

type NotifyCallback = Box<dyn FnOnce()>;
type NotifyFn = Rc<dyn Fn(NotifyCallback)>;

thread_local! {
    static NOTIFY_MANAGER: NotifyManager = NotifyManager::new();
}

/// Access the thread's notification scheduler.
pub fn notify_manager() -> NotifyManager {
    NOTIFY_MANAGER.with(Clone::clone)
}

/// Defers and batches observer notifications.
///
/// Inside a [`batch`](NotifyManager::batch) scope every
/// [`schedule`](NotifyManager::schedule)d callback is queued, and the whole
/// queue runs once when the outermost scope exits. Cache writes wrap their
/// notification fan-out in a batch so a bulk operation touching many queries
/// produces a single wave of listener calls instead of one per write.
pub struct NotifyManager {
    inner: Rc<NotifyManagerInner>,
}

struct NotifyManagerInner {
    depth: Cell<usize>,
    queue: RefCell<Vec<NotifyCallback>>,
    notify_fn: RefCell<NotifyFn>,
    batch_notify_fn: RefCell<NotifyFn>,
}

impl Clone for NotifyManager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl NotifyManager {
    fn new() -> Self {
        Self {
            inner: Rc::new(NotifyManagerInner {
                depth: Cell::new(0),
                queue: RefCell::new(Vec::new()),
                notify_fn: RefCell::new(Rc::new(|callback| callback())),
                batch_notify_fn: RefCell::new(Rc::new(|callback| callback())),
            }),
        }
    }

    /// Run `f` with notifications deferred; flush when the outermost batch
    /// scope ends. Nested batches merge into the outer one.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.depth.set(self.inner.depth.get() + 1);
        let result = f();
        self.inner.depth.set(self.inner.depth.get() - 1);
        if self.inner.depth.get() == 0 {
            self.flush();
        }
        result
    }

    /// Queue a callback if inside a batch, otherwise run it immediately
    /// through the notify function.
    pub fn schedule(&self, callback: impl FnOnce() + 'static) {
        if self.inner.depth.get() > 0 {
            self.inner.queue.borrow_mut().push(Box::new(callback));
        } else {
            let notify = self.inner.notify_fn.borrow().clone();
            notify(Box::new(callback));
        }
    }

    /// Wrap a callback so invocations made from inside it are batched.
    pub fn batch_calls<A: 'static>(
        &self,
        callback: impl Fn(A) + 'static,
    ) -> impl Fn(A) + 'static {
        let manager = self.clone();
        move |arg| {
            manager.schedule_ref(&callback, arg);
        }
    }

    fn schedule_ref<A: 'static>(&self, callback: &impl Fn(A), arg: A) {
        // Immediate path only; queued callbacks are FnOnce and own their args.
        self.batch(|| callback(arg));
    }

    fn flush(&self) {
        // Callbacks may schedule further notifications; drain until quiet.
        loop {
            let queued = std::mem::take(&mut *self.inner.queue.borrow_mut());
            if queued.is_empty() {
                break;
            }
            let batch_notify = self.inner.batch_notify_fn.borrow().clone();
            batch_notify(Box::new(move || {
                for callback in queued {
                    callback();
                }
            }));
        }
    }

    /// Replace how a single immediate notification is delivered.
    pub fn set_notify_fn(&self, notify: impl Fn(NotifyCallback) + 'static) {
        *self.inner.notify_fn.borrow_mut() = Rc::new(notify);
    }

    /// Replace how a flushed batch is delivered (e.g. to hook in a renderer's
    /// own batching primitive).
    pub fn set_batch_notify_fn(&self, notify: impl Fn(NotifyCallback) + 'static) {
        *self.inner.batch_notify_fn.borrow_mut() = Rc::new(notify);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_inside_a_batch_run_once_at_the_end() {
        let manager = NotifyManager::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        manager.batch(|| {
            for i in 0..3 {
                let order = order.clone();
                manager.schedule(move || order.borrow_mut().push(i));
            }
            assert!(order.borrow().is_empty());
        });
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn nested_batches_flush_with_the_outermost() {
        let manager = NotifyManager::new();
        let fired = Rc::new(Cell::new(false));
        manager.batch(|| {
            manager.batch(|| {
                let fired = fired.clone();
                manager.schedule(move || fired.set(true));
            });
            assert!(!fired.get());
        });
        assert!(fired.get());
    }

    #[test]
    fn schedule_outside_a_batch_runs_immediately() {
        let manager = NotifyManager::new();
        let fired = Rc::new(Cell::new(false));
        {
            let fired = fired.clone();
            manager.schedule(move || fired.set(true));
        }
        assert!(fired.get());
    }

    #[test]
    fn custom_batch_notify_fn_receives_the_flush() {
        let manager = NotifyManager::new();
        let via_custom = Rc::new(Cell::new(false));
        {
            let via_custom = via_custom.clone();
            manager.set_batch_notify_fn(move |callback| {
                via_custom.set(true);
                callback();
            });
        }
        let fired = Rc::new(Cell::new(false));
        manager.batch(|| {
            let fired = fired.clone();
            manager.schedule(move || fired.set(true));
        });
        assert!(fired.get());
        assert!(via_custom.get());
    }
}
