use std::{cell::Cell, cell::RefCell, rc::Rc};

use crate::subscribable::{Listeners, Subscription};

thread_local! {
    static ONLINE_MANAGER: OnlineManager = OnlineManager::new();
}

/// Access the thread's online manager.
pub fn online_manager() -> OnlineManager {
    ONLINE_MANAGER.with(Clone::clone)
}

type OnlineListener = dyn Fn(bool);
type ListenerCleanup = Box<dyn FnOnce()>;

/// Tracks network connectivity.
///
/// The retryer consults this before every attempt: while offline, fetches
/// under [`NetworkMode::Online`](crate::NetworkMode::Online) pause instead of
/// burning retries. A host wires its connectivity events in via
/// [`set_event_listener`](OnlineManager::set_event_listener); the default is
/// online.
pub struct OnlineManager {
    inner: Rc<OnlineManagerInner>,
}

struct OnlineManagerInner {
    online: Cell<bool>,
    listeners: Listeners<OnlineListener>,
    cleanup: RefCell<Option<ListenerCleanup>>,
}

impl Clone for OnlineManager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl OnlineManager {
    fn new() -> Self {
        Self {
            inner: Rc::new(OnlineManagerInner {
                online: Cell::new(true),
                listeners: Listeners::default(),
                cleanup: RefCell::new(None),
            }),
        }
    }

    /// Whether the network is currently reachable.
    pub fn is_online(&self) -> bool {
        self.inner.online.get()
    }

    /// Manually override connectivity, notifying listeners on change.
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.replace(online);
        if previous == online {
            return;
        }
        tracing::debug!(online, "connectivity changed");
        for listener in self.inner.listeners.snapshot() {
            listener(online);
        }
    }

    /// Install the platform hookup, tearing down any previous one. `setup`
    /// receives a callback to invoke on connectivity changes and returns a
    /// teardown closure.
    pub fn set_event_listener(
        &self,
        setup: impl FnOnce(Box<dyn Fn(bool)>) -> ListenerCleanup,
    ) {
        let manager = self.clone();
        let cleanup = setup(Box::new(move |online| manager.set_online(online)));
        if let Some(previous) = self.inner.cleanup.borrow_mut().replace(cleanup) {
            previous();
        }
    }

    /// Subscribe to connectivity changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> Subscription {
        self.inner.listeners.subscribe(Rc::new(listener))
    }
}
