use std::{cell::Cell, cell::RefCell, rc::Rc};

use crate::subscribable::{Listeners, Subscription};

thread_local! {
    static FOCUS_MANAGER: FocusManager = FocusManager::new();
}

/// Access the thread's focus manager.
pub fn focus_manager() -> FocusManager {
    FOCUS_MANAGER.with(Clone::clone)
}

type FocusListener = dyn Fn(bool);
type ListenerCleanup = Box<dyn FnOnce()>;

/// Tracks whether the application is focused.
///
/// The cache itself has no window to watch; a host embeds its platform's
/// focus events via [`set_event_listener`](FocusManager::set_event_listener)
/// and the mounted [`QueryClient`](crate::QueryClient) reacts by refetching
/// stale queries that opted in. Without any platform signal the application
/// counts as focused.
pub struct FocusManager {
    inner: Rc<FocusManagerInner>,
}

struct FocusManagerInner {
    focused: Cell<Option<bool>>,
    listeners: Listeners<FocusListener>,
    cleanup: RefCell<Option<ListenerCleanup>>,
}

impl Clone for FocusManager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl FocusManager {
    fn new() -> Self {
        Self {
            inner: Rc::new(FocusManagerInner {
                focused: Cell::new(None),
                listeners: Listeners::default(),
                cleanup: RefCell::new(None),
            }),
        }
    }

    /// Whether the application is currently focused. Defaults to `true` until
    /// a platform signal or manual override says otherwise.
    pub fn is_focused(&self) -> bool {
        self.inner.focused.get().unwrap_or(true)
    }

    /// Manually override the focus state, notifying listeners on change.
    pub fn set_focused(&self, focused: Option<bool>) {
        let previous = self.inner.focused.replace(focused);
        if previous == focused {
            return;
        }
        if let Some(focused) = focused {
            tracing::debug!(focused, "focus state changed");
            for listener in self.inner.listeners.snapshot() {
                listener(focused);
            }
        }
    }

    /// Install the platform hookup. `setup` receives a callback to invoke on
    /// focus changes and returns a teardown closure; a previously installed
    /// hookup is torn down first.
    pub fn set_event_listener(
        &self,
        setup: impl FnOnce(Box<dyn Fn(Option<bool>)>) -> ListenerCleanup,
    ) {
        let manager = self.clone();
        let cleanup = setup(Box::new(move |focused| manager.set_focused(focused)));
        if let Some(previous) = self.inner.cleanup.borrow_mut().replace(cleanup) {
            previous();
        }
    }

    /// Subscribe to focus changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> Subscription {
        self.inner.listeners.subscribe(Rc::new(listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_focused() {
        let manager = FocusManager::new();
        assert!(manager.is_focused());
    }

    #[test]
    fn notifies_only_on_change() {
        let manager = FocusManager::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let _subscription = {
            let events = events.clone();
            manager.subscribe(move |focused| events.borrow_mut().push(focused))
        };
        manager.set_focused(Some(false));
        manager.set_focused(Some(false));
        manager.set_focused(Some(true));
        assert_eq!(*events.borrow(), vec![false, true]);
    }

    #[test]
    fn replacing_the_event_listener_tears_down_the_old_one() {
        let manager = FocusManager::new();
        let torn_down = Rc::new(Cell::new(false));
        {
            let torn_down = torn_down.clone();
            manager.set_event_listener(move |_notify| Box::new(move || torn_down.set(true)));
        }
        manager.set_event_listener(|_notify| Box::new(|| {}));
        assert!(torn_down.get());
    }
}
