use std::{cell::RefCell, rc::Rc};

use slotmap::SlotMap;

slotmap::new_key_type! {
    pub(crate) struct ListenerKey;
    pub(crate) struct ObserverKey;
}

/// A slotmap-backed listener registry shared by the caches, the managers and
/// the observers.
///
/// Listeners are stored behind `Rc` so a registry can be snapshotted and
/// iterated without holding its `RefCell` borrow across user callbacks, which
/// are free to subscribe or unsubscribe re-entrantly.
pub(crate) struct Listeners<T: ?Sized + 'static> {
    inner: Rc<RefCell<SlotMap<ListenerKey, Rc<T>>>>,
}

impl<T: ?Sized + 'static> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub(crate) fn insert(&self, listener: Rc<T>) -> ListenerKey {
        self.inner.borrow_mut().insert(listener)
    }

    pub(crate) fn remove(&self, key: ListenerKey) -> Option<Rc<T>> {
        self.inner.borrow_mut().remove(key)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// Clone out the current listeners so callers can iterate without holding
    /// the borrow.
    pub(crate) fn snapshot(&self) -> Vec<Rc<T>> {
        self.inner.borrow().values().cloned().collect()
    }

    /// Register a listener and get back a guard that removes it.
    pub(crate) fn subscribe(&self, listener: Rc<T>) -> Subscription {
        let key = self.insert(listener);
        let registry = self.clone();
        Subscription::new(move || {
            registry.remove(key);
        })
    }
}

/// A subscription guard. Dropping it (or calling [`unsubscribe`]) removes the
/// listener it was created for.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    cleanup: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new(cleanup: impl FnOnce() + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Remove the listener now instead of at drop time.
    pub fn unsubscribe(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cleanup.is_some())
            .finish()
    }
}
