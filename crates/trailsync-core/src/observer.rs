//! Callback registry used for queue and status change notifications.
//!
//! Each component owns its own registry. Callbacks run on the notifying
//! thread after the change is committed; a panicking callback is logged and
//! skipped so it cannot undo the change or starve the other listeners.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<E>>,
}

/// Set of callbacks notified with `&E`
pub struct ListenerRegistry<E> {
    inner: Arc<Mutex<Listeners<E>>>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; it stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let Ok(mut listeners) = self.inner.lock() else {
            tracing::warn!("Listener registry poisoned; subscription ignored");
            return Subscription::noop();
        };
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.callbacks.insert(id, Arc::new(callback));

        let registry: Weak<Mutex<Listeners<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = registry.upgrade() {
                    if let Ok(mut listeners) = inner.lock() {
                        listeners.callbacks.remove(&id);
                    }
                }
            })),
        }
    }

    /// Invoke every callback with `event`, isolating panics
    pub fn notify(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking
        let callbacks: Vec<Callback<E>> = match self.inner.lock() {
            Ok(listeners) => listeners.callbacks.values().cloned().collect(),
            Err(_) => return,
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("Change listener panicked; continuing with remaining listeners");
            }
        }
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|listeners| listeners.callbacks.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`ListenerRegistry::subscribe`].
///
/// Dropping it unregisters the callback; call [`Subscription::detach`] to
/// keep the callback for the registry's lifetime.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn noop() -> Self {
        Self { cancel: None }
    }

    /// Unregister the callback now
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered after this handle is gone
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_reaches_every_listener() {
        let registry = ListenerRegistry::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let first = {
            let total = Arc::clone(&total);
            registry.subscribe(move |value| {
                total.fetch_add(*value as usize, Ordering::SeqCst);
            })
        };
        let second = {
            let total = Arc::clone(&total);
            registry.subscribe(move |value| {
                total.fetch_add(*value as usize, Ordering::SeqCst);
            })
        };

        registry.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 4);
        drop((first, second));
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = registry.subscribe(|()| panic!("listener failure"));
        let _good = {
            let calls = Arc::clone(&calls);
            registry.subscribe(move |()| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        registry.notify(&());
        registry.notify(&());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_listener() {
        let registry = ListenerRegistry::<()>::new();
        let first = registry.subscribe(|()| {});
        let second = registry.subscribe(|()| {});
        assert_eq!(registry.len(), 2);

        first.unsubscribe();
        assert_eq!(registry.len(), 1);

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_keeps_listener() {
        let registry = ListenerRegistry::<()>::new();
        registry.subscribe(|()| {}).detach();
        assert_eq!(registry.len(), 1);
    }
}
