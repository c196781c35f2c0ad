//! Fan-out listener registry shared by the event sink and the log relay.
//!
//! Listeners are invoked synchronously, in subscription order, outside the
//! registry lock so a listener may itself subscribe, unsubscribe or emit.
//! A panicking listener is isolated: the remaining listeners still run and the
//! failure is reported back to the caller.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

pub struct ListenerSet<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

/// Failure raised by one listener during a notification round.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub listener_id: u64,
    pub message: String,
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            registry.next_id += 1;
            let id = registry.next_id;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `value` to every listener and collect the ones that panicked.
    pub fn notify(&self, value: &T) -> Vec<ListenerFailure> {
        let snapshot: Vec<(u64, Listener<T>)> = lock(&self.registry).listeners.clone();

        let mut failures = Vec::new();
        for (id, listener) in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
                failures.push(ListenerFailure {
                    listener_id: id,
                    message: panic_message(payload.as_ref()),
                });
            }
        }
        failures
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability to deregister a listener.
///
/// Dropping the handle deregisters too; call [`Subscription::detach`] to keep
/// the listener for the lifetime of its registry.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

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
    fn test_notify_in_subscription_order() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        let _s1 = set.subscribe(move |v| a.lock().unwrap().push(("first", *v)));
        let b = seen.clone();
        let _s2 = set.subscribe(move |v| b.lock().unwrap().push(("second", *v)));

        set.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = set.subscribe(|_| panic!("boom"));
        let c = calls.clone();
        let _good = set.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let failures = set.notify(&1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop_deregister() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let explicit = set.subscribe(|_| {});
        {
            let _scoped = set.subscribe(|_| {});
            assert_eq!(set.len(), 2);
        }
        assert_eq!(set.len(), 1);

        explicit.unsubscribe();
        assert!(set.is_empty());
    }

    #[test]
    fn test_detach_keeps_listener() {
        let set: ListenerSet<u32> = ListenerSet::new();
        set.subscribe(|_| {}).detach();
        assert_eq!(set.len(), 1);
    }
}
