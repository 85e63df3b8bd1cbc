use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler<T>,
}

struct RegistryInner<T> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: 'static> Detach for RegistryInner<T> {
    fn detach(&self, id: u64) {
        self.entries.lock().retain(|entry| entry.id != id);
    }
}

/// Ordered set of handlers for one event category.
///
/// Handlers may subscribe or unsubscribe (themselves or others) while a
/// dispatch is running. Dispatch walks a snapshot taken at its start, so
/// handlers added mid-dispatch first fire on the next event, and handlers
/// removed mid-dispatch are skipped if they have not run yet.
pub struct ListenerRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        self.inner.entries.lock().push(Entry {
            id,
            active: active.clone(),
            handler: Arc::new(handler),
        });

        let registry: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            id,
            active,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Invoke every live handler in registration order. A panicking handler
    /// is logged and does not stop the others. Returns how many handlers ran.
    pub fn dispatch(&self, event: &T) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Handler<T>)> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|entry| (entry.active.clone(), entry.handler.clone()))
            .collect();

        let mut invoked = 0;
        for (active, handler) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            invoked += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                error!(
                    "{} handler panicked: {}",
                    self.inner.name,
                    panic_message(payload.as_ref())
                );
            }
        }
        invoked
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.inner.name)
            .field("handlers", &self.inner.entries.lock().len())
            .finish()
    }
}

/// Capability to remove exactly one handler. Dropping it keeps the handler
/// registered; call [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    /// Remove the handler. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Box<dyn Fn(&u32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: &'static str| {
            let log = log_clone.clone();
            Box::new(move |value: &u32| log.lock().push(format!("{}:{}", tag, value)))
                as Box<dyn Fn(&u32) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = ListenerRegistry::<u32>::new("test");
        let (log, make) = recorder();

        let _a = registry.subscribe(make("a"));
        let _b = registry.subscribe(make("b"));
        let _c = registry.subscribe(make("c"));

        assert_eq!(registry.dispatch(&1), 3);
        assert_eq!(*log.lock(), vec!["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_targeted() {
        let registry = ListenerRegistry::<u32>::new("test");
        let (log, make) = recorder();

        let a = registry.subscribe(make("a"));
        let _b = registry.subscribe(make("b"));

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(registry.len(), 1);

        registry.dispatch(&2);
        assert_eq!(*log.lock(), vec!["b:2"]);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let registry = ListenerRegistry::<u32>::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let later: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        // First handler removes the third one before it runs.
        let later_clone = later.clone();
        let _first = registry.subscribe(move |_| {
            if let Some(sub) = later_clone.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        let calls_clone = calls.clone();
        let _second = registry.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let calls_clone = calls.clone();
        let third = registry.subscribe(move |_| {
            calls_clone.fetch_add(100, Ordering::SeqCst);
        });
        *later.lock() = Some(third);

        registry.dispatch(&0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_subscribe_during_dispatch_fires_next_time() {
        let registry = ListenerRegistry::<u32>::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        let registry_clone = registry.clone();
        let calls_clone = calls.clone();
        let _adder = registry.subscribe(move |_| {
            let calls = calls_clone.clone();
            registry_clone.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        });

        registry.dispatch(&0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.dispatch(&0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let registry = ListenerRegistry::<u32>::new("test");
        let (log, make) = recorder();

        let _boom = registry.subscribe(|_| panic!("handler failure"));
        let _b = registry.subscribe(make("b"));

        assert_eq!(registry.dispatch(&7), 2);
        assert_eq!(*log.lock(), vec!["b:7"]);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = ListenerRegistry::<u32>::new("test");
        let sub = registry.subscribe(|_| {});
        drop(registry);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
