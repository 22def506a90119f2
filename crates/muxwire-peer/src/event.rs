//! Multicast events with per-subscriber failure isolation.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned by [`Event::subscribe`]; pass it to [`Event::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A list of subscriber callbacks invoked together on publish.
///
/// Publishing works on a snapshot of the subscriber list, so a handler may
/// unsubscribe itself (or others) while it runs. A panicking handler is
/// logged and does not affect the remaining ones.
pub struct Event<T> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T: Sync> Event<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler`.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_with(|_| handler)
    }

    /// Register a handler built from its own subscription id.
    ///
    /// One-shot handlers use the id to remove themselves once they fire.
    pub fn subscribe_with<F, M>(&self, make: M) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
        M: FnOnce(SubscriptionId) -> F,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler<T> = Arc::new(make(id));
        self.handlers.lock().push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Invoke every current subscriber with `args` and wait for all of them.
    ///
    /// With several subscribers each runs on its own scoped thread, so a slow
    /// handler delays completion of the publish but not the other handlers.
    pub fn publish(&self, args: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        match snapshot.as_slice() {
            [] => {}
            [only] => self.invoke(only, args),
            many => std::thread::scope(|scope| {
                for handler in many {
                    scope.spawn(move || self.invoke(handler, args));
                }
            }),
        }
    }

    fn invoke(&self, handler: &Handler<T>, args: &T) {
        if catch_unwind(AssertUnwindSafe(|| handler(args))).is_err() {
            warn!(event = self.name, "event subscriber panicked");
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("subscribers", &self.handlers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn publish_without_subscribers_is_noop() {
        let event: Event<u32> = Event::new("test");
        event.publish(&1);
        assert_eq!(event.subscriber_count(), 0);
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let event: Event<usize> = Event::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = Arc::clone(&total);
            event.subscribe(move |value| {
                total.fetch_add(*value, Ordering::SeqCst);
            });
        }

        event.publish(&5);
        assert_eq!(total.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn subscribers_run_concurrently() {
        let event: Event<()> = Event::new("test");
        let barrier = Arc::new(Barrier::new(2));

        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            event.subscribe(move |_| {
                barrier.wait();
            });
        }

        // Both handlers must be inside the barrier at the same time.
        event.publish(&());
    }

    #[test]
    fn publish_waits_for_slow_subscriber() {
        let event: Event<()> = Event::new("test");
        let done = Arc::new(AtomicUsize::new(0));

        for delay in [10u64, 80] {
            let done = Arc::clone(&done);
            event.subscribe(move |_| {
                std::thread::sleep(Duration::from_millis(delay));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        let started = Instant::now();
        event.publish(&());
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let event: Event<()> = Event::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = event.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(event.unsubscribe(id));
        assert!(!event.unsubscribe(id));
        event.publish(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_can_unsubscribe_itself_mid_publish() {
        let event = Arc::new(Event::<u32>::new("test"));
        let hits = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&event);
        let counter = Arc::clone(&hits);
        event.subscribe_with(move |id| {
            move |_: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(event) = weak.upgrade() {
                    event.unsubscribe(id);
                }
            }
        });
        event.subscribe(|_| {});

        event.publish(&1);
        event.publish(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(event.subscriber_count(), 1);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let event: Event<()> = Event::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        event.subscribe(|_| panic!("subscriber failure"));
        let counter = Arc::clone(&hits);
        event.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        event.publish(&());
        event.publish(&());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lone_panicking_subscriber_does_not_unwind_publisher() {
        let event: Event<()> = Event::new("test");
        event.subscribe(|_| panic!("subscriber failure"));
        event.publish(&());
        assert_eq!(event.subscriber_count(), 1);
    }
}
