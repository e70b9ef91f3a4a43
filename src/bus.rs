//! Publish/subscribe registry for inbound control events.
//!
//! The bus decouples the data channel from whoever consumes its events
//! (transcript logic, UI). Delivery is synchronous and in registration order.
//! Nothing is buffered: an event published with no listeners is dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::event::ControlEvent;

/// A registered callback.
pub type Listener = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Shared handle to a listener registry. Clones refer to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` after every existing listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ControlEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers `event` to every listener registered at the time of the call.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe while being called; such changes apply from the next
    /// publish. A panicking listener is logged and skipped.
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn publish(&self, event: &ControlEvent) -> usize {
        let snapshot: Vec<Listener> = self
            .registry
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        if snapshot.is_empty() {
            trace!(kind = %event.kind, "No listeners, dropping event");
            return 0;
        }

        let mut delivered = 0;
        for listener in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(kind = %event.kind, "Event listener panicked"),
            }
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }
}

/// Capability to remove one listener.
///
/// Holds only a weak reference to the bus. Dropping it does not remove the
/// listener; call [`Subscription::unsubscribe`].
#[must_use = "the listener stays registered until unsubscribe() is called"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes the listener. Returns `false` if the bus is gone or the
    /// listener was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|(id, _)| *id != self.id);
        registry.listeners.len() != before
    }
}
