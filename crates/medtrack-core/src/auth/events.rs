//! Session invalidation broadcast.
//!
//! The request pipeline holds an `AuthEvents` handle and fires
//! `emit_invalidate` when the server rejects the bearer token. It has no
//! reference to the session manager; the manager registers a handler instead.
//! Handlers run synchronously on the emitting task. A broadcast with no
//! subscribers is dropped, never queued.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// Process-wide "the session is no longer valid" channel.
/// Clone is cheap; all clones share the same subscribers.
#[derive(Clone, Default)]
pub struct AuthEvents {
    registry: Arc<Mutex<Registry>>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
        registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handler. It stays registered until the returned
    /// `Subscription` is dropped or unsubscribed.
    pub fn on_invalidate<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = Self::lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Notify every current subscriber. Returns how many were notified.
    pub fn emit_invalidate(&self) -> usize {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler> = Self::lock(&self.registry)
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        debug!(subscribers = handlers.len(), "Broadcasting session invalidation");
        for handler in &handlers {
            handler();
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        Self::lock(&self.registry).handlers.len()
    }
}

/// Handle returned by `AuthEvents::on_invalidate`.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            AuthEvents::lock(&registry)
                .handlers
                .retain(|(id, _)| *id != self.id);
        }
    }
}
