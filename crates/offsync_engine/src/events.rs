//! Engine events and listener registries.
//!
//! Listeners are registered explicitly and get a [`Subscription`] handle
//! back. Dropping the handle keeps the listener; call
//! [`Subscription::unsubscribe`] to remove it.

use crate::apply::ChangeSource;
use crate::orchestrator::SyncReport;
use crate::realtime::ConnectionState;
use offsync_protocol::{Conflict, EntityKey, ResolutionRecord};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A sync pass started.
    SyncStarted,
    /// A sync pass ended, successfully or not.
    SyncFinished(SyncReport),
    /// The online flag changed.
    OnlineChanged(bool),
    /// The push channel changed state.
    ConnectionChanged(ConnectionState),
    /// A server change was written locally.
    ChangeApplied {
        /// Changed entity.
        key: EntityKey,
        /// Where the change came from.
        source: ChangeSource,
    },
    /// A conflict was opened and needs a decision.
    ConflictDetected(Conflict),
    /// A newer server change replaced the server side of an open conflict.
    ConflictUpdated(Conflict),
    /// A conflict was closed.
    ConflictResolved(ResolutionRecord),
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

struct Inner<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> Detach for Inner<T> {
    fn detach(&self, id: u64) {
        self.listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }
}

/// A set of callbacks for values of type `T`.
///
/// Clones share the same set.
pub struct ListenerRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<T> std::fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

impl<T: 'static> ListenerRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            registry: weak,
        }
    }

    /// Calls every listener with `value`.
    ///
    /// The set is copied first, so listeners may subscribe or unsubscribe
    /// while being called.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    /// Returns the number of listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Returns true if there are no listeners.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered listener.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Removes the listener. A no-op if the registry is gone.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}
