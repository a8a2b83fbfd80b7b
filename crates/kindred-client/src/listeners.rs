use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use kindred_types::events::RelayEvent;

pub type Handler = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

/// Relay event handlers, at most one per (event name, scope).
///
/// Registering a handler for a key replaces whatever was there, so a view
/// that re-subscribes can never stack duplicate handlers. Distinct scopes let
/// independent views (a page and the nav badge) follow the same event. Each
/// registration returns a guard; dropping it (the view unmounting) removes
/// the handler, but only if it has not been replaced since.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

type Key = (&'static str, &'static str);

#[derive(Default)]
struct RegistryInner {
    handlers: Mutex<HashMap<Key, (u64, Handler)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &self,
        event: &'static str,
        handler: impl Fn(&RelayEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.on_scoped(event, "", handler)
    }

    pub fn on_scoped(
        &self,
        event: &'static str,
        scope: &'static str,
        handler: impl Fn(&RelayEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (event, scope);
        let replaced = self
            .inner
            .handlers
            .lock()
            .expect("listener lock poisoned")
            .insert(key, (id, Arc::new(handler)));
        if replaced.is_some() {
            trace!("replaced {} listener {:?}", event, scope);
        }
        ListenerGuard {
            registry: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Remove every handler for `event`, whoever registered it.
    pub fn off(&self, event: &str) {
        self.inner
            .handlers
            .lock()
            .expect("listener lock poisoned")
            .retain(|(name, _), _| *name != event);
    }

    /// Run the handlers for this event. They run outside the lock so they
    /// may register or remove listeners themselves. Returns how many ran.
    pub fn dispatch(&self, event: &RelayEvent) -> usize {
        let name = event.name();
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .expect("listener lock poisoned")
            .iter()
            .filter(|((event, _), _)| *event == name)
            .map(|(_, (_, h))| h.clone())
            .collect();
        if handlers.is_empty() {
            trace!("no listener for {}", name);
        }
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn is_listening(&self, event: &str) -> bool {
        self.inner
            .handlers
            .lock()
            .expect("listener lock poisoned")
            .keys()
            .any(|(name, _)| *name == event)
    }

    pub fn len(&self) -> usize {
        self.inner.handlers.lock().expect("listener lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deregisters its handler on drop.
#[must_use = "dropping the guard removes the listener"]
pub struct ListenerGuard {
    registry: Weak<RegistryInner>,
    key: Key,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let Ok(mut handlers) = inner.handlers.lock() else {
            return;
        };
        if handlers.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            handlers.remove(&self.key);
        }
    }
}
