//! Lifecycle notifications fanned out to external observers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::request::Request;

/// Observer of request lifecycle events. All hooks default to no-ops.
pub trait DispatchListener: Send + Sync {
    fn on_created(&self, _request: &Request) {}
    fn on_assigned(&self, _request: &Request) {}
    fn on_completed(&self, _request: &Request) {}
}

type Hook = Box<dyn Fn(&Request) + Send + Sync>;

/// Listener assembled from up to three closures.
#[derive(Default)]
pub struct FnListener {
    created: Option<Hook>,
    assigned: Option<Hook>,
    completed: Option<Hook>,
}

impl FnListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_created(mut self, hook: impl Fn(&Request) + Send + Sync + 'static) -> Self {
        self.created = Some(Box::new(hook));
        self
    }

    pub fn on_assigned(mut self, hook: impl Fn(&Request) + Send + Sync + 'static) -> Self {
        self.assigned = Some(Box::new(hook));
        self
    }

    pub fn on_completed(mut self, hook: impl Fn(&Request) + Send + Sync + 'static) -> Self {
        self.completed = Some(Box::new(hook));
        self
    }
}

impl DispatchListener for FnListener {
    fn on_created(&self, request: &Request) {
        if let Some(hook) = &self.created {
            hook(request);
        }
    }

    fn on_assigned(&self, request: &Request) {
        if let Some(hook) = &self.assigned {
            hook(request);
        }
    }

    fn on_completed(&self, request: &Request) {
        if let Some(hook) = &self.completed {
            hook(request);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created,
    Assigned,
    Completed,
}

/// Copy-on-write listener list.
///
/// Registration swaps in a new list; delivery iterates the list that was
/// current when the event fired, so concurrent registration never causes a
/// listener present at that moment to be skipped.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Arc<Vec<Arc<dyn DispatchListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DispatchListener>) {
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every current listener. A panicking listener is
    /// logged and skipped; it never reaches the caller.
    pub fn notify(&self, event: LifecycleEvent, request: &Request) {
        let snapshot: Arc<Vec<Arc<dyn DispatchListener>>> = self.listeners.read().clone();
        for listener in snapshot.iter() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| match event {
                LifecycleEvent::Created => listener.on_created(request),
                LifecycleEvent::Assigned => listener.on_assigned(request),
                LifecycleEvent::Completed => listener.on_completed(request),
            }));
            if delivered.is_err() {
                warn!(request = request.id(), ?event, "listener panicked; event dropped for it");
            }
        }
    }
}
