//! Per-context event bus.
//!
//! Listeners are attached to a context with [`Context::on`] and remember the
//! mapping chain of that context. Three event names are reserved:
//!
//! | event | raised by | scope |
//! |-------|-----------|-------|
//! | `dispose` | disposal of the listener's fork (or `stop()` for the root) | the owning fork only |
//! | `ready` | the start barrier, once it has settled | every listener |
//! | `internal/service` | a changed service write, argument: the name | contexts resolving the name to the writer's slot |
//!
//! Listeners attached through a fork's context are removed when that fork
//! is disposed; `dispose` listeners are invoked at that moment, in
//! registration order.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{trace, warn};

use crate::context::{Context, Mapping};
use crate::ids::{ForkId, HookId};
use crate::root::{Root, ServiceEvent};

pub const DISPOSE: &str = "dispose";
pub const READY: &str = "ready";
pub const INTERNAL_SERVICE: &str = "internal/service";

/// Event listener callback; receives the emitted arguments.
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

struct Listener {
    id: HookId,
    event: String,
    scope: Arc<Mapping>,
    handler: EventHandler,
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    listeners: Mutex<Vec<Listener>>,
    /// `dispose` listeners attached outside of any fork; run by `stop()`.
    root_disposables: Mutex<Vec<HookId>>,
}

impl Lifecycle {
    fn add(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    fn remove(&self, id: HookId) -> Option<Listener> {
        let mut listeners = self.listeners.lock();
        let index = listeners.iter().position(|l| l.id == id)?;
        Some(listeners.remove(index))
    }

    /// Handlers for `event`, together with the scope they were attached in.
    fn snapshot(&self, event: &str) -> Vec<(Arc<Mapping>, EventHandler)> {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.event == event)
            .map(|l| (Arc::clone(&l.scope), Arc::clone(&l.handler)))
            .collect()
    }

    /// Unregisters `ids` in order, invoking the `dispose` listeners among them.
    pub(crate) fn run_disposables(&self, ids: Vec<HookId>) {
        for id in ids {
            let Some(listener) = self.remove(id) else {
                continue;
            };
            if listener.event == DISPOSE {
                (listener.handler)(&[]);
            }
        }
    }

    pub(crate) fn take_root_disposables(&self) -> Vec<HookId> {
        std::mem::take(&mut *self.root_disposables.lock())
    }
}

// =============================================================================
// Disposable
// =============================================================================

/// Handle returned by [`Context::on`]; removes the listener when disposed.
#[derive(Debug, Clone)]
pub struct Disposable {
    root: Weak<Root>,
    id: Option<HookId>,
}

impl Disposable {
    fn inert() -> Self {
        Self {
            root: Weak::new(),
            id: None,
        }
    }

    /// Removes the listener without invoking it.
    ///
    /// Returns `false` if it was already removed.
    pub fn dispose(&self) -> bool {
        let (Some(root), Some(id)) = (self.root.upgrade(), self.id) else {
            return false;
        };
        root.lifecycle.remove(id).is_some()
    }
}

// =============================================================================
// Root / Context integration
// =============================================================================

impl Root {
    /// Notifies `internal/service` listeners in the event's scope.
    pub(crate) fn broadcast_service_event(&self, event: &ServiceEvent) {
        let args = [Value::String(event.name.clone())];
        for (scope, handler) in self.lifecycle.snapshot(INTERNAL_SERVICE) {
            if self.resolve(&scope, &event.name) == event.id {
                handler(&args);
            }
        }
    }

    pub(crate) fn emit_ready(&self) {
        for (_, handler) in self.lifecycle.snapshot(READY) {
            handler(&[]);
        }
    }

    /// Attaches listener `id` to `fork`; `false` if the fork is gone.
    fn attach_to_fork(&self, fork: ForkId, id: HookId) -> bool {
        let mut registry = self.registry.lock();
        match registry.forks.get_mut(&fork) {
            Some(entry) if !entry.disposed => {
                entry.disposables.push(id);
                true
            }
            _ => false,
        }
    }
}

impl Context {
    /// Registers `handler` for `event`.
    ///
    /// - `dispose` handlers run once, when this context's fork is disposed
    ///   (or on `stop()` for contexts outside any fork). Attaching one to a
    ///   fork that is already gone runs it immediately.
    /// - `ready` handlers attached after the tree has started run
    ///   immediately.
    pub fn on<F>(&self, event: &str, handler: F) -> Disposable
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        if event == READY && self.root.is_ready() {
            handler(&[]);
            return Disposable::inert();
        }

        let id = self.root.ids.hook();
        match self.state {
            Some(fork) => {
                if !self.root.attach_to_fork(fork, id) {
                    if event == DISPOSE {
                        handler(&[]);
                    } else {
                        warn!(%fork, event, "listener attached to an inactive fork is ignored");
                    }
                    return Disposable::inert();
                }
            }
            None if event == DISPOSE => self.root.lifecycle.root_disposables.lock().push(id),
            None => {}
        }

        trace!(event, %id, context = ?self, "listener attached");
        self.root.lifecycle.add(Listener {
            id,
            event: event.to_string(),
            scope: Arc::clone(&self.mapping),
            handler: Arc::new(handler),
        });
        Disposable {
            root: Arc::downgrade(&self.root),
            id: Some(id),
        }
    }

    /// Shorthand for `on("dispose", ..)` with a run-once callback.
    pub fn on_dispose<F>(&self, callback: F) -> Disposable
    where
        F: FnOnce() + Send + 'static,
    {
        let callback = Mutex::new(Some(callback));
        self.on(DISPOSE, move |_| {
            if let Some(callback) = callback.lock().take() {
                callback();
            }
        })
    }

    /// Emits a custom event to every listener registered for `event`.
    ///
    /// Reserved event names cannot be emitted by callers. Returns the number
    /// of handlers invoked.
    pub fn emit(&self, event: &str, args: &[Value]) -> usize {
        if matches!(event, DISPOSE | READY | INTERNAL_SERVICE) {
            warn!(event, "refusing to emit a reserved event");
            return 0;
        }
        let handlers = self.root.lifecycle.snapshot(event);
        for (_, handler) in &handlers {
            handler(args);
        }
        handlers.len()
    }
}
