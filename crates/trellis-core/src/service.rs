//! Service binding protocol.
//!
//! Service values live in a single [`ServiceStore`] owned by the tree root
//! and are addressed by [`ServiceId`]. A [`Context`] turns a [`ServiceKey`]
//! into an id through its mapping chain (see [`Context::isolate`]) and then
//! reads or writes the store:
//!
//! - **read** ([`Context::get`]) returns the value, if any, and records the
//!   caller as the value's current reader;
//! - **write** ([`Context::set`]) compares the new value with the stored one
//!   by pointer identity. An identical write is a no-op. Anything else is
//!   stored, the writer is recorded as the source, and an
//!   `internal/service` event is raised for every context resolving the name
//!   to the same slot. Plugins depending on the name are re-evaluated in the
//!   same step.
//!
//! [`PrivateKey`]s address plain storage slots: writes through them never
//! raise events and never wake dependent plugins.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::context::{Context, WeakContext};
use crate::ids::{IdAllocator, ServiceId};
use crate::root::ServiceEvent;

/// Type-erased service value stored in the root.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

/// Returns `true` if both values are the same allocation.
///
/// Structural equality is deliberately never consulted.
pub fn same_service(a: &ServiceArc, b: &ServiceArc) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// =============================================================================
// Keys
// =============================================================================

/// A non-isolatable storage key with no reactive semantics.
///
/// Obtain one with [`Context::private_key`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PrivateKey {
    id: ServiceId,
    label: Arc<str>,
}

impl PrivateKey {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}, {})", self.label, self.id)
    }
}

/// Address of a service: a public name or a [`PrivateKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Named(String),
    Private(PrivateKey),
}

impl ServiceKey {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Private(key) => key.label(),
        }
    }
}

impl From<&str> for ServiceKey {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ServiceKey {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<PrivateKey> for ServiceKey {
    fn from(key: PrivateKey) -> Self {
        Self::Private(key)
    }
}

impl From<&PrivateKey> for ServiceKey {
    fn from(key: &PrivateKey) -> Self {
        Self::Private(key.clone())
    }
}

// =============================================================================
// ServiceTable
// =============================================================================

/// Service definitions of a tree: name → default identifier.
///
/// The default identifier is the slot a name resolves to wherever no mapping
/// layer isolates it. It is allocated the first time the name is touched.
#[derive(Debug, Default)]
pub(crate) struct ServiceTable {
    defaults: HashMap<String, ServiceId>,
}

impl ServiceTable {
    pub(crate) fn default_id(&mut self, name: &str, ids: &IdAllocator) -> ServiceId {
        if let Some(id) = self.defaults.get(name) {
            return *id;
        }
        let id = ids.service();
        self.defaults.insert(name.to_string(), id);
        id
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defaults.keys().cloned().collect();
        names.sort();
        names
    }
}

// =============================================================================
// ServiceStore
// =============================================================================

/// Diagnostic back-references for one stored value.
///
/// Both references are weak: they never keep a context alive and never
/// influence the value's lifetime.
#[derive(Debug, Clone, Default)]
pub struct ServiceTrace {
    current: Option<WeakContext>,
    source: Option<WeakContext>,
}

impl ServiceTrace {
    /// The context that last read the value, if it is still alive.
    pub fn current(&self) -> Option<Context> {
        self.current.as_ref().and_then(WeakContext::upgrade)
    }

    /// The context that wrote the value, if it is still alive.
    pub fn source(&self) -> Option<Context> {
        self.source.as_ref().and_then(WeakContext::upgrade)
    }
}

/// The root's value table plus its trace side table.
#[derive(Default)]
pub(crate) struct ServiceStore {
    values: HashMap<ServiceId, ServiceArc>,
    traces: HashMap<ServiceId, ServiceTrace>,
}

impl ServiceStore {
    pub(crate) fn contains(&self, id: ServiceId) -> bool {
        self.values.contains_key(&id)
    }

    fn read(&mut self, id: ServiceId, reader: WeakContext) -> Option<ServiceArc> {
        let value = self.values.get(&id).cloned()?;
        self.traces.entry(id).or_default().current = Some(reader);
        Some(value)
    }

    /// Stores `value` unless it is identical to the current one.
    ///
    /// Returns `true` when the slot changed.
    fn replace(&mut self, id: ServiceId, value: Option<ServiceArc>, writer: WeakContext) -> bool {
        let unchanged = match (self.values.get(&id), &value) {
            (None, None) => true,
            (Some(old), Some(new)) => same_service(old, new),
            _ => false,
        };
        if unchanged {
            return false;
        }
        match value {
            Some(value) => {
                self.values.insert(id, value);
                self.traces.insert(
                    id,
                    ServiceTrace {
                        current: None,
                        source: Some(writer),
                    },
                );
            }
            None => {
                self.values.remove(&id);
                self.traces.remove(&id);
            }
        }
        true
    }

    fn trace(&self, id: ServiceId) -> Option<ServiceTrace> {
        self.traces.get(&id).cloned()
    }
}

// =============================================================================
// Context accessors
// =============================================================================

impl Context {
    /// Allocates a fresh private key.
    pub fn private_key(&self, label: impl Into<String>) -> PrivateKey {
        PrivateKey {
            id: self.root.ids.service(),
            label: Arc::from(label.into()),
        }
    }

    /// Names of every public service this tree has touched, sorted.
    pub fn service_names(&self) -> Vec<String> {
        self.root.services.lock().names()
    }

    fn slot(&self, key: &ServiceKey) -> ServiceId {
        match key {
            ServiceKey::Named(name) => self.resolve(name),
            ServiceKey::Private(key) => key.id,
        }
    }

    /// Reads a service.
    pub fn get(&self, key: impl Into<ServiceKey>) -> Option<ServiceArc> {
        let id = self.slot(&key.into());
        self.root.store.lock().read(id, self.downgrade())
    }

    /// Reads a service and downcasts it to `T`.
    ///
    /// Returns `None` when the slot is empty or holds another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: impl Into<ServiceKey>) -> Option<Arc<T>> {
        self.get(key).and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns `true` if the service currently has a value.
    ///
    /// Unlike [`get`](Self::get) this does not record the caller as a reader.
    pub fn has(&self, key: impl Into<ServiceKey>) -> bool {
        let id = self.slot(&key.into());
        self.root.store.lock().contains(id)
    }

    /// Writes a service; `None` clears the slot.
    ///
    /// Returns `false` (and does nothing else) when `value` is the very same
    /// allocation as the stored value.
    pub fn set(&self, key: impl Into<ServiceKey>, value: Option<ServiceArc>) -> bool {
        let key = key.into();
        self.root.run_step(|| {
            let id = self.slot(&key);
            let present = value.is_some();
            if !self.root.store.lock().replace(id, value, self.downgrade()) {
                return false;
            }
            debug!(service = %key.name(), %id, present, context = ?self, "service changed");
            if let ServiceKey::Named(name) = key {
                let seq = self.root.ids.sequence();
                self.root.enqueue(ServiceEvent { name, id, seq });
            }
            true
        })
    }

    /// Stores `value` under `key`.
    pub fn provide<T: Any + Send + Sync>(&self, key: impl Into<ServiceKey>, value: Arc<T>) -> bool {
        self.set(key, Some(value as ServiceArc))
    }

    /// Clears `key`.
    pub fn remove(&self, key: impl Into<ServiceKey>) -> bool {
        self.set(key, None)
    }

    /// Diagnostic back-references of the value stored under `key`.
    pub fn trace(&self, key: impl Into<ServiceKey>) -> Option<ServiceTrace> {
        let id = self.slot(&key.into());
        self.root.store.lock().trace(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Foo {
        bar: i32,
    }

    fn count_service_events(ctx: &Context) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        ctx.on("internal/service", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        counter
    }

    #[test]
    fn test_identity_only_change_detection() {
        let app = Context::new();
        let events = count_service_events(&app);

        let a = Arc::new(Foo { bar: 1 });
        assert!(app.provide("foo", Arc::clone(&a)));
        assert!(!app.provide("foo", Arc::clone(&a)));
        assert_eq!(events.load(Ordering::SeqCst), 1);

        // Structurally equal, different allocation.
        assert!(app.provide("foo", Arc::new(Foo { bar: 1 })));
        assert_eq!(events.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clearing_an_empty_slot_is_a_no_op() {
        let app = Context::new();
        let events = count_service_events(&app);
        assert!(!app.remove("foo"));
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_get_as_downcasts() {
        let app = Context::new();
        app.provide("foo", Arc::new(Foo { bar: 7 }));
        assert_eq!(app.get_as::<Foo>("foo").map(|f| f.bar), Some(7));
        assert!(app.get_as::<String>("foo").is_none());
        assert!(app.get_as::<Foo>("missing").is_none());
    }

    #[test]
    fn test_private_key_is_silent() {
        let app = Context::new();
        let events = count_service_events(&app);
        let key = app.private_key("secret");

        assert!(app.provide(&key, Arc::new(Foo { bar: 1 })));
        assert_eq!(app.get_as::<Foo>(&key).map(|f| f.bar), Some(1));
        assert_eq!(events.load(Ordering::SeqCst), 0);

        // A public name with the same label is a different slot.
        assert!(app.get("secret").is_none());
    }

    #[test]
    fn test_trace_records_reader_and_writer() {
        let app = Context::new();
        let writer = app.extend(crate::ContextMeta::label("writer"));
        let reader = app.extend(crate::ContextMeta::label("reader"));

        writer.provide("foo", Arc::new(Foo { bar: 1 }));
        let trace = app.trace("foo").unwrap();
        assert_eq!(trace.source().unwrap().label(), Some("writer"));
        assert!(trace.current().is_none());

        reader.get("foo");
        let trace = app.trace("foo").unwrap();
        assert_eq!(trace.current().unwrap().label(), Some("reader"));

        app.remove("foo");
        assert!(app.trace("foo").is_none());
    }

    #[test]
    fn test_isolation_independence() {
        let app = Context::new();
        let ctx = app.isolate(["x"]);

        app.provide("x", Arc::new(Foo { bar: 1 }));
        assert!(ctx.get("x").is_none());

        ctx.provide("x", Arc::new(Foo { bar: 2 }));
        assert_eq!(app.get_as::<Foo>("x").unwrap().bar, 1);
        assert_eq!(ctx.get_as::<Foo>("x").unwrap().bar, 2);

        app.provide("y", Arc::new(Foo { bar: 3 }));
        assert_eq!(ctx.get_as::<Foo>("y").unwrap().bar, 3);
        ctx.provide("y", Arc::new(Foo { bar: 4 }));
        assert_eq!(app.get_as::<Foo>("y").unwrap().bar, 4);
    }
}
