//! The context tree.
//!
//! A [`Context`] is a cheap, clonable handle onto one node of a tree. It
//! carries three things:
//!
//! - the tree's shared [`Root`], which owns every service value, listener
//!   and plugin fork;
//! - a [`Mapping`] chain that decides which storage slot each service name
//!   resolves to from this node;
//! - optionally the [`ForkId`] of the plugin fork that owns the node.
//!
//! Mapping layers are immutable and only point at layers that already
//! exist, so a chain can never cycle. [`Context::isolate`] adds a layer with
//! fresh identifiers for the listed names; every other name keeps resolving
//! through the parent chain, exactly as if no isolation happened.
//!
//! ```rust,ignore
//! let app = Context::new();
//! let sandbox = app.isolate(["db"]);
//!
//! app.provide("db", Arc::new(Db::open("main")));
//! assert!(sandbox.get("db").is_none()); // private slot, still empty
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::ids::{ForkId, ServiceId};
use crate::root::Root;

// =============================================================================
// Mapping
// =============================================================================

/// One immutable layer of a name → [`ServiceId`] chain.
pub(crate) struct Mapping {
    layer: HashMap<String, ServiceId>,
    parent: Option<Arc<Mapping>>,
}

impl Mapping {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            layer: HashMap::new(),
            parent: None,
        })
    }

    /// Creates a layer shadowing `parent` for the names in `layer`.
    pub(crate) fn child(parent: &Arc<Mapping>, layer: HashMap<String, ServiceId>) -> Arc<Self> {
        Arc::new(Self {
            layer,
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Walks the chain towards the root; the nearest layer wins.
    pub(crate) fn lookup(&self, name: &str) -> Option<ServiceId> {
        let mut node = Some(self);
        while let Some(mapping) = node {
            if let Some(id) = mapping.layer.get(name) {
                return Some(*id);
            }
            node = mapping.parent.as_deref();
        }
        None
    }

    fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.parent.as_deref();
        while let Some(mapping) = node {
            depth += 1;
            node = mapping.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("layer", &self.layer)
            .field("depth", &self.depth())
            .finish()
    }
}

// =============================================================================
// ContextMeta
// =============================================================================

/// Per-field overrides applied by [`Context::extend`].
///
/// Fields left at their default inherit the parent's value.
#[derive(Debug, Clone, Default)]
pub struct ContextMeta {
    /// Diagnostic label shown in logs and `Debug` output.
    pub label: Option<String>,
    /// Detach the child from the fork that owns the parent.
    ///
    /// Plugins registered and listeners attached through a detached context
    /// belong to the root instead of the parent's fork, so they survive that
    /// fork's disposal.
    pub detached: bool,
}

impl ContextMeta {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// A node of the context tree.
///
/// Cloning a `Context` clones the handle, not the node: clones read and
/// write the same slots and belong to the same fork.
#[derive(Clone)]
pub struct Context {
    pub(crate) root: Arc<Root>,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) state: Option<ForkId>,
    pub(crate) label: Option<Arc<str>>,
}

impl Context {
    /// Creates the root context of a new, empty tree.
    pub fn new() -> Self {
        let root = Root::new();
        let mapping = Arc::clone(&root.mapping);
        Self {
            root,
            mapping,
            state: None,
            label: None,
        }
    }

    pub(crate) fn from_parts(
        root: &Arc<Root>,
        mapping: Arc<Mapping>,
        state: Option<ForkId>,
        label: Option<Arc<str>>,
    ) -> Self {
        Self {
            root: Arc::clone(root),
            mapping,
            state,
            label,
        }
    }

    /// Returns the root context of this tree.
    pub fn root(&self) -> Context {
        Context::from_parts(&self.root, Arc::clone(&self.root.mapping), None, None)
    }

    /// Returns `true` if this handle is the tree's root node.
    pub fn is_root(&self) -> bool {
        self.state.is_none() && Arc::ptr_eq(&self.mapping, &self.root.mapping)
    }

    /// Returns `true` if both handles belong to the same tree.
    pub fn same_tree(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// The fork owning this context, if it was created by a plugin instantiation.
    pub fn state(&self) -> Option<ForkId> {
        self.state
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Creates a child sharing this context's mapping chain and root.
    pub fn extend(&self, meta: ContextMeta) -> Context {
        Context {
            root: Arc::clone(&self.root),
            mapping: Arc::clone(&self.mapping),
            state: if meta.detached { None } else { self.state },
            label: meta.label.map(Arc::from).or_else(|| self.label.clone()),
        }
    }

    /// Creates a child with private storage slots for `names`.
    ///
    /// Writes to an isolated name from the child (or its descendants) never
    /// reach the parent or siblings, and the other way round. Isolating a
    /// name that an ancestor already isolated shadows that isolation for the
    /// new subtree.
    pub fn isolate<I, S>(&self, names: I) -> Context
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let layer = names
            .into_iter()
            .map(|name| (name.into(), self.root.ids.service()))
            .collect();
        Context {
            root: Arc::clone(&self.root),
            mapping: Mapping::child(&self.mapping, layer),
            state: self.state,
            label: self.label.clone(),
        }
    }

    /// Resolves `name` to the storage slot this context reads and writes.
    pub fn resolve(&self, name: &str) -> ServiceId {
        self.root.resolve(&self.mapping, name)
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext {
            root: Arc::downgrade(&self.root),
            mapping: Arc::downgrade(&self.mapping),
            state: self.state,
            label: self.label.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .label()
            .map(str::to_string)
            .or_else(|| self.plugin_name())
            .unwrap_or_else(|| "root".to_string());
        write!(f, "Context <{name}>")
    }
}

// =============================================================================
// WeakContext
// =============================================================================

/// Non-owning reference to a context, used by diagnostic back-references.
#[derive(Clone)]
pub(crate) struct WeakContext {
    root: Weak<Root>,
    mapping: Weak<Mapping>,
    state: Option<ForkId>,
    label: Option<Arc<str>>,
}

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<Context> {
        let root = self.root.upgrade()?;
        let mapping = self.mapping.upgrade()?;
        Some(Context::from_parts(
            &root,
            mapping,
            self.state,
            self.label.clone(),
        ))
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContext")
            .field("state", &self.state)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parent_chain() {
        let root = Mapping::root();
        let a = ServiceId(10);
        let b = ServiceId(11);
        let child = Mapping::child(&root, HashMap::from([("x".to_string(), a)]));
        let grandchild = Mapping::child(&child, HashMap::from([("y".to_string(), b)]));

        assert_eq!(grandchild.lookup("x"), Some(a));
        assert_eq!(grandchild.lookup("y"), Some(b));
        assert_eq!(child.lookup("y"), None);
        assert_eq!(root.lookup("x"), None);
    }

    #[test]
    fn test_later_isolation_shadows_earlier() {
        let app = Context::new();
        let outer = app.isolate(["x"]);
        let inner = outer.isolate(["x"]);

        assert_ne!(app.resolve("x"), outer.resolve("x"));
        assert_ne!(outer.resolve("x"), inner.resolve("x"));
        assert_eq!(app.resolve("y"), inner.resolve("y"));
    }

    #[test]
    fn test_extend_overrides_per_field() {
        let app = Context::new();
        let labelled = app.extend(ContextMeta::label("admin"));
        assert_eq!(labelled.label(), Some("admin"));
        assert_eq!(labelled.resolve("db"), app.resolve("db"));

        let child = labelled.extend(ContextMeta::default());
        assert_eq!(child.label(), Some("admin"));
        assert!(app.is_root());
        assert!(!labelled.isolate(["db"]).is_root());
    }

    #[test]
    fn test_weak_context_does_not_keep_tree_alive() {
        let weak = {
            let app = Context::new();
            app.downgrade()
        };
        assert!(weak.upgrade().is_none());
    }
}
