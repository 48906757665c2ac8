//! Plugin registry and dependency-satisfaction graph.
//!
//! The registry keeps four arenas, all owned by the tree root:
//!
//! - **runtimes**, one per plugin definition, holding the declared
//!   dependencies and the ordered list of registrations;
//! - **registrations**, one per `register` call, remembering the invoking
//!   context and config. A registration is *pending* while its
//!   dependencies are unmet and *active* while it owns a fork;
//! - **forks**, one per instantiation, owning a child context, its
//!   disposables and the registrations made through that context;
//! - **instances**, the values returned by plugin bodies.
//!
//! Contexts refer to their fork by [`ForkId`] only, so there is no
//! ownership cycle between a fork and the contexts handed to plugin code.
//!
//! # Re-evaluation
//!
//! When a service named `N` changes, every registration whose plugin uses
//! `N` and whose context resolves `N` to the written slot is re-evaluated:
//!
//! ```text
//! active ──(N changed or vanished)──► dispose fork ──► satisfied? ──► new fork
//!                                                          └─ no ──► pending
//! pending ──(N appeared, all deps present)──────────────────────────► new fork
//! ```
//!
//! The stale fork is always disposed before its replacement is created.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, info, trace};

use crate::context::{Context, Mapping};
use crate::error::{CoreError, CoreResult, HookKind};
use crate::hooks::HookFuture;
use crate::ids::{ForkId, HookId, InstanceId, RegistrationId, RuntimeId};
use crate::plugin::{Instance, Plugin, plugin_fn};
use crate::root::{Root, ServiceEvent};

// =============================================================================
// Arena entries
// =============================================================================

struct RuntimeEntry {
    plugin: Arc<dyn Plugin>,
    name: String,
    using: Vec<String>,
    isolate: Vec<String>,
    reusable: bool,
    registrations: Vec<RegistrationId>,
    /// Instance shared by every fork of a single-instance plugin.
    shared: Option<InstanceId>,
}

struct RegistrationEntry {
    runtime: RuntimeId,
    mapping: Arc<Mapping>,
    state: Option<ForkId>,
    label: Option<Arc<str>>,
    config: Value,
    fork: Option<ForkId>,
}

pub(crate) struct ForkEntry {
    registration: RegistrationId,
    runtime: RuntimeId,
    pub(crate) disposables: Vec<HookId>,
    children: Vec<RegistrationId>,
    instance: Option<InstanceId>,
    started: bool,
    pub(crate) disposed: bool,
}

struct InstanceEntry {
    instance: Arc<dyn Instance>,
    plugin: String,
    forks: usize,
    started: bool,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    runtimes: BTreeMap<RuntimeId, RuntimeEntry>,
    by_plugin: HashMap<usize, RuntimeId>,
    registrations: HashMap<RegistrationId, RegistrationEntry>,
    pub(crate) forks: HashMap<ForkId, ForkEntry>,
    instances: HashMap<InstanceId, InstanceEntry>,
}

/// Identity of a plugin definition: the address of its allocation.
///
/// Stable for as long as the runtime holds the `Arc`.
fn plugin_key(plugin: &Arc<dyn Plugin>) -> usize {
    Arc::as_ptr(plugin) as *const () as usize
}

fn validate_using(plugin: &str, using: &[String]) -> CoreResult<()> {
    for (index, name) in using.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(CoreError::configuration(plugin, "empty service name in `using`"));
        }
        if using[..index].contains(name) {
            return Err(CoreError::configuration(
                plugin,
                format!("service '{name}' is listed twice in `using`"),
            ));
        }
    }
    Ok(())
}

fn start_future(instance: Arc<dyn Instance>) -> HookFuture {
    Box::pin(async move { instance.start().await })
}

fn stop_future(instance: Arc<dyn Instance>) -> HookFuture {
    Box::pin(async move { instance.stop().await })
}

/// Counters describing the plugin graph of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub runtimes: usize,
    pub registrations: usize,
    pub forks: usize,
    pub instances: usize,
    /// Hooks parked until the next barrier.
    pub pending_hooks: usize,
}

/// What `create_fork` needs once the registry lock is released.
struct PreparedFork {
    fork: ForkId,
    runtime: RuntimeId,
    ctx: Context,
    plugin: Arc<dyn Plugin>,
    name: String,
    reusable: bool,
    config: Value,
    shared: Option<Arc<dyn Instance>>,
}

// =============================================================================
// Graph operations
// =============================================================================

impl Root {
    fn add_registration(
        self: &Arc<Self>,
        ctx: &Context,
        plugin: Arc<dyn Plugin>,
        config: Value,
    ) -> CoreResult<(RegistrationId, String)> {
        let name = plugin.name().to_string();
        let using = plugin.using();
        let isolate = plugin.isolate();
        let reusable = plugin.reusable();

        let mut guard = self.registry.lock();
        let RegistryState {
            runtimes,
            by_plugin,
            registrations,
            forks,
            ..
        } = &mut *guard;

        if let Some(parent) = ctx.state {
            match forks.get(&parent) {
                Some(fork) if !fork.disposed => {}
                _ => return Err(CoreError::Inactive(parent)),
            }
        }

        let key = plugin_key(&plugin);
        let runtime_id = match by_plugin.get(&key) {
            Some(id) => *id,
            None => {
                validate_using(&name, &using)?;
                let id = self.ids.runtime();
                debug!(plugin = %name, runtime = %id, ?using, reusable, "runtime created");
                runtimes.insert(
                    id,
                    RuntimeEntry {
                        plugin,
                        name: name.clone(),
                        using,
                        isolate,
                        reusable,
                        registrations: Vec::new(),
                        shared: None,
                    },
                );
                by_plugin.insert(key, id);
                id
            }
        };

        let id = self.ids.registration();
        registrations.insert(
            id,
            RegistrationEntry {
                runtime: runtime_id,
                mapping: Arc::clone(&ctx.mapping),
                state: ctx.state,
                label: ctx.label.clone(),
                config,
                fork: None,
            },
        );
        if let Some(runtime) = runtimes.get_mut(&runtime_id) {
            runtime.registrations.push(id);
        }
        if let Some(parent) = ctx.state.and_then(|parent| forks.get_mut(&parent)) {
            parent.children.push(id);
        }

        info!(plugin = %name, registration = %id, "plugin registered");
        Ok((id, name))
    }

    /// Creates a fork for `registration` if all of its dependencies are present.
    fn try_fork(self: &Arc<Self>, registration: RegistrationId) {
        let snapshot = {
            let registry = self.registry.lock();
            registry
                .registrations
                .get(&registration)
                .filter(|entry| entry.fork.is_none())
                .and_then(|entry| {
                    let runtime = registry.runtimes.get(&entry.runtime)?;
                    Some((
                        Context::from_parts(
                            self,
                            Arc::clone(&entry.mapping),
                            entry.state,
                            entry.label.clone(),
                        ),
                        runtime.using.clone(),
                    ))
                })
        };
        let Some((ctx, using)) = snapshot else {
            return;
        };

        if using.iter().all(|name| ctx.has(name.as_str())) {
            self.create_fork(registration);
        } else {
            trace!(%registration, ?using, "dependencies unmet, registration pending");
        }
    }

    fn prepare_fork(self: &Arc<Self>, registration: RegistrationId) -> Option<PreparedFork> {
        let mut guard = self.registry.lock();
        let RegistryState {
            runtimes,
            registrations,
            forks,
            instances,
            ..
        } = &mut *guard;

        let entry = registrations.get_mut(&registration)?;
        if entry.fork.is_some() {
            return None;
        }
        let runtime = runtimes.get(&entry.runtime)?;

        let fork = self.ids.fork();
        let layer = runtime
            .isolate
            .iter()
            .map(|name| (name.clone(), self.ids.service()))
            .collect();
        let mapping = Mapping::child(&entry.mapping, layer);

        let shared = match runtime.shared {
            Some(id) if !runtime.reusable => instances.get_mut(&id).map(|shared| {
                shared.forks += 1;
                (id, Arc::clone(&shared.instance))
            }),
            _ => None,
        };

        entry.fork = Some(fork);
        forks.insert(
            fork,
            ForkEntry {
                registration,
                runtime: entry.runtime,
                disposables: Vec::new(),
                children: Vec::new(),
                instance: shared.as_ref().map(|(id, _)| *id),
                started: false,
                disposed: false,
            },
        );

        Some(PreparedFork {
            fork,
            runtime: entry.runtime,
            ctx: Context::from_parts(self, mapping, Some(fork), entry.label.clone()),
            plugin: Arc::clone(&runtime.plugin),
            name: runtime.name.clone(),
            reusable: runtime.reusable,
            config: entry.config.clone(),
            shared: shared.map(|(_, instance)| instance),
        })
    }

    /// Records a freshly created instance on its fork.
    ///
    /// Returns `false` if the fork was disposed while the body ran.
    fn attach_instance(
        &self,
        prepared: &PreparedFork,
        instance: &Arc<dyn Instance>,
    ) -> bool {
        let mut guard = self.registry.lock();
        let RegistryState {
            runtimes,
            forks,
            instances,
            ..
        } = &mut *guard;

        let Some(fork) = forks.get_mut(&prepared.fork).filter(|fork| !fork.disposed) else {
            return false;
        };
        let id = self.ids.instance();
        instances.insert(
            id,
            InstanceEntry {
                instance: Arc::clone(instance),
                plugin: prepared.name.clone(),
                forks: 1,
                started: false,
            },
        );
        fork.instance = Some(id);
        if !prepared.reusable {
            if let Some(runtime) = runtimes.get_mut(&prepared.runtime) {
                runtime.shared = Some(id);
            }
        }
        true
    }

    fn create_fork(self: &Arc<Self>, registration: RegistrationId) {
        let Some(prepared) = self.prepare_fork(registration) else {
            return;
        };
        debug!(plugin = %prepared.name, fork = %prepared.fork, %registration, "creating fork");

        let instance = match &prepared.shared {
            Some(instance) => Arc::clone(instance),
            None => match prepared.plugin.apply(&prepared.ctx, &prepared.config) {
                Ok(instance) => {
                    if !self.attach_instance(&prepared, &instance) {
                        debug!(fork = %prepared.fork, "fork disposed by its own body");
                        return;
                    }
                    instance
                }
                Err(err) => {
                    self.hooks.record(&prepared.name, HookKind::Apply, Err(err));
                    self.dispose_fork(prepared.fork);
                    return;
                }
            },
        };

        instance.fork(&prepared.ctx, &prepared.config);

        if self.is_started() {
            self.start_fork(prepared.fork);
        }
    }

    /// Moves one fork into the started state, starting its instance if needed.
    fn start_fork(&self, fork: ForkId) {
        let start = {
            let mut guard = self.registry.lock();
            let RegistryState {
                forks, instances, ..
            } = &mut *guard;
            let Some(entry) = forks.get_mut(&fork).filter(|entry| !entry.disposed) else {
                return;
            };
            let Some(instance) = entry.instance.and_then(|id| instances.get_mut(&id)) else {
                return;
            };
            entry.started = true;
            if instance.started {
                None
            } else {
                instance.started = true;
                Some((instance.plugin.clone(), Arc::clone(&instance.instance)))
            }
        };
        if let Some((plugin, instance)) = start {
            debug!(%plugin, %fork, "starting instance");
            self.hooks.drive(&plugin, HookKind::Start, start_future(instance));
        }
    }

    /// Marks every live fork started and returns the instances to start.
    pub(crate) fn begin_start(&self) -> Vec<(String, Arc<dyn Instance>)> {
        let mut guard = self.registry.lock();
        let RegistryState {
            forks, instances, ..
        } = &mut *guard;

        let mut ids: Vec<ForkId> = forks.keys().copied().collect();
        ids.sort();

        let mut pending = Vec::new();
        for id in ids {
            let Some(fork) = forks.get_mut(&id).filter(|fork| !fork.disposed) else {
                continue;
            };
            let Some(instance) = fork.instance.and_then(|id| instances.get_mut(&id)) else {
                continue;
            };
            fork.started = true;
            if !instance.started {
                instance.started = true;
                pending.push((instance.plugin.clone(), Arc::clone(&instance.instance)));
            }
        }
        pending
    }

    /// Disposes a fork: children first, then disposables, then `stop`.
    ///
    /// Returns `false` if the fork is unknown or already being disposed.
    pub(crate) fn dispose_fork(self: &Arc<Self>, fork: ForkId) -> bool {
        let children = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.forks.get_mut(&fork) else {
                return false;
            };
            if entry.disposed {
                return false;
            }
            entry.disposed = true;
            std::mem::take(&mut entry.children)
        };
        debug!(%fork, children = children.len(), "disposing fork");

        for child in children {
            self.dispose_registration(child);
        }

        let disposables = self
            .registry
            .lock()
            .forks
            .get_mut(&fork)
            .map(|entry| std::mem::take(&mut entry.disposables))
            .unwrap_or_default();
        self.lifecycle.run_disposables(disposables);

        let stop = {
            let mut guard = self.registry.lock();
            let RegistryState {
                runtimes,
                forks,
                instances,
                ..
            } = &mut *guard;
            forks.get(&fork).and_then(|entry| {
                let id = entry.instance?;
                let instance = instances.get_mut(&id)?;
                instance.forks -= 1;
                if instance.forks > 0 {
                    return None;
                }
                let instance = instances.remove(&id)?;
                if let Some(runtime) = runtimes.get_mut(&entry.runtime) {
                    if runtime.shared == Some(id) {
                        runtime.shared = None;
                    }
                }
                instance
                    .started
                    .then_some((instance.plugin, instance.instance))
            })
        };
        if let Some((plugin, instance)) = stop {
            debug!(%plugin, %fork, "stopping instance");
            self.hooks.drive(&plugin, HookKind::Stop, stop_future(instance));
        }

        let mut guard = self.registry.lock();
        let RegistryState {
            registrations,
            forks,
            ..
        } = &mut *guard;
        if let Some(entry) = forks.remove(&fork) {
            if let Some(registration) = registrations.get_mut(&entry.registration) {
                if registration.fork == Some(fork) {
                    registration.fork = None;
                }
            }
        }
        true
    }

    /// Removes a registration, disposing its fork.
    pub(crate) fn dispose_registration(self: &Arc<Self>, registration: RegistrationId) -> bool {
        let removed = {
            let mut guard = self.registry.lock();
            let RegistryState {
                runtimes,
                registrations,
                forks,
                ..
            } = &mut *guard;
            let Some(entry) = registrations.remove(&registration) else {
                return false;
            };
            if let Some(runtime) = runtimes.get_mut(&entry.runtime) {
                runtime.registrations.retain(|id| *id != registration);
            }
            if let Some(parent) = entry.state.and_then(|parent| forks.get_mut(&parent)) {
                parent.children.retain(|id| *id != registration);
            }
            (entry.fork, entry.runtime)
        };
        let (fork, runtime) = removed;
        trace!(%registration, "registration disposed");

        if let Some(fork) = fork {
            self.dispose_fork(fork);
        }
        self.collect_runtime(runtime);
        true
    }

    /// Drops a runtime once it has no registrations left.
    fn collect_runtime(&self, id: RuntimeId) {
        let mut guard = self.registry.lock();
        let RegistryState {
            runtimes,
            by_plugin,
            ..
        } = &mut *guard;
        if runtimes
            .get(&id)
            .is_some_and(|runtime| runtime.registrations.is_empty())
        {
            if let Some(runtime) = runtimes.remove(&id) {
                by_plugin.remove(&plugin_key(&runtime.plugin));
                debug!(plugin = %runtime.name, runtime = %id, "runtime removed");
            }
        }
    }

    fn dispose_plugin(self: &Arc<Self>, plugin: &Arc<dyn Plugin>) -> bool {
        let registrations = {
            let registry = self.registry.lock();
            let Some(runtime) = registry
                .by_plugin
                .get(&plugin_key(plugin))
                .and_then(|id| registry.runtimes.get(id))
            else {
                return false;
            };
            runtime.registrations.clone()
        };
        for registration in registrations {
            self.dispose_registration(registration);
        }
        info!(plugin = %plugin.name(), "plugin disposed");
        true
    }

    /// Disposes every top-level registration, then the root's own
    /// `dispose` listeners.
    pub(crate) fn dispose_all(self: &Arc<Self>) {
        let mut top: Vec<RegistrationId> = self
            .registry
            .lock()
            .registrations
            .iter()
            .filter(|(_, entry)| entry.state.is_none())
            .map(|(id, _)| *id)
            .collect();
        top.sort();
        for registration in top {
            self.dispose_registration(registration);
        }
        let disposables = self.lifecycle.take_root_disposables();
        self.lifecycle.run_disposables(disposables);
    }

    /// Re-evaluates every registration depending on the changed service.
    ///
    /// Every stale fork is disposed before any replacement is created, so a
    /// single-instance plugin whose forks all went stale builds a fresh
    /// instance instead of handing the old one to its new forks.
    pub(crate) fn reevaluate(self: &Arc<Self>, event: &ServiceEvent) {
        let candidates: Vec<(RuntimeId, RegistrationId)> = {
            let registry = self.registry.lock();
            registry
                .runtimes
                .iter()
                .filter(|(_, runtime)| runtime.using.iter().any(|name| *name == event.name))
                .flat_map(|(id, runtime)| runtime.registrations.iter().map(move |r| (*id, *r)))
                .collect()
        };

        let mut affected = Vec::new();
        let mut stale = Vec::new();
        for (runtime, registration) in candidates {
            let snapshot = self
                .registry
                .lock()
                .registrations
                .get(&registration)
                .map(|entry| (Arc::clone(&entry.mapping), entry.fork));
            let Some((mapping, fork)) = snapshot else {
                continue;
            };
            if self.resolve(&mapping, &event.name) != event.id {
                continue;
            }
            match fork {
                Some(fork) if fork.get() > event.seq => {
                    trace!(service = %event.name, %registration, %fork, "fork is newer than the write");
                }
                Some(fork) => {
                    stale.push((runtime, registration, fork));
                    affected.push(registration);
                }
                None => affected.push(registration),
            }
        }

        for (runtime, registration, fork) in stale {
            debug!(service = %event.name, %registration, %fork, "dependency changed, disposing stale fork");
            self.dispose_fork(fork);
            self.forget_shared(runtime);
        }
        for registration in affected {
            self.try_fork(registration);
        }
    }

    /// Stops new forks of a single-instance runtime from joining its current
    /// instance. Forks already holding it keep it until they are disposed.
    fn forget_shared(&self, runtime: RuntimeId) {
        if let Some(runtime) = self.registry.lock().runtimes.get_mut(&runtime) {
            runtime.shared = None;
        }
    }

    fn stats(&self) -> RegistryStats {
        let registry = self.registry.lock();
        RegistryStats {
            runtimes: registry.runtimes.len(),
            registrations: registry.registrations.len(),
            forks: registry.forks.len(),
            instances: registry.instances.len(),
            pending_hooks: self.hooks.pending(),
        }
    }
}

// =============================================================================
// PluginHandle
// =============================================================================

/// Handle to one registration, returned by [`Context::register`].
#[derive(Clone)]
pub struct PluginHandle {
    root: Weak<Root>,
    id: RegistrationId,
    name: String,
}

impl PluginHandle {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Name of the registered plugin.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` until the registration is disposed.
    pub fn is_alive(&self) -> bool {
        self.root
            .upgrade()
            .is_some_and(|root| root.registry.lock().registrations.contains_key(&self.id))
    }

    /// The registration's live fork, if its dependencies are satisfied.
    pub fn fork(&self) -> Option<ForkId> {
        let root = self.root.upgrade()?;
        let registry = root.registry.lock();
        registry.registrations.get(&self.id)?.fork
    }

    pub fn is_active(&self) -> bool {
        self.fork().is_some()
    }

    /// Whether the live fork has passed the start barrier.
    pub fn is_started(&self) -> bool {
        let Some(root) = self.root.upgrade() else {
            return false;
        };
        let registry = root.registry.lock();
        registry
            .registrations
            .get(&self.id)
            .and_then(|entry| entry.fork)
            .and_then(|fork| registry.forks.get(&fork))
            .is_some_and(|fork| fork.started)
    }

    /// Disposes this registration and its fork. A no-op returning `false`
    /// when already disposed.
    pub fn dispose(&self) -> bool {
        let Some(root) = self.root.upgrade() else {
            return false;
        };
        root.run_step(|| root.dispose_registration(self.id))
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

// =============================================================================
// Context API
// =============================================================================

impl Context {
    /// Registers `plugin` with `config` under this context.
    ///
    /// The plugin is instantiated right away if all of its dependencies are
    /// present here; otherwise the registration stays pending until they
    /// are. Registering the same plugin again adds another registration, it
    /// never replaces an existing fork.
    pub fn register(&self, plugin: Arc<dyn Plugin>, config: Value) -> CoreResult<PluginHandle> {
        self.root.run_step(|| {
            let (id, name) = self.root.add_registration(self, plugin, config)?;
            self.root.try_fork(id);
            Ok(PluginHandle {
                root: Arc::downgrade(&self.root),
                id,
                name,
            })
        })
    }

    /// Runs `callback` in a fresh fork whenever all of `names` are present.
    ///
    /// The fork is disposed whenever one of them changes or disappears, and
    /// a new one is created if they are all present again.
    pub fn using<I, S, F>(&self, names: I, callback: F) -> CoreResult<PluginHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let plugin = plugin_fn(format!("using({})", names.join(", ")), move |ctx, _| {
            callback(ctx)
        })
        .using(names)
        .reusable(true);
        self.register(Arc::new(plugin), Value::Null)
    }

    /// Disposes every registration of `plugin` and drops its runtime.
    ///
    /// Returns `false` if the plugin is not registered (for instance because
    /// it was already disposed).
    pub fn dispose(&self, plugin: &Arc<dyn Plugin>) -> bool {
        self.root.run_step(|| self.root.dispose_plugin(plugin))
    }

    /// Disposes the registration owning this context's fork.
    pub fn dispose_state(&self) -> bool {
        let Some(fork) = self.state else {
            return false;
        };
        let registration = self
            .root
            .registry
            .lock()
            .forks
            .get(&fork)
            .map(|entry| entry.registration);
        match registration {
            Some(registration) => self
                .root
                .run_step(|| self.root.dispose_registration(registration)),
            None => false,
        }
    }

    /// Name of the plugin whose fork owns this context.
    pub fn plugin_name(&self) -> Option<String> {
        let registry = self.root.registry.lock();
        let fork = registry.forks.get(&self.state?)?;
        registry
            .runtimes
            .get(&fork.runtime)
            .map(|runtime| runtime.name.clone())
    }

    /// Counters describing this tree's plugin graph.
    pub fn registry_stats(&self) -> RegistryStats {
        self.root.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_using() {
        assert!(validate_using("p", &["a".into(), "b".into()]).is_ok());
        assert!(matches!(
            validate_using("p", &["a".into(), " ".into()]),
            Err(CoreError::Configuration { .. })
        ));
        let err = validate_using("p", &["a".into(), "a".into()]).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }
}
