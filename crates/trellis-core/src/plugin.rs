//! Plugin definitions and instances.
//!
//! A [`Plugin`] is the static description of a unit of functionality: a
//! name, the services it needs (`using`), the services it isolates, whether
//! it is reusable, and a body ([`Plugin::apply`]) that runs against a fresh
//! child [`Context`] every time the plugin is instantiated.
//!
//! The body returns an [`Instance`] carrying the optional lifecycle hooks:
//!
//! ```text
//! apply() ──► fork() ──► start() ──► ... ──► stop()
//!   body      per fork    start barrier      disposal
//! ```
//!
//! Reusable plugins run their body for every fork and get one instance per
//! fork. Single-instance plugins (the default) run their body once; later
//! forks of the same definition share that instance and only receive the
//! `fork` hook. The shared instance is stopped when its last fork goes away.
//!
//! # Closures as plugins
//!
//! ```rust,ignore
//! let greeter = plugin_fn("greeter", |ctx: &Context, config: &Value| {
//!     let name = config["name"].as_str().unwrap_or("world").to_string();
//!     ctx.on_dispose(move || println!("bye, {name}"));
//! })
//! .using(["console"]);
//!
//! app.register(Arc::new(greeter), json!({ "name": "trellis" }))?;
//! ```
//!
//! # Services
//!
//! [`service_plugin`] builds a single-instance plugin whose instance is
//! itself a service: it is stored under the service name once it started
//! (or as soon as it is built, for an immediate service) and withdrawn when
//! its last fork is disposed.
//!
//! ```rust,ignore
//! let db = service_plugin("db", |_: &Context, config: &Value| {
//!     Ok(Arc::new(Database::connect(config)?))
//! });
//! app.register(Arc::new(db), json!({ "url": "sqlite::memory" }))?;
//! app.start().await?;
//! let db = app.get_as::<Database>("db");
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::context::Context;
use crate::error::BoxError;
use crate::service::{ServiceArc, same_service};

/// A plugin definition.
///
/// Plugins are identified by the `Arc` they are registered through: every
/// registration of the same `Arc<dyn Plugin>` shares one runtime record.
pub trait Plugin: Send + Sync + 'static {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Service names that must all be present before the plugin is
    /// instantiated.
    fn using(&self) -> Vec<String> {
        Vec::new()
    }

    /// Service names that receive a private slot in every fork's context.
    fn isolate(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether every fork gets its own instance.
    fn reusable(&self) -> bool {
        false
    }

    /// The plugin body. Runs synchronously against the new fork's context.
    fn apply(&self, ctx: &Context, config: &Value) -> Result<Arc<dyn Instance>, BoxError>;
}

/// Lifecycle hooks of a live plugin instance. Every hook is optional.
#[async_trait]
pub trait Instance: Send + Sync + 'static {
    /// Called synchronously for every fork, right after the body ran (or,
    /// for a shared instance, right after the fork was created).
    fn fork(&self, _ctx: &Context, _config: &Value) {}

    /// Called when the instance enters the started state.
    async fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called when the instance's last fork is disposed after it started.
    async fn stop(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The instance of a plugin without hooks.
impl Instance for () {}

// =============================================================================
// IntoInstance
// =============================================================================

/// Conversion of a plugin body's return value into an instance.
pub trait IntoInstance {
    fn into_instance(self) -> Result<Arc<dyn Instance>, BoxError>;
}

impl IntoInstance for () {
    fn into_instance(self) -> Result<Arc<dyn Instance>, BoxError> {
        Ok(Arc::new(()))
    }
}

impl<T: Instance> IntoInstance for Arc<T> {
    fn into_instance(self) -> Result<Arc<dyn Instance>, BoxError> {
        Ok(self)
    }
}

impl<E: Into<BoxError>> IntoInstance for Result<(), E> {
    fn into_instance(self) -> Result<Arc<dyn Instance>, BoxError> {
        match self {
            Ok(()) => ().into_instance(),
            Err(err) => Err(err.into()),
        }
    }
}

impl<T: Instance, E: Into<BoxError>> IntoInstance for Result<Arc<T>, E> {
    fn into_instance(self) -> Result<Arc<dyn Instance>, BoxError> {
        match self {
            Ok(instance) => Ok(instance as Arc<dyn Instance>),
            Err(err) => Err(err.into()),
        }
    }
}

// =============================================================================
// PluginFn
// =============================================================================

/// A plugin whose body is a closure. Build one with [`plugin_fn`].
pub struct PluginFn<F, R> {
    name: String,
    using: Vec<String>,
    isolate: Vec<String>,
    reusable: bool,
    body: F,
    // fn() -> R keeps the wrapper Send + Sync whatever R is.
    _marker: PhantomData<fn() -> R>,
}

/// Wraps `body` into a plugin named `name`.
pub fn plugin_fn<F, R>(name: impl Into<String>, body: F) -> PluginFn<F, R>
where
    F: Fn(&Context, &Value) -> R + Send + Sync + 'static,
    R: IntoInstance + 'static,
{
    PluginFn {
        name: name.into(),
        using: Vec::new(),
        isolate: Vec::new(),
        reusable: false,
        body,
        _marker: PhantomData,
    }
}

impl<F, R> PluginFn<F, R> {
    /// Declares the services this plugin depends on.
    pub fn using<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.using = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declares the services isolated in every fork's context.
    pub fn isolate<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.isolate = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn reusable(mut self, reusable: bool) -> Self {
        self.reusable = reusable;
        self
    }
}

impl<F, R> Plugin for PluginFn<F, R>
where
    F: Fn(&Context, &Value) -> R + Send + Sync + 'static,
    R: IntoInstance + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn using(&self) -> Vec<String> {
        self.using.clone()
    }

    fn isolate(&self) -> Vec<String> {
        self.isolate.clone()
    }

    fn reusable(&self) -> bool {
        self.reusable
    }

    fn apply(&self, ctx: &Context, config: &Value) -> Result<Arc<dyn Instance>, BoxError> {
        (self.body)(ctx, config).into_instance()
    }
}

impl<F, R> std::fmt::Debug for PluginFn<F, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFn")
            .field("name", &self.name)
            .field("using", &self.using)
            .field("isolate", &self.isolate)
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ServicePlugin
// =============================================================================

/// A single-instance plugin publishing its instance as a service.
/// Build one with [`service_plugin`].
pub struct ServicePlugin<T, F> {
    name: String,
    service: String,
    using: Vec<String>,
    immediate: bool,
    body: F,
    _marker: PhantomData<fn() -> T>,
}

/// Wraps `body` into a plugin publishing its result under `service`.
///
/// The plugin is named after the service unless renamed with
/// [`ServicePlugin::named`].
pub fn service_plugin<T, F>(service: impl Into<String>, body: F) -> ServicePlugin<T, F>
where
    T: Instance,
    F: Fn(&Context, &Value) -> Result<Arc<T>, BoxError> + Send + Sync + 'static,
{
    let service = service.into();
    ServicePlugin {
        name: service.clone(),
        service,
        using: Vec::new(),
        immediate: false,
        body,
        _marker: PhantomData,
    }
}

impl<T, F> ServicePlugin<T, F> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declares the services this plugin depends on.
    pub fn using<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.using = names.into_iter().map(Into::into).collect();
        self
    }

    /// Publishes the instance right after the body ran instead of waiting
    /// for it to start.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

impl<T, F> Plugin for ServicePlugin<T, F>
where
    T: Instance,
    F: Fn(&Context, &Value) -> Result<Arc<T>, BoxError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn using(&self) -> Vec<String> {
        self.using.clone()
    }

    fn apply(&self, ctx: &Context, config: &Value) -> Result<Arc<dyn Instance>, BoxError> {
        let inner = (self.body)(ctx, config)?;
        let slot = Arc::new(ServiceSlot {
            ctx: ctx.clone(),
            name: self.service.clone(),
            value: Arc::clone(&inner) as ServiceArc,
            forks: AtomicUsize::new(0),
        });
        if self.immediate {
            slot.publish();
        }
        Ok(Arc::new(Published {
            inner,
            slot,
            immediate: self.immediate,
        }))
    }
}

impl<T, F> std::fmt::Debug for ServicePlugin<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePlugin")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("using", &self.using)
            .field("immediate", &self.immediate)
            .finish_non_exhaustive()
    }
}

/// Where a service instance is published, and how many forks hold it.
struct ServiceSlot {
    ctx: Context,
    name: String,
    value: ServiceArc,
    forks: AtomicUsize,
}

impl ServiceSlot {
    fn publish(&self) {
        debug!(service = %self.name, "publishing service instance");
        self.ctx.set(self.name.as_str(), Some(Arc::clone(&self.value)));
    }

    /// Clears the slot unless another value has replaced ours.
    fn withdraw(&self) {
        let ours = self
            .ctx
            .get(self.name.as_str())
            .is_some_and(|current| same_service(&current, &self.value));
        if ours {
            debug!(service = %self.name, "withdrawing service instance");
            self.ctx.remove(self.name.as_str());
        }
    }
}

struct Published<T> {
    inner: Arc<T>,
    slot: Arc<ServiceSlot>,
    immediate: bool,
}

#[async_trait]
impl<T: Instance> Instance for Published<T> {
    fn fork(&self, ctx: &Context, config: &Value) {
        self.slot.forks.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::clone(&self.slot);
        ctx.on_dispose(move || {
            if slot.forks.fetch_sub(1, Ordering::SeqCst) == 1 {
                slot.withdraw();
            }
        });
        self.inner.fork(ctx, config);
    }

    async fn start(&self) -> Result<(), BoxError> {
        self.inner.start().await?;
        if !self.immediate {
            self.slot.publish();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), BoxError> {
        self.inner.stop().await
    }
}
