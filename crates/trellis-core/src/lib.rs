//! # Trellis Core
//!
//! The reactive graph at the heart of Trellis: a context tree with scoped
//! service bindings, and a plugin graph that instantiates plugins when their
//! dependencies appear and tears them down when those dependencies go away.
//!
//! ## Building Blocks
//!
//! - **Context tree** ([`Context`]): scoping nodes. [`Context::isolate`]
//!   gives a subtree private slots for selected service names;
//!   [`Context::extend`] derives a child with overridden metadata.
//! - **Services** ([`Context::get`], [`Context::set`]): one store per tree,
//!   addressed through each context's mapping chain. Writes are compared by
//!   pointer identity; a changed write raises a scoped `internal/service`
//!   event.
//! - **Plugins** ([`Plugin`], [`Instance`], [`plugin_fn`]): units declaring
//!   the services they use. A registration forks the plugin as soon as its
//!   dependencies are present, and re-forks it whenever one of them changes.
//!   [`service_plugin`] publishes a plugin's instance as a service.
//! - **Events** ([`Context::on`], [`Context::emit`]): `dispose`, `ready`
//!   and `internal/service` plus any custom event.
//!
//! ## Flow
//!
//! ```text
//! ctx.set("db", ..) ──► store ──► internal/service("db") ──► registry
//!                                                              │
//!                     ┌────────────────────────────────────────┘
//!                     ▼
//!      dispose stale forks of plugins using "db" ──► fork them again
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::Value;
//! use trellis_core::{Context, plugin_fn};
//!
//! #[tokio::main]
//! async fn main() -> trellis_core::CoreResult<()> {
//!     let app = Context::new();
//!
//!     let reporter = plugin_fn("reporter", |ctx: &Context, _: &Value| {
//!         let db = ctx.get_as::<String>("db");
//!         println!("db is {db:?}");
//!         ctx.on_dispose(|| println!("db went away"));
//!     })
//!     .using(["db"]);
//!     app.register(Arc::new(reporter), Value::Null)?;
//!
//!     app.start().await?;
//!     app.provide("db", Arc::new("sqlite::memory".to_string())); // forks reporter
//!     app.remove("db"); // disposes it again
//!     app.stop().await
//! }
//! ```

mod context;
mod error;
mod hooks;
mod ids;
mod lifecycle;
mod plugin;
mod registry;
mod root;
mod service;

pub use context::{Context, ContextMeta};
pub use error::{BoxError, CoreError, CoreResult, HookFailure, HookFailures, HookKind};
pub use ids::{ForkId, HookId, InstanceId, RegistrationId, RuntimeId, ServiceId};
pub use lifecycle::{DISPOSE, Disposable, EventHandler, INTERNAL_SERVICE, READY};
pub use plugin::{
    Instance, IntoInstance, Plugin, PluginFn, ServicePlugin, plugin_fn, service_plugin,
};
pub use registry::{PluginHandle, RegistryStats};
pub use service::{PrivateKey, ServiceArc, ServiceKey, ServiceTrace, same_service};

pub use async_trait::async_trait;
// Plugin configs are `serde_json::Value`s.
pub use serde_json;

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        BoxError, Context, ContextMeta, CoreError, CoreResult, Disposable, Instance, Plugin,
        PluginHandle, ServiceArc, ServiceKey, async_trait, plugin_fn, service_plugin,
    };
}
