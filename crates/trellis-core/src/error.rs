//! Error types for the Trellis core.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::ids::ForkId;

/// Boxed error returned by plugin bodies and lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The lifecycle hook that produced a [`HookFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    /// The plugin body ([`Plugin::apply`](crate::Plugin::apply)).
    Apply,
    /// [`Instance::start`](crate::Instance::start).
    Start,
    /// [`Instance::stop`](crate::Instance::stop).
    Stop,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Apply => "apply",
            Self::Start => "start",
            Self::Stop => "stop",
        })
    }
}

/// A single failed plugin body or lifecycle hook.
#[derive(Debug, Clone, Error, Serialize)]
#[error("plugin '{plugin}' failed in {hook} hook: {message}")]
pub struct HookFailure {
    /// Name of the plugin whose hook failed.
    pub plugin: String,
    /// Which hook failed.
    pub hook: HookKind,
    /// Rendered error message.
    pub message: String,
}

/// Every hook failure collected during one barrier pass.
///
/// Failures never abort sibling hooks; they are gathered and reported
/// together to the caller of `start()`, `stop()` or `settle()`.
#[derive(Debug, Clone, Serialize)]
pub struct HookFailures(pub Vec<HookFailure>);

impl HookFailures {
    /// Returns `Ok(())` for an empty list, `Err` otherwise.
    pub fn into_result(failures: Vec<HookFailure>) -> CoreResult<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Hooks(Self(failures)))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookFailure> {
        self.0.iter()
    }
}

impl fmt::Display for HookFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hook(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HookFailures {}

/// Errors surfaced by the core.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// The plugin's dependency declaration is invalid.
    #[error("invalid dependency declaration for plugin '{plugin}': {reason}")]
    Configuration {
        /// Plugin name.
        plugin: String,
        /// What is wrong with the declaration.
        reason: String,
    },

    /// The calling context belongs to a fork that has already been disposed.
    #[error("context belongs to fork {0}, which is no longer active")]
    Inactive(ForkId),

    /// One or more hooks failed during a barrier pass.
    #[error(transparent)]
    Hooks(#[from] HookFailures),
}

impl CoreError {
    /// Creates a configuration error.
    pub fn configuration(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
