//! Opaque identifiers handed out by a context tree's root.
//!
//! All identifiers of one tree come from a single monotonically increasing
//! counter, so comparing two ids of the same kind also compares their
//! creation order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Returns the raw numeric value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Storage slot of a service in the root store.
    ServiceId,
    "service"
);
define_id!(
    /// One plugin instantiation.
    ForkId,
    "fork"
);
define_id!(
    /// One plugin definition known to the registry.
    RuntimeId,
    "runtime"
);
define_id!(
    /// One `register` call.
    RegistrationId,
    "registration"
);
define_id!(
    /// One event listener.
    HookId,
    "hook"
);
define_id!(
    /// One plugin instance (shared by the forks of a single-instance plugin).
    InstanceId,
    "instance"
);

/// Counter shared by every id kind of one tree.
#[derive(Debug)]
pub(crate) struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn service(&self) -> ServiceId {
        ServiceId(self.next())
    }

    pub(crate) fn fork(&self) -> ForkId {
        ForkId(self.next())
    }

    pub(crate) fn runtime(&self) -> RuntimeId {
        RuntimeId(self.next())
    }

    pub(crate) fn registration(&self) -> RegistrationId {
        RegistrationId(self.next())
    }

    pub(crate) fn hook(&self) -> HookId {
        HookId(self.next())
    }

    pub(crate) fn instance(&self) -> InstanceId {
        InstanceId(self.next())
    }

    /// A position in the tree's history, comparable with every id above.
    pub(crate) fn sequence(&self) -> u64 {
        self.next()
    }
}
