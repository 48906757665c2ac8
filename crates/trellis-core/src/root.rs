//! Shared state owned by the root of a context tree.
//!
//! Every [`Context`](crate::Context) of one tree holds an `Arc<Root>`. The
//! root is the only place where service values, listeners and the plugin
//! graph live; contexts only carry a mapping chain and an optional fork id.
//!
//! # Steps
//!
//! Every mutating operation (`set`, `register`, `dispose`, ...) runs as one
//! *step* through [`Root::run_step`]. Steps are serialised by a re-entrant
//! lock, so plugin code may call back into the tree from the same thread.
//! Service-change events raised while a step is in flight are queued and
//! processed in FIFO order once the outermost step's operation has returned,
//! which keeps re-evaluations from ever interleaving with a disposal that is
//! still running.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::trace;

use crate::context::Mapping;
use crate::hooks::HookDriver;
use crate::ids::{IdAllocator, ServiceId};
use crate::lifecycle::Lifecycle;
use crate::registry::RegistryState;
use crate::service::{ServiceStore, ServiceTable};

/// A committed service write, waiting to be broadcast.
#[derive(Debug, Clone)]
pub(crate) struct ServiceEvent {
    pub(crate) name: String,
    /// Identifier the writer resolved the name to; only contexts resolving
    /// the name to the same identifier observe the event.
    pub(crate) id: ServiceId,
    /// Drawn from the id counter right after the write. Forks with a larger
    /// id were created after the write and already saw the new value.
    pub(crate) seq: u64,
}

pub(crate) struct Root {
    pub(crate) ids: IdAllocator,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) services: Mutex<ServiceTable>,
    pub(crate) store: Mutex<ServiceStore>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) registry: Mutex<RegistryState>,
    pub(crate) hooks: HookDriver,
    pub(crate) started: AtomicBool,
    /// Set once the start barrier has settled and `ready` was emitted.
    pub(crate) ready: AtomicBool,
    step: ReentrantMutex<()>,
    queue: Mutex<VecDeque<ServiceEvent>>,
    flushing: AtomicBool,
}

/// Clears the flushing flag even if the step's operation unwinds.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Root {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ids: IdAllocator::new(),
            mapping: Mapping::root(),
            services: Mutex::new(ServiceTable::default()),
            store: Mutex::new(ServiceStore::default()),
            lifecycle: Lifecycle::default(),
            registry: Mutex::new(RegistryState::default()),
            hooks: HookDriver::default(),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            step: ReentrantMutex::new(()),
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Resolves `name` through `mapping`, falling back to the name's default
    /// identifier in the service table.
    pub(crate) fn resolve(&self, mapping: &Mapping, name: &str) -> ServiceId {
        match mapping.lookup(name) {
            Some(id) => id,
            None => self.services.lock().default_id(name, &self.ids),
        }
    }

    pub(crate) fn enqueue(&self, event: ServiceEvent) {
        self.queue.lock().push_back(event);
    }

    /// Runs `op` as one atomic step (see the module docs).
    pub(crate) fn run_step<R>(self: &Arc<Self>, op: impl FnOnce() -> R) -> R {
        let _step = self.step.lock();
        if self.flushing.swap(true, Ordering::AcqRel) {
            // Nested inside another step: events stay queued for the outer one.
            return op();
        }
        let _guard = FlushGuard(&self.flushing);
        let output = op();
        self.drain();
        output
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let next = self.queue.lock().pop_front();
            let Some(event) = next else {
                break;
            };
            trace!(service = %event.name, id = %event.id, "processing service event");
            self.broadcast_service_event(&event);
            self.reevaluate(&event);
        }
    }
}
