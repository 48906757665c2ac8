//! Driver for asynchronous `start` / `stop` hooks.
//!
//! Fork creation and disposal are synchronous, but hooks return futures.
//! The driver polls every hook future once, right where the hook is
//! invoked; hooks that finish synchronously are settled on the spot, the
//! rest are parked until the next barrier (`start()`, `stop()`, `settle()`)
//! drives them to completion. Hooks are never cancelled.
//!
//! Failures are logged when they happen and kept until a barrier collects
//! them, so none is silently dropped.

use std::sync::atomic::Ordering;
use std::task::{Context as TaskContext, Poll};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use futures::task::noop_waker;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::error::{BoxError, CoreResult, HookFailure, HookFailures, HookKind};

pub(crate) type HookFuture = BoxFuture<'static, Result<(), BoxError>>;

struct InFlight {
    plugin: String,
    hook: HookKind,
    future: HookFuture,
}

#[derive(Default)]
pub(crate) struct HookDriver {
    in_flight: Mutex<Vec<InFlight>>,
    failures: Mutex<Vec<HookFailure>>,
}

impl HookDriver {
    /// Invokes a hook: polls it once and parks it if it is still pending.
    pub(crate) fn drive(&self, plugin: &str, hook: HookKind, mut future: HookFuture) {
        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);
        match future.poll_unpin(&mut cx) {
            Poll::Ready(result) => self.record(plugin, hook, result),
            Poll::Pending => {
                debug!(plugin, %hook, "hook still pending, parked until the next barrier");
                self.in_flight.lock().push(InFlight {
                    plugin: plugin.to_string(),
                    hook,
                    future,
                });
            }
        }
    }

    /// Records the outcome of a plugin body or hook.
    pub(crate) fn record(&self, plugin: &str, hook: HookKind, result: Result<(), BoxError>) {
        if let Err(err) = result {
            error!(plugin, %hook, error = %err, "plugin hook failed");
            self.failures.lock().push(HookFailure {
                plugin: plugin.to_string(),
                hook,
                message: err.to_string(),
            });
        }
    }

    /// Awaits every parked hook, including hooks parked while awaiting, and
    /// returns all failures collected since the previous call.
    pub(crate) async fn settle(&self) -> Vec<HookFailure> {
        loop {
            let batch = std::mem::take(&mut *self.in_flight.lock());
            if batch.is_empty() {
                break;
            }
            let outcomes = future::join_all(batch.into_iter().map(|in_flight| async move {
                let result = in_flight.future.await;
                (in_flight.plugin, in_flight.hook, result)
            }))
            .await;
            for (plugin, hook, result) in outcomes {
                self.record(&plugin, hook, result);
            }
        }
        std::mem::take(&mut *self.failures.lock())
    }

    pub(crate) fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }
}

// =============================================================================
// Barriers
// =============================================================================

impl Context {
    /// Enters the started state and awaits every `start` hook.
    ///
    /// Instances created from now on are started as soon as their fork is
    /// created. `ready` listeners run once all hooks have settled. Calling
    /// `start` on any context of a tree starts the whole tree; a second call
    /// only settles outstanding hooks.
    ///
    /// Every failing hook is reported in the returned
    /// [`CoreError::Hooks`](crate::CoreError::Hooks); no failure prevents the
    /// other hooks from running.
    pub async fn start(&self) -> CoreResult<()> {
        let first = !self.root.started.swap(true, Ordering::AcqRel);
        self.root.run_step(|| {
            for (plugin, instance) in self.root.begin_start() {
                debug!(%plugin, "starting instance");
                let future = Box::pin(async move { instance.start().await });
                self.root.hooks.drive(&plugin, HookKind::Start, future);
            }
        });
        let failures = self.root.hooks.settle().await;
        if first {
            self.root.ready.store(true, Ordering::Release);
            self.root.emit_ready();
            info!(failures = failures.len(), "context tree started");
        }
        HookFailures::into_result(failures)
    }

    /// Disposes every top-level registration in creation order, runs the
    /// root's `dispose` listeners and awaits every `stop` hook.
    ///
    /// The tree can be reused afterwards: registrations made after `stop`
    /// behave as before the first `start`.
    pub async fn stop(&self) -> CoreResult<()> {
        let was_started = self.root.started.swap(false, Ordering::AcqRel);
        self.root.ready.store(false, Ordering::Release);
        self.root.run_step(|| self.root.dispose_all());
        let failures = self.root.hooks.settle().await;
        if was_started {
            info!(failures = failures.len(), "context tree stopped");
        }
        HookFailures::into_result(failures)
    }

    /// Awaits every hook still in flight and reports the failures collected
    /// since the previous barrier.
    pub async fn settle(&self) -> CoreResult<()> {
        HookFailures::into_result(self.root.hooks.settle().await)
    }

    /// Whether the tree has entered the started state.
    pub fn is_started(&self) -> bool {
        self.root.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_ready_hook_settles_immediately() {
        let driver = HookDriver::default();
        driver.drive("p", HookKind::Start, Box::pin(async { Ok::<(), BoxError>(()) }));
        assert_eq!(driver.pending(), 0);

        driver.drive("p", HookKind::Stop, Box::pin(async { Err::<(), BoxError>("boom".into()) }));
        assert_eq!(driver.pending(), 0);
        assert_eq!(driver.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_hooks_are_awaited_and_failures_collected() {
        let driver = HookDriver::default();
        let finished = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&finished);

        driver.drive(
            "slow",
            HookKind::Start,
            Box::pin(async move {
                tokio::task::yield_now().await;
                f.store(true, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }),
        );
        driver.drive(
            "broken",
            HookKind::Start,
            Box::pin(async {
                tokio::task::yield_now().await;
                Err::<(), BoxError>("refused".into())
            }),
        );
        assert_eq!(driver.pending(), 2);

        let failures = driver.settle().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].plugin, "broken");
        assert_eq!(failures[0].hook, HookKind::Start);
        assert!(driver.settle().await.is_empty());
    }
}
