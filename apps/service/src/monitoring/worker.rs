use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checker::Checker;
use super::lock::{ClaimGuard, LockCoordinator};
use crate::database::{ClaimError, MonitorStore};
use crate::models::{CheckResult, Monitor, Outcome, ProbeDetail};

/// One monitor handed to the pool.
///
/// The permit and pending marker travel with the monitor and are dropped
/// when the worker is done with it.
pub struct Dispatch {
    monitor: Monitor,
    _slot: OwnedSemaphorePermit,
    _pending: PendingMarker,
}

struct PendingMarker {
    id: Uuid,
    pending: Arc<StdMutex<HashSet<Uuid>>>,
}

impl Drop for PendingMarker {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// Sending side of the pool, owned by the scheduler. Dropping it closes the
/// dispatch channel and lets idle workers exit.
pub struct Dispatcher {
    tx: mpsc::Sender<Dispatch>,
    slots: Arc<Semaphore>,
    pending: Arc<StdMutex<HashSet<Uuid>>>,
}

/// What happened to a monitor offered to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent,
    /// Still queued or running from an earlier tick.
    AlreadyPending,
    /// Cancelled, or the pool is gone.
    Closed,
}

impl Dispatcher {
    /// Hand a monitor to the pool.
    ///
    /// Waits until a worker slot is free or `cancel` fires, so the caller
    /// never gets further ahead than the pool size.
    pub async fn dispatch(&self, monitor: Monitor, cancel: &CancellationToken) -> DispatchStatus {
        let id = monitor.id;
        {
            let Ok(mut pending) = self.pending.lock() else {
                return DispatchStatus::Closed;
            };
            if !pending.insert(id) {
                return DispatchStatus::AlreadyPending;
            }
        }
        let marker = PendingMarker { id, pending: Arc::clone(&self.pending) };

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DispatchStatus::Closed,
            slot = Arc::clone(&self.slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return DispatchStatus::Closed,
            },
        };

        match self.tx.send(Dispatch { monitor, _slot: slot, _pending: marker }).await {
            Ok(()) => DispatchStatus::Sent,
            Err(_) => DispatchStatus::Closed,
        }
    }
}

/// Fixed set of workers consuming the dispatch channel
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers. They run until the dispatcher is dropped or
    /// `cancel` fires.
    pub fn start<S>(
        size: usize,
        store: Arc<S>,
        checker: Arc<dyn Checker>,
        cancel: CancellationToken,
    ) -> (Dispatcher, WorkerPool)
    where
        S: MonitorStore + 'static,
    {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel(size);
        let receiver = Arc::new(Mutex::new(rx));

        let handles = (0..size)
            .map(|id| {
                let worker = Worker {
                    id,
                    receiver: Arc::clone(&receiver),
                    store: store.clone(),
                    locks: store.clone(),
                    checker: Arc::clone(&checker),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers = size, "worker pool started");

        let dispatcher = Dispatcher {
            tx,
            slots: Arc::new(Semaphore::new(size)),
            pending: Arc::new(StdMutex::new(HashSet::new())),
        };
        (dispatcher, WorkerPool { handles })
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    store: Arc<dyn MonitorStore>,
    locks: Arc<dyn LockCoordinator>,
    checker: Arc<dyn Checker>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, "cancelled, worker stopping");
                    break;
                }
                next = async { self.receiver.lock().await.recv().await } => next,
            };

            let Some(dispatch) = next else {
                debug!(worker = self.id, "channel closed, worker stopping");
                break;
            };

            self.work(&dispatch.monitor).await;
        }
    }

    /// Claim, probe, persist, release. Every failure is logged and contained
    /// to this monitor.
    async fn work(&self, monitor: &Monitor) {
        let monitor_id = monitor.id;

        let guard = match ClaimGuard::acquire(Arc::clone(&self.locks), monitor_id).await {
            Ok(guard) => guard,
            Err(ClaimError::AlreadyLocked) => {
                info!(worker = self.id, %monitor_id, "monitor already in flight, skipping");
                return;
            }
            Err(ClaimError::NotDue) => {
                debug!(worker = self.id, %monitor_id, "monitor ran since it was listed, skipping");
                return;
            }
            Err(ClaimError::NotFound) => {
                info!(worker = self.id, %monitor_id, "monitor no longer exists, skipping");
                return;
            }
            Err(ClaimError::Store(e)) => {
                error!(worker = self.id, %monitor_id, error = %e, "failed to claim monitor");
                return;
            }
        };

        debug!(worker = self.id, %monitor_id, kind = %monitor.kind(), "start monitoring");

        let probe = self.checker.check(monitor, self.cancel.child_token());
        let result = match AssertUnwindSafe(probe).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker = self.id, %monitor_id, panic = %message, "probe panicked");
                CheckResult::new(monitor_id, Utc::now(), ProbeDetail::empty(monitor.kind()))
                    .with_outcome(Outcome::Unknown)
                    .with_error(format!("probe panicked: {message}"))
            }
        };

        match result.outcome {
            Outcome::Down => warn!(
                worker = self.id, %monitor_id, outcome = %result.outcome,
                error = %result.error_message, "monitor is down"
            ),
            outcome => info!(worker = self.id, %monitor_id, %outcome, "monitor checked"),
        }

        if let Err(e) = self.store.save_result(&result).await {
            error!(worker = self.id, %monitor_id, error = %e, "failed to save result");
        }

        if let Err(e) = guard.release().await {
            error!(worker = self.id, %monitor_id, error = %e, "failed to unlock monitor");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
