use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::checker::Checker;
use super::worker::{DispatchStatus, Dispatcher, WorkerPool};
use crate::database::MonitorStore;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How often the store is asked for due monitors
    pub tick: Duration,
    /// Number of concurrent probes
    pub workers: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { tick: DEFAULT_TICK, workers: DEFAULT_WORKERS }
    }
}

/// Returned by [`Scheduler::run`] once the run token is cancelled.
#[derive(Debug, Error)]
#[error("scheduler cancelled")]
pub struct Cancelled;

/// Periodically feeds due monitors to a worker pool.
pub struct Scheduler<S> {
    store: Arc<S>,
    checker: Arc<dyn Checker>,
    settings: SchedulerSettings,
}

impl<S: MonitorStore + 'static> Scheduler<S> {
    pub fn new(store: Arc<S>, checker: Arc<dyn Checker>, settings: SchedulerSettings) -> Self {
        Self { store, checker, settings }
    }

    /// Run until `cancel` fires.
    ///
    /// Workers are started before the first tick. On cancellation the
    /// dispatcher is dropped, which closes the dispatch channel, and the call
    /// only returns after every worker has exited. Always ends with
    /// `Err(Cancelled)`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Cancelled> {
        let (dispatcher, pool) = WorkerPool::start(
            self.settings.workers,
            Arc::clone(&self.store),
            Arc::clone(&self.checker),
            cancel.clone(),
        );

        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_ms = self.settings.tick.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.dispatch_due(&dispatcher, &cancel).await {
                        break;
                    }
                }
            }
        }

        drop(dispatcher);
        pool.join().await;
        info!("scheduler stopped");

        Err(Cancelled)
    }

    /// One tick. Returns `false` once dispatching is over for good.
    async fn dispatch_due(&self, dispatcher: &Dispatcher, cancel: &CancellationToken) -> bool {
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            listed = self.store.list_due(Utc::now()) => listed,
        };

        let monitors = match listed {
            Ok(monitors) => monitors,
            Err(e) => {
                // Retried on the next tick
                error!(error = %e, "failed to get due monitors");
                return true;
            }
        };

        if !monitors.is_empty() {
            debug!(count = monitors.len(), "dispatching due monitors");
        }

        for monitor in monitors {
            let monitor_id = monitor.id;
            match dispatcher.dispatch(monitor, cancel).await {
                DispatchStatus::Sent => {}
                DispatchStatus::AlreadyPending => {
                    debug!(%monitor_id, "monitor still pending from an earlier tick");
                }
                DispatchStatus::Closed => return false,
            }
        }

        true
    }
}
