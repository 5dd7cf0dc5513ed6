use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use crate::database::{ClaimError, StoreError};

/// Claim/release of a monitor's in-flight flag.
///
/// `claim` must be a single atomic conditional update so that at most one
/// claim per monitor is outstanding, even across processes.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Set the in-flight flag iff the monitor exists, is not in flight and is
    /// due. A monitor that ran since it was listed reports `NotDue`.
    async fn claim(&self, id: Uuid) -> Result<(), ClaimError>;

    /// Clear the in-flight flag and stamp the last run time. Idempotent.
    async fn release(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// A successful claim.
///
/// Call [`ClaimGuard::release`] when the work is done. A guard dropped
/// without being released (panic, task abort) releases from a spawned task
/// instead, so the lock never outlives the work unit.
pub struct ClaimGuard {
    coordinator: Arc<dyn LockCoordinator>,
    id: Uuid,
    released: bool,
}

impl ClaimGuard {
    pub async fn acquire(coordinator: Arc<dyn LockCoordinator>, id: Uuid) -> Result<Self, ClaimError> {
        coordinator.claim(id).await?;
        Ok(Self { coordinator, id, released: false })
    }

    /// Release the lock, stamping the last run time with the current time.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.coordinator.release(self.id, Utc::now()).await
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let coordinator = Arc::clone(&self.coordinator);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(monitor_id = %id, "claim dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = coordinator.release(id, Utc::now()).await {
                        error!(monitor_id = %id, error = %e, "failed to release monitor");
                    }
                });
            }
            Err(_) => {
                error!(monitor_id = %id, "claim dropped outside a runtime, monitor stays locked");
            }
        }
    }
}
