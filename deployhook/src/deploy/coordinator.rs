//! Deployment coordinator
//!
//! Process-wide "deployment in progress" flag. Constructed once at startup and
//! shared by reference. At most one [`DeploymentPermit`] exists at a time and
//! the flag is released when the permit is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

/// Guards the external deployment process slot
#[derive(Debug, Default)]
pub struct DeploymentCoordinator {
    in_progress: AtomicBool,
    released: Notify,
}

impl DeploymentCoordinator {
    pub fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    /// Try to take the deployment slot. Never waits.
    pub fn try_acquire(self: &Arc<Self>) -> Option<DeploymentPermit> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                debug!("Deployment slot acquired");
                DeploymentPermit {
                    coordinator: Arc::clone(self),
                }
            })
    }

    /// Whether a deployment currently holds the slot
    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Resolve once no deployment holds the slot
    pub async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed
            released.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            released.await;
        }
    }

    fn release(&self) {
        self.in_progress.store(false, Ordering::Release);
        self.released.notify_waiters();
        debug!("Deployment slot released");
    }
}

/// Proof of holding the deployment slot
#[derive(Debug)]
#[must_use = "the deployment slot is released as soon as the permit is dropped"]
pub struct DeploymentPermit {
    coordinator: Arc<DeploymentCoordinator>,
}

impl Drop for DeploymentPermit {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}
