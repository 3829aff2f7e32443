//! Bounded-wait acquisition of target leases with a renewing heartbeat

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::DeploydError;
use crate::models::lease::TargetKey;
use crate::store::StateStore;

/// Pause after the first failed attempt on a busy target
const RETRY_BASE: Duration = Duration::from_millis(100);
/// Longest pause between attempts
const RETRY_MAX: Duration = Duration::from_secs(2);

/// Doubling pause before attempt `attempt + 1`, capped at `RETRY_MAX`
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(RETRY_MAX, |d| d.min(RETRY_MAX))
}

/// Acquires per-target leases on behalf of one process instance
#[derive(Clone)]
pub struct LeaseManager {
    store: StateStore,
    holder: String,
    ttl: Duration,
    lock_wait: Duration,
}

impl LeaseManager {
    pub fn new(store: StateStore, holder: impl Into<String>, ttl: Duration, lock_wait: Duration) -> Self {
        Self {
            store,
            holder: holder.into(),
            ttl,
            lock_wait,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wait up to `lock_wait` for the target, then give up with `TargetBusy`.
    ///
    /// Must be called from within a tokio runtime: the returned guard spawns
    /// the heartbeat that keeps the lease alive.
    pub async fn acquire(&self, target: &TargetKey, deployment_id: &str) -> Result<LeaseGuard, DeploydError> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            if self
                .store
                .try_acquire_lease(target, deployment_id, &self.holder, self.ttl)?
                .is_some()
            {
                debug!(%target, deployment_id, attempt, "target lease acquired");
                return Ok(self.guard(target.clone(), deployment_id.to_string()));
            }

            if started.elapsed() >= self.lock_wait {
                let holder = self
                    .store
                    .get_lease(target)?
                    .map(|l| l.deployment_id)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(DeploydError::TargetBusy(format!(
                    "{} is held by deployment {}",
                    target, holder
                )));
            }

            let remaining = self.lock_wait.saturating_sub(started.elapsed());
            tokio::time::sleep(retry_delay(attempt).min(remaining)).await;
            attempt += 1;
        }
    }

    fn guard(&self, target: TargetKey, deployment_id: String) -> LeaseGuard {
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat(
            self.store.clone(),
            target.clone(),
            deployment_id.clone(),
            self.ttl,
            lost.clone(),
        ));
        LeaseGuard {
            store: self.store.clone(),
            target,
            deployment_id,
            lost,
            heartbeat,
        }
    }
}

async fn heartbeat(
    store: StateStore,
    target: TargetKey,
    deployment_id: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (ttl / 3).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    // first tick fires immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        match store.renew_lease(&target, &deployment_id, ttl) {
            Ok(true) => {}
            Ok(false) => {
                warn!(%target, deployment_id, "target lease lost");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => error!(%target, deployment_id, "failed to renew lease: {}", e),
        }
    }
}

/// Held while a deployment runs. Dropping it stops the heartbeat and
/// releases the lease.
pub struct LeaseGuard {
    store: StateStore,
    target: TargetKey,
    deployment_id: String,
    lost: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl LeaseGuard {
    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    /// True once a renewal found the lease owned by someone else
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn ensure_held(&self) -> Result<(), DeploydError> {
        if self.is_lost() {
            return Err(DeploydError::Internal(format!(
                "lease on {} was lost",
                self.target
            )));
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        match self.store.release_lease(&self.target, &self.deployment_id) {
            Ok(true) => debug!(target = %self.target, deployment_id = %self.deployment_id, "target lease released"),
            Ok(false) => {}
            Err(e) => error!(target = %self.target, "failed to release lease: {}", e),
        }
    }
}
