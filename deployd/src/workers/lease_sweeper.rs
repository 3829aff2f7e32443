//! Lease sweeper worker
//!
//! Reclaims expired target leases and fails active deployments whose lease
//! is gone, e.g. after a crash mid-deployment.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::DeploymentEvent;
use crate::errors::DeploydError;
use crate::models::deployment::{DeploymentFailure, FailureKind, LogStream};
use crate::store::StateStore;

/// Lease sweeper options
#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// What one sweep reclaimed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_leases: usize,
    pub failed_deployments: Vec<String>,
}

/// One sweep pass
pub fn sweep(store: &StateStore, now: DateTime<Utc>) -> Result<SweepReport, DeploydError> {
    let expired = store.remove_expired_leases(now)?;
    for lease in &expired {
        warn!(
            target = %lease.target,
            deployment_id = %lease.deployment_id,
            holder = %lease.holder,
            "reclaimed expired lease"
        );
    }

    let mut failed = Vec::new();
    for deployment in store.list_deployments(|d| d.status.is_active())? {
        let held = store
            .get_lease(&deployment.target())?
            .is_some_and(|lease| lease.deployment_id == deployment.id && !lease.is_expired(now));
        if held {
            continue;
        }

        let message = "target lease lost; the executor stopped before finishing";
        if let Err(e) = store.append_log(&deployment.id, LogStream::System, format!("deployment failed: {}", message)) {
            debug!(deployment_id = %deployment.id, "could not append sweep log line: {}", e);
        }
        let failure = DeploymentFailure::new(FailureKind::LeaseExpired, message);
        match store.apply_deployment_event(&deployment.id, DeploymentEvent::Fail(failure)) {
            Ok(_) => {
                warn!(deployment_id = %deployment.id, "failed deployment with no live lease");
                failed.push(deployment.id);
            }
            // Finished on its own between the listing and now
            Err(DeploydError::InternalStateError(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(SweepReport {
        expired_leases: expired.len(),
        failed_deployments: failed,
    })
}

/// Run the lease sweeper worker
pub async fn run<S, F>(
    options: &Options,
    store: &StateStore,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Lease sweeper starting...");

    loop {
        match sweep(store, Utc::now()) {
            Ok(report) if report != SweepReport::default() => info!(
                expired_leases = report.expired_leases,
                failed = report.failed_deployments.len(),
                "lease sweep reclaimed resources"
            ),
            Ok(_) => debug!("lease sweep: nothing to reclaim"),
            Err(e) => error!("Lease sweep failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Lease sweeper shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
