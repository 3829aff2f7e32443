//! Deployer worker: runs queued deployments
//!
//! Each deployment id received from the queue runs on its own task. Targets
//! are serialized by their leases, not here, so different targets proceed in
//! parallel. Deployments queued before a restart are picked up on start.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::deploy::executor::DeploymentExecutor;
use crate::store::StateStore;

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// How long in-flight deployments may run after shutdown is requested
    pub drain_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(20),
        }
    }
}

/// Deployment ids currently running, keyed by the task running them so a
/// panicked task can still be cleared
#[derive(Default)]
struct InFlight {
    ids: HashSet<String>,
    tasks: HashMap<Id, String>,
}

impl InFlight {
    /// False when the deployment is already running
    fn claim(&mut self, deployment_id: &str) -> bool {
        self.ids.insert(deployment_id.to_string())
    }

    fn bind(&mut self, task_id: Id, deployment_id: String) {
        self.tasks.insert(task_id, deployment_id);
    }

    fn release(&mut self, task_id: Id) -> Option<String> {
        let deployment_id = self.tasks.remove(&task_id)?;
        self.ids.remove(&deployment_id);
        Some(deployment_id)
    }
}

struct Dispatcher {
    executor: Arc<DeploymentExecutor>,
    running: JoinSet<()>,
    in_flight: InFlight,
}

impl Dispatcher {
    fn spawn(&mut self, deployment_id: String) {
        if !self.in_flight.claim(&deployment_id) {
            debug!(deployment_id, "deployment already running, ignoring duplicate");
            return;
        }
        let executor = self.executor.clone();
        let id = deployment_id.clone();
        let handle = self.running.spawn(async move {
            match executor.execute(&id).await {
                Ok(deployment) => {
                    info!(deployment_id = %id, status = %deployment.status, "deployment finished")
                }
                Err(e) => error!(deployment_id = %id, "deployment execution error: {}", e),
            }
        });
        self.in_flight.bind(handle.id(), deployment_id);
    }

    fn reap(&mut self, joined: Result<(Id, ()), JoinError>) {
        match joined {
            Ok((task_id, ())) => {
                self.in_flight.release(task_id);
            }
            Err(e) => {
                let deployment_id = self.in_flight.release(e.id());
                error!(?deployment_id, "deployment task panicked: {}", e);
            }
        }
    }
}

/// Run the deployer worker until shutdown or until the queue closes
pub async fn run(
    options: &Options,
    executor: Arc<DeploymentExecutor>,
    store: StateStore,
    mut queue_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Deployer worker starting...");

    let mut dispatcher = Dispatcher {
        executor,
        running: JoinSet::new(),
        in_flight: InFlight::default(),
    };

    match store.queued_deployments() {
        Ok(queued) => {
            if !queued.is_empty() {
                info!("Resuming {} queued deployment(s)", queued.len());
            }
            for deployment in queued {
                dispatcher.spawn(deployment.id);
            }
        }
        Err(e) => error!("Failed to load queued deployments: {}", e),
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker shutting down...");
                break;
            }
            received = queue_rx.recv() => match received {
                Some(deployment_id) => dispatcher.spawn(deployment_id),
                None => {
                    info!("Deploy queue closed");
                    break;
                }
            },
            Some(joined) = dispatcher.running.join_next_with_id(), if !dispatcher.running.is_empty() => {
                dispatcher.reap(joined);
            }
        }
    }

    drain(options.drain_timeout, &mut dispatcher).await;
}

/// Let in-flight deployments finish, then abort what is left.
///
/// Aborted deployments release their leases on drop and are failed by the
/// lease sweeper.
async fn drain(timeout: Duration, dispatcher: &mut Dispatcher) {
    if dispatcher.running.is_empty() {
        return;
    }
    info!(
        "Waiting up to {:?} for {} deployment(s) to finish",
        timeout,
        dispatcher.running.len()
    );
    let finished = tokio::time::timeout(timeout, async {
        while let Some(joined) = dispatcher.running.join_next_with_id().await {
            dispatcher.reap(joined);
        }
    })
    .await;
    if finished.is_err() {
        warn!(
            "Aborting {} deployment(s) still running after {:?}",
            dispatcher.running.len(),
            timeout
        );
        dispatcher.running.shutdown().await;
    }
}
