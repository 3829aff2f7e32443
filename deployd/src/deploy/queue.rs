//! In-process queue of deployment ids waiting for the dispatcher

use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::DeploydError;

/// Sending half handed to everything that creates deployments
#[derive(Debug, Clone)]
pub struct DeployQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl DeployQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, deployment_id: &str) -> Result<(), DeploydError> {
        debug!(deployment_id, "enqueueing deployment");
        self.tx
            .send(deployment_id.to_string())
            .map_err(|_| DeploydError::ShutdownError("deploy queue is closed".to_string()))
    }
}
