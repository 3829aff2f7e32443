//! Finite state machine for the deployment lifecycle
//!
//! `pending -> building -> deploying -> deployed`, with `failed` reachable
//! from every non-terminal state. Terminal states accept no further events.

use serde::{Deserialize, Serialize};

use crate::errors::DeploydError;
use crate::models::deployment::DeploymentFailure;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Created, waiting for the executor
    Pending,

    /// Target lease held, fetching and building code
    Building,

    /// Build finished, starting the service
    Deploying,

    /// Service started (and listening, when a port is configured)
    Deployed,

    /// Aborted; see the deployment's failure and log
    Failed,
}

impl DeploymentStatus {
    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Deployed | DeploymentStatus::Failed)
    }

    /// Active deployments hold their target exclusively
    pub fn is_active(&self) -> bool {
        matches!(self, DeploymentStatus::Building | DeploymentStatus::Deploying)
    }

    /// Position in the lifecycle order; both terminal states share the top rank
    pub fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::Pending => 0,
            DeploymentStatus::Building => 1,
            DeploymentStatus::Deploying => 2,
            DeploymentStatus::Deployed | DeploymentStatus::Failed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// Compute the state an event leads to.
    ///
    /// Anything not listed is an `InternalStateError`: the caller attempted a
    /// transition the lifecycle forbids.
    pub fn next(&self, event: &DeploymentEvent) -> Result<DeploymentStatus, DeploydError> {
        let next = match (self, event) {
            (DeploymentStatus::Pending, DeploymentEvent::Start) => DeploymentStatus::Building,
            (DeploymentStatus::Building, DeploymentEvent::BuildSucceeded) => {
                DeploymentStatus::Deploying
            }
            (DeploymentStatus::Deploying, DeploymentEvent::Activated) => {
                DeploymentStatus::Deployed
            }
            (state, DeploymentEvent::Fail(_)) if !state.is_terminal() => DeploymentStatus::Failed,

            // Invalid transitions
            (state, event) => {
                return Err(DeploydError::InternalStateError(format!(
                    "{} does not accept {}",
                    state.as_str(),
                    event.name()
                )));
            }
        };
        Ok(next)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = DeploydError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeploymentStatus::Pending),
            "building" => Ok(DeploymentStatus::Building),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "deployed" => Ok(DeploymentStatus::Deployed),
            "failed" => Ok(DeploymentStatus::Failed),
            _ => Err(DeploydError::ValidationError(format!(
                "Invalid deployment status: {}",
                s
            ))),
        }
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Executor acquired the target lease
    Start,

    /// Fetch and build exited 0
    BuildSucceeded,

    /// Start command exited 0 and the service came up
    Activated,

    /// Any step failed
    Fail(DeploymentFailure),
}

impl DeploymentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentEvent::Start => "start",
            DeploymentEvent::BuildSucceeded => "build_succeeded",
            DeploymentEvent::Activated => "activated",
            DeploymentEvent::Fail(_) => "fail",
        }
    }
}
