//! Deployment attempt and its log stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::DeploydError;
use crate::models::analysis::InstallOption;
use crate::models::lease::TargetKey;

/// What created the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Webhook,
    PendingUpdate,
    Redeploy,
}

/// Why a deployment failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TargetBusy,
    SshConnection,
    PortConflict,
    BuildFailure,
    ActivationFailure,
    LeaseExpired,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl DeploymentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            command: None,
            exit_code: None,
        }
    }

    /// Classify an execution error
    pub fn from_error(err: &DeploydError) -> Self {
        match err {
            DeploydError::TargetBusy(_) => Self::new(FailureKind::TargetBusy, err.to_string()),
            DeploydError::SshConnectionError(_) => {
                Self::new(FailureKind::SshConnection, err.to_string())
            }
            DeploydError::PortConflict { .. } => {
                Self::new(FailureKind::PortConflict, err.to_string())
            }
            DeploydError::BuildFailureError { command, exit_code } => Self {
                kind: FailureKind::BuildFailure,
                message: err.to_string(),
                command: Some(command.clone()),
                exit_code: Some(*exit_code),
            },
            DeploydError::ActivationFailureError { command, exit_code } => Self {
                kind: FailureKind::ActivationFailure,
                message: err.to_string(),
                command: Some(command.clone()),
                exit_code: Some(*exit_code),
            },
            _ => Self::new(FailureKind::Internal, err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub github_repository_id: Option<String>,
    pub web_server_id: String,
    pub ssh_key_id: String,
    pub branch: String,
    /// Empty means the head of `branch` at fetch time
    pub commit_hash: String,
    pub install_option: InstallOption,
    #[serde(default)]
    pub port: Option<u16>,
    /// Normalized absolute path on the target
    pub deployment_path: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub failure: Option<DeploymentFailure>,
    pub triggered_by: TriggerSource,
    /// Deployment this one re-runs, when created by execute on a finished one
    #[serde(default)]
    pub predecessor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once handed to the dispatcher; pending deployments without it
    /// wait for an explicit execute
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn target(&self) -> TargetKey {
        TargetKey::new(&self.web_server_id, &self.deployment_path)
    }

    /// Clone the parameters into a fresh pending deployment
    pub fn successor(&self, id: String, triggered_by: TriggerSource) -> Deployment {
        Deployment {
            id,
            status: DeploymentStatus::Pending,
            failure: None,
            triggered_by,
            predecessor_id: Some(self.id.clone()),
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            ..self.clone()
        }
    }
}

/// Which stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// One entry of a deployment's append-only log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic per-deployment cursor, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

/// A page of log lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub deployment_id: String,
    pub lines: Vec<LogLine>,
    /// Pass back as `after` to continue
    pub next_cursor: u64,
    pub status: DeploymentStatus,
    /// The deployment is terminal and every line has been returned
    pub complete: bool,
}
