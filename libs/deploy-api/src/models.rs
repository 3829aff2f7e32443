//! API models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ================================= GENERIC ===================================== //

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned for every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Collection envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

/// Plain acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ================================= SSH KEYS ===================================== //

/// Create an SSH key. Without `private_key` an ed25519 pair is generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// OpenSSH private key to import
    #[serde(default)]
    pub private_key: Option<String>,
    /// OpenSSH public key line, required when importing
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSshKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// =============================== WEB SERVERS ==================================== //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebServerRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub ssh_user: String,
    pub ssh_key_id: String,
    /// Root directory deployments default to
    #[serde(default)]
    pub deploy_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWebServerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    #[serde(default)]
    pub deploy_path: Option<String>,
}

/// Result of a connection test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTestResponse {
    pub success: bool,
    pub status: String,
    pub message: String,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Push a public key using one-time password authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeKeyRequest {
    pub password: String,
    /// Key to distribute, defaults to the server's key
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    /// Login user, defaults to the server's user
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeKeyResponse {
    pub success: bool,
    pub message: String,
    pub fingerprint: String,
}

// =============================== REPOSITORIES =================================== //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRepositoryRequest {
    /// `owner/name`
    pub full_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub auto_deploy: bool,
    #[serde(default)]
    pub app_port: Option<u16>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRepositoryRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    /// `Some("")` detaches the key
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    /// `Some("")` removes the token
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub auto_deploy: Option<bool>,
    #[serde(default)]
    pub app_port: Option<u16>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub environment: Option<BTreeMap<String, String>>,
}

/// A push that arrived while auto-deploy was off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub commit_hash: String,
    pub branch: String,
    pub pusher: String,
    #[serde(default)]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Everything needed to configure the GitHub webhook, minus the secret
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookInfoResponse {
    pub repository_id: String,
    pub webhook_url: String,
    pub content_type: String,
    pub events: Vec<String>,
    pub auto_deploy: bool,
    pub branch: String,
    pub pending_update: Option<PendingUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub branch: String,
    pub commit_hash: String,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryAccessResponse {
    pub accessible: bool,
    pub message: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub private: Option<bool>,
}

// =============================== DEPLOYMENTS ==================================== //

/// A build/start command pair with its port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub build_command: String,
    pub start_command: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub is_recommended: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    #[serde(default)]
    pub github_repository_id: Option<String>,
    pub web_server_id: String,
    /// Defaults to the web server's key
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    /// Defaults to the repository's branch
    #[serde(default)]
    pub branch: Option<String>,
    /// Empty deploys the branch head
    #[serde(default)]
    pub commit_hash: Option<String>,
    /// Explicit install option
    #[serde(default)]
    pub install_option: Option<InstallOption>,
    /// Pick an option from the repository analysis by name
    #[serde(default)]
    pub install_option_name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub deployment_path: Option<String>,
    /// Extra variables merged over the install option's environment
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Overrides for deploying a pending update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployPendingRequest {
    #[serde(default)]
    pub web_server_id: Option<String>,
    #[serde(default)]
    pub deployment_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortCheckRequest {
    pub web_server_id: String,
    pub port: u16,
    /// Directory of the service being redeployed, if any
    #[serde(default)]
    pub deployment_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCheckResponse {
    pub port: u16,
    pub available: bool,
    pub occupying_process: Option<String>,
    pub owned_by_target: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentListQuery {
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
    /// Return lines with a cursor greater than this
    #[serde(default)]
    pub after: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ================================= WEBHOOK ====================================== //

/// Webhook acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// `pong`, `ignored`, `deployment_created` or `pending_update_recorded`
    pub result: String,
    pub message: String,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
}
