//! Server state

use std::sync::Arc;

use tokio::sync::watch;

use crate::authn::caller_token::TokenVerifier;
use crate::deploy::manager::DeploymentManager;
use crate::github::webhook::WebhookGateway;
use crate::services::repositories::RepositoryService;
use crate::services::ssh_keys::SshKeyService;
use crate::services::web_servers::WebServerService;

/// Server state shared across handlers
pub struct ServerState {
    pub verifier: Arc<TokenVerifier>,
    pub ssh_keys: Arc<SshKeyService>,
    pub web_servers: Arc<WebServerService>,
    pub repositories: Arc<RepositoryService>,
    pub deployments: Arc<DeploymentManager>,
    pub webhooks: Arc<WebhookGateway>,
    /// Flips to true once shutdown starts; long-lived streams end on it
    pub stopping: watch::Receiver<bool>,
}

impl ServerState {
    pub fn new(
        verifier: Arc<TokenVerifier>,
        ssh_keys: Arc<SshKeyService>,
        web_servers: Arc<WebServerService>,
        repositories: Arc<RepositoryService>,
        deployments: Arc<DeploymentManager>,
        webhooks: Arc<WebhookGateway>,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            verifier,
            ssh_keys,
            web_servers,
            repositories,
            deployments,
            webhooks,
            stopping,
        }
    }
}
