//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::app::options::AppOptions;
use crate::authn::caller_token::TokenVerifier;
use crate::credentials::cipher::CredentialCipher;
use crate::deploy::executor::DeploymentExecutor;
use crate::deploy::lease::LeaseManager;
use crate::deploy::manager::DeploymentManager;
use crate::deploy::queue::DeployQueue;
use crate::deploy::remote::{ShellConnector, SshConnector};
use crate::errors::DeploydError;
use crate::github::client::{GitHubClient, RepositoryHost};
use crate::github::webhook::WebhookGateway;
use crate::server::state::ServerState;
use crate::services::repositories::RepositoryService;
use crate::services::ssh_keys::SshKeyService;
use crate::services::web_servers::WebServerService;
use crate::store::StateStore;
use crate::utils::generate_uuid;

/// Main application state
pub struct AppState {
    pub store: StateStore,
    pub verifier: Arc<TokenVerifier>,
    pub ssh_keys: Arc<SshKeyService>,
    pub web_servers: Arc<WebServerService>,
    pub repositories: Arc<RepositoryService>,
    pub deployments: Arc<DeploymentManager>,
    pub webhooks: Arc<WebhookGateway>,
    pub executor: Arc<DeploymentExecutor>,
}

impl AppState {
    /// Open the data directory and wire the production collaborators
    pub async fn init(options: &AppOptions) -> Result<(Self, mpsc::UnboundedReceiver<String>), DeploydError> {
        info!("Initializing application state...");

        options.layout.setup().await?;
        let store = StateStore::open(options.layout.database_file().path())?;
        let connector = Arc::new(SshConnector::new(&options.executor, &options.layout));
        let host = Arc::new(GitHubClient::new(&options.github)?);

        Self::assemble(options, store, connector, host)
    }

    /// Wire services over the given store and remote collaborators
    pub fn assemble(
        options: &AppOptions,
        store: StateStore,
        connector: Arc<dyn ShellConnector>,
        host: Arc<dyn RepositoryHost>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), DeploydError> {
        let cipher = Arc::new(CredentialCipher::from_passphrase(&options.master_key)?);
        let (queue, queue_rx) = DeployQueue::new();

        let leases = LeaseManager::new(
            store.clone(),
            format!("deployd-{}", generate_uuid()),
            Duration::from_secs(options.executor.lease_ttl_secs),
            Duration::from_secs(options.executor.lock_wait_secs),
        );
        info!(holder = leases.holder(), "lease holder registered");

        let executor = Arc::new(DeploymentExecutor::new(
            store.clone(),
            cipher.clone(),
            connector.clone(),
            leases,
            &options.executor,
        ));
        let deployments = Arc::new(DeploymentManager::new(
            store.clone(),
            cipher.clone(),
            connector.clone(),
            queue,
        ));
        let webhooks = Arc::new(WebhookGateway::new(store.clone(), cipher.clone(), deployments.clone()));

        let state = Self {
            verifier: Arc::new(TokenVerifier::new(&options.jwt_secret)),
            ssh_keys: Arc::new(SshKeyService::new(store.clone(), cipher.clone())),
            web_servers: Arc::new(WebServerService::new(store.clone(), cipher.clone(), connector)),
            repositories: Arc::new(RepositoryService::new(
                store.clone(),
                cipher,
                host,
                options.server.public_api_url(),
            )),
            deployments,
            webhooks,
            executor,
            store,
        };
        Ok((state, queue_rx))
    }

    /// State handed to the HTTP handlers
    pub fn server_state(&self, stopping: watch::Receiver<bool>) -> ServerState {
        ServerState::new(
            self.verifier.clone(),
            self.ssh_keys.clone(),
            self.web_servers.clone(),
            self.repositories.clone(),
            self.deployments.clone(),
            self.webhooks.clone(),
            stopping,
        )
    }
}
