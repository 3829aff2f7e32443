//! Web server registry, connection tests and key distribution

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use secrecy::SecretString;
use tracing::{info, warn};

use deploy_api::{
    ConnectionTestResponse, CreateWebServerRequest, DistributeKeyRequest, DistributeKeyResponse,
    UpdateWebServerRequest,
};

use crate::credentials::cipher::CredentialCipher;
use crate::deploy::commands;
use crate::deploy::remote::{resolve_target, RemoteCommand, ShellConnector, SshEndpoint};
use crate::errors::DeploydError;
use crate::models::web_server::{WebServer, WebServerStatus, DEFAULT_DEPLOY_ROOT, DEFAULT_SSH_PORT};
use crate::services::required;
use crate::store::StateStore;
use crate::utils::generate_uuid;

const TEST_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

pub struct WebServerService {
    store: StateStore,
    cipher: Arc<CredentialCipher>,
    connector: Arc<dyn ShellConnector>,
}

impl WebServerService {
    pub fn new(store: StateStore, cipher: Arc<CredentialCipher>, connector: Arc<dyn ShellConnector>) -> Self {
        Self {
            store,
            cipher,
            connector,
        }
    }

    fn server(&self, project_id: &str, id: &str) -> Result<WebServer, DeploydError> {
        self.store
            .get_web_server(id)?
            .filter(|s| s.project_id == project_id)
            .ok_or_else(|| DeploydError::TargetNotFound(id.to_string()))
    }

    fn ensure_key(&self, project_id: &str, key_id: &str) -> Result<(), DeploydError> {
        self.store
            .get_ssh_key(key_id)?
            .filter(|k| k.project_id == project_id)
            .map(|_| ())
            .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", key_id)))
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<WebServer>, DeploydError> {
        self.store.list_web_servers(project_id)
    }

    pub fn get(&self, project_id: &str, id: &str) -> Result<WebServer, DeploydError> {
        self.server(project_id, id)
    }

    pub fn create(&self, project_id: &str, request: CreateWebServerRequest) -> Result<WebServer, DeploydError> {
        let ssh_key_id = required("ssh_key_id", &request.ssh_key_id)?;
        self.ensure_key(project_id, &ssh_key_id)?;

        let now = Utc::now();
        let server = WebServer {
            id: generate_uuid(),
            project_id: project_id.to_string(),
            name: required("name", &request.name)?,
            description: request.description,
            host: required("host", &request.host)?,
            port: request.port.unwrap_or(DEFAULT_SSH_PORT),
            ssh_user: required("ssh_user", &request.ssh_user)?,
            ssh_key_id,
            deploy_path: request
                .deploy_path
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DEPLOY_ROOT.to_string()),
            status: WebServerStatus::Unknown,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        };
        validate(&server)?;
        self.store.put_web_server(&server)?;
        info!(server_id = %server.id, host = %server.host, "web server created");
        Ok(server)
    }

    pub fn update(&self, project_id: &str, id: &str, request: UpdateWebServerRequest) -> Result<WebServer, DeploydError> {
        self.server(project_id, id)?;
        if let Some(key_id) = request.ssh_key_id.as_deref() {
            self.ensure_key(project_id, key_id)?;
        }
        let updated = self.store.update_web_server(id, |server| {
            if let Some(name) = request.name {
                server.name = required("name", &name)?;
            }
            if let Some(description) = request.description {
                server.description = Some(description).filter(|d| !d.is_empty());
            }
            if let Some(host) = request.host {
                server.host = required("host", &host)?;
                server.status = WebServerStatus::Unknown;
            }
            if let Some(port) = request.port {
                server.port = port;
            }
            if let Some(user) = request.ssh_user {
                server.ssh_user = required("ssh_user", &user)?;
            }
            if let Some(key_id) = request.ssh_key_id {
                server.ssh_key_id = key_id;
            }
            if let Some(path) = request.deploy_path {
                server.deploy_path = path;
            }
            validate(server)?;
            server.updated_at = Utc::now();
            Ok(())
        })?;
        updated.ok_or_else(|| DeploydError::TargetNotFound(id.to_string()))
    }

    /// Refused while a pending or running deployment targets the server
    pub fn delete(&self, project_id: &str, id: &str) -> Result<(), DeploydError> {
        self.server(project_id, id)?;
        self.store.delete_web_server(id)?;
        info!(server_id = id, "web server deleted");
        Ok(())
    }

    /// Open a session, run a trivial command and record reachability
    pub async fn test_connection(&self, project_id: &str, id: &str) -> Result<ConnectionTestResponse, DeploydError> {
        let server = self.server(project_id, id)?;
        let target = resolve_target(&self.store, &self.cipher, &server, &server.ssh_key_id)?;

        let started = Instant::now();
        let outcome = async {
            let shell = self.connector.connect(&target).await?;
            let command = RemoteCommand::new("connection test", commands::echo_script(), TEST_COMMAND_TIMEOUT);
            let output = shell.exec(&command, None).await;
            if let Err(e) = shell.close().await {
                warn!(server_id = id, "failed to close ssh session: {}", e);
            }
            let output = output?;
            if output.success() {
                Ok(format!("Connected to {}", target.endpoint))
            } else {
                Err(DeploydError::SshConnectionError(format!(
                    "test command exited with {}",
                    output.exit_code
                )))
            }
        }
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, success, message) = match outcome {
            Ok(message) => (WebServerStatus::Reachable, true, message),
            Err(e) => (WebServerStatus::Unreachable, false, e.to_string()),
        };
        let checked_at = Utc::now();
        self.store.update_web_server(id, |server| {
            server.status = status;
            server.last_checked_at = Some(checked_at);
            Ok(())
        })?;
        info!(server_id = id, status = status.as_str(), latency_ms, "connection tested");

        Ok(ConnectionTestResponse {
            success,
            status: status.as_str().to_string(),
            message,
            latency_ms,
            checked_at,
        })
    }

    /// Install a public key on the server using a one-time password
    pub async fn distribute_key(
        &self,
        project_id: &str,
        id: &str,
        request: DistributeKeyRequest,
    ) -> Result<DistributeKeyResponse, DeploydError> {
        let server = self.server(project_id, id)?;
        if request.password.is_empty() {
            return Err(DeploydError::ValidationError("password is required".to_string()));
        }
        let key_id = request
            .ssh_key_id
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| server.ssh_key_id.clone());
        let key = self
            .store
            .get_ssh_key(&key_id)?
            .filter(|k| k.project_id == project_id)
            .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", key_id)))?;

        let endpoint = SshEndpoint {
            host: server.host.clone(),
            port: server.port,
            user: request
                .username
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| server.ssh_user.clone()),
        };
        let password = SecretString::from(request.password);
        self.connector
            .install_public_key(&endpoint, &password, &key.public_key)
            .await?;
        info!(server_id = id, key_id = %key.id, %endpoint, "public key distributed");

        Ok(DistributeKeyResponse {
            success: true,
            message: format!("Key {} installed for {}", key.name, endpoint),
            fingerprint: key.fingerprint,
        })
    }
}

fn validate(server: &WebServer) -> Result<(), DeploydError> {
    if server.port == 0 {
        return Err(DeploydError::ValidationError(
            "SSH port must be between 1 and 65535".to_string(),
        ));
    }
    if server.host.chars().any(|c| c.is_whitespace() || c == '@') || server.host.starts_with('-') {
        return Err(DeploydError::ValidationError(format!("Invalid host: {}", server.host)));
    }
    if server.ssh_user.chars().any(|c| c.is_whitespace() || c == '@') || server.ssh_user.starts_with('-') {
        return Err(DeploydError::ValidationError(format!("Invalid SSH user: {}", server.ssh_user)));
    }
    server.resolve_path(&server.deploy_path)?;
    Ok(())
}
