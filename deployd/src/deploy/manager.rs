//! Deployment operations exposed to callers
//!
//! Creation validates every reference against the caller's project. Running
//! is always asynchronous: operations enqueue and return.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use deploy_api::{
    CreateDeploymentRequest, DeployPendingRequest, DeploymentListQuery, PortCheckRequest,
    PortCheckResponse,
};

use crate::credentials::cipher::CredentialCipher;
use crate::deploy::fsm::DeploymentStatus;
use crate::deploy::port_guard;
use crate::deploy::queue::DeployQueue;
use crate::deploy::remote::{resolve_target, ShellConnector};
use crate::errors::DeploydError;
use crate::models::analysis::InstallOption;
use crate::models::deployment::{Deployment, DeploymentFailure, LogPage, TriggerSource};
use crate::models::repository::{GitHubRepository, DEFAULT_BRANCH};
use crate::models::web_server::WebServer;
use crate::store::StateStore;
use crate::utils::generate_uuid;

pub const DEFAULT_LOG_PAGE: usize = 500;
pub const MAX_LOG_PAGE: usize = 5_000;

/// Status snapshot of one deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatusReport {
    pub id: String,
    pub status: DeploymentStatus,
    pub failure: Option<DeploymentFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Deployment> for DeploymentStatusReport {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id.clone(),
            status: d.status,
            failure: d.failure.clone(),
            created_at: d.created_at,
            started_at: d.started_at,
            completed_at: d.completed_at,
        }
    }
}

fn is_commit_hash(value: &str) -> bool {
    (4..=40).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct DeploymentManager {
    store: StateStore,
    cipher: Arc<CredentialCipher>,
    connector: Arc<dyn ShellConnector>,
    queue: DeployQueue,
}

impl DeploymentManager {
    pub fn new(
        store: StateStore,
        cipher: Arc<CredentialCipher>,
        connector: Arc<dyn ShellConnector>,
        queue: DeployQueue,
    ) -> Self {
        Self {
            store,
            cipher,
            connector,
            queue,
        }
    }

    // ── lookups scoped to the caller's project ─────────────────────

    fn web_server(&self, project_id: &str, id: &str) -> Result<WebServer, DeploydError> {
        self.store
            .get_web_server(id)?
            .filter(|s| s.project_id == project_id)
            .ok_or_else(|| DeploydError::TargetNotFound(id.to_string()))
    }

    fn repository(&self, project_id: &str, id: &str) -> Result<GitHubRepository, DeploydError> {
        self.store
            .get_repository(id)?
            .filter(|r| r.project_id == project_id && r.is_active)
            .ok_or_else(|| DeploydError::RepositoryNotFound(id.to_string()))
    }

    fn ssh_key_exists(&self, project_id: &str, id: &str) -> Result<(), DeploydError> {
        self.store
            .get_ssh_key(id)?
            .filter(|k| k.project_id == project_id)
            .map(|_| ())
            .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", id)))
    }

    fn deployment(&self, project_id: &str, id: &str) -> Result<Deployment, DeploydError> {
        self.store
            .get_deployment(id)?
            .filter(|d| d.project_id == project_id)
            .ok_or_else(|| DeploydError::NotFound(format!("Deployment {}", id)))
    }

    // ── create ─────────────────────────────────────────────────────

    /// Validate and store a pending deployment. It runs once executed.
    pub fn create(&self, project_id: &str, request: CreateDeploymentRequest) -> Result<Deployment, DeploydError> {
        let deployment = self.build(project_id, request, TriggerSource::Manual, None)?;
        self.store.insert_deployment(&deployment)?;
        info!(deployment_id = %deployment.id, target = %deployment.target(), "deployment created");
        Ok(deployment)
    }

    fn build(
        &self,
        project_id: &str,
        request: CreateDeploymentRequest,
        triggered_by: TriggerSource,
        predecessor_id: Option<String>,
    ) -> Result<Deployment, DeploydError> {
        let server = self.web_server(project_id, &request.web_server_id)?;

        let ssh_key_id = request
            .ssh_key_id
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| server.ssh_key_id.clone());
        self.ssh_key_exists(project_id, &ssh_key_id)?;

        let repository = match request.github_repository_id.as_deref().filter(|r| !r.is_empty()) {
            Some(repo_id) => Some(self.repository(project_id, repo_id)?),
            None => None,
        };

        let branch = request
            .branch
            .filter(|b| !b.trim().is_empty())
            .or_else(|| repository.as_ref().map(|r| r.default_branch.clone()))
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());

        let commit_hash = request.commit_hash.unwrap_or_default().trim().to_string();
        if !commit_hash.is_empty() && !is_commit_hash(&commit_hash) {
            return Err(DeploydError::ValidationError(format!(
                "Invalid commit hash: {}",
                commit_hash
            )));
        }

        let mut install_option = Self::install_option(
            repository.as_ref(),
            request.install_option,
            request.install_option_name.as_deref(),
        )?;
        if install_option.start_command.trim().is_empty() {
            return Err(DeploydError::ValidationError(
                "Install option has no start command".to_string(),
            ));
        }
        install_option.environment.extend(request.environment);

        let port = request.port.or(install_option.port);
        if port == Some(0) {
            return Err(DeploydError::ValidationError(
                "Port must be between 1 and 65535".to_string(),
            ));
        }

        let deployment_path = match request.deployment_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => server.resolve_path(path)?,
            None => match &repository {
                Some(repo) => server.default_deployment_path(repo.app_name())?,
                None => {
                    return Err(DeploydError::ValidationError(
                        "deployment_path is required without a repository".to_string(),
                    ))
                }
            },
        };

        Ok(Deployment {
            id: generate_uuid(),
            project_id: project_id.to_string(),
            github_repository_id: repository.map(|r| r.id),
            web_server_id: server.id,
            ssh_key_id,
            branch,
            commit_hash,
            install_option,
            port,
            deployment_path,
            status: DeploymentStatus::Pending,
            failure: None,
            triggered_by,
            predecessor_id,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
        })
    }

    /// Explicit option, then a named analysis option, then the recommended
    /// one, then the repository's configured commands
    fn install_option(
        repository: Option<&GitHubRepository>,
        explicit: Option<InstallOption>,
        name: Option<&str>,
    ) -> Result<InstallOption, DeploydError> {
        if let Some(option) = explicit {
            return Ok(option);
        }
        let analysis = repository.and_then(|r| r.cached_analysis.as_ref());
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            return analysis
                .and_then(|a| a.option_named(name))
                .cloned()
                .or_else(|| {
                    repository
                        .and_then(|r| r.configured_install_option())
                        .filter(|o| o.name == name)
                })
                .ok_or_else(|| DeploydError::ValidationError(format!("Unknown install option: {}", name)));
        }
        analysis
            .and_then(|a| a.recommended_option())
            .cloned()
            .or_else(|| repository.and_then(|r| r.configured_install_option()))
            .ok_or_else(|| {
                DeploydError::ValidationError(
                    "No install option given and none could be derived from the repository".to_string(),
                )
            })
    }

    /// Copy `template` into a new pending deployment. The references it
    /// carries are checked again since they may have been deleted since.
    fn successor_of(&self, template: &Deployment, triggered_by: TriggerSource) -> Result<Deployment, DeploydError> {
        let project_id = template.project_id.as_str();
        self.web_server(project_id, &template.web_server_id)?;
        self.ssh_key_exists(project_id, &template.ssh_key_id)?;
        if let Some(repo_id) = &template.github_repository_id {
            self.repository(project_id, repo_id)?;
        }
        Ok(template.successor(generate_uuid(), triggered_by))
    }

    /// Copy `template` for a new commit and run it
    pub fn redeploy_from(
        &self,
        template: &Deployment,
        commit_hash: &str,
        branch: &str,
        triggered_by: TriggerSource,
    ) -> Result<Deployment, DeploydError> {
        let mut deployment = self.successor_of(template, triggered_by)?;
        deployment.commit_hash = commit_hash.to_string();
        deployment.branch = branch.to_string();
        self.store.insert_deployment(&deployment)?;
        self.enqueue(&deployment.id)
    }

    fn enqueue(&self, deployment_id: &str) -> Result<Deployment, DeploydError> {
        let deployment = self.store.mark_deployment_queued(deployment_id)?;
        self.queue.enqueue(deployment_id)?;
        Ok(deployment)
    }

    // ── queries ────────────────────────────────────────────────────

    pub fn list(&self, project_id: &str, query: &DeploymentListQuery) -> Result<Vec<Deployment>, DeploydError> {
        let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse::<DeploymentStatus>()?),
            None => None,
        };
        self.store.list_deployments(|d| {
            d.project_id == project_id
                && query
                    .repository_id
                    .as_deref()
                    .is_none_or(|r| d.github_repository_id.as_deref() == Some(r))
                && status.is_none_or(|s| d.status == s)
        })
    }

    pub fn get(&self, project_id: &str, id: &str) -> Result<Deployment, DeploydError> {
        self.deployment(project_id, id)
    }

    pub fn status(&self, project_id: &str, id: &str) -> Result<DeploymentStatusReport, DeploydError> {
        Ok(DeploymentStatusReport::from(&self.deployment(project_id, id)?))
    }

    /// Page of log lines after `after`
    pub fn logs(
        &self,
        project_id: &str,
        id: &str,
        after: Option<u64>,
        limit: Option<usize>,
    ) -> Result<LogPage, DeploydError> {
        // status first: a terminal deployment's log can no longer grow
        let deployment = self.deployment(project_id, id)?;
        let after = after.unwrap_or(0);
        let limit = limit.unwrap_or(DEFAULT_LOG_PAGE).clamp(1, MAX_LOG_PAGE);
        let lines = self.store.read_logs(id, after, limit)?;
        let next_cursor = lines.last().map(|l| l.seq).unwrap_or(after);
        Ok(LogPage {
            deployment_id: id.to_string(),
            complete: deployment.status.is_terminal() && lines.len() < limit,
            next_cursor,
            status: deployment.status,
            lines,
        })
    }

    // ── lifecycle ──────────────────────────────────────────────────

    /// Run a pending deployment, or re-run a finished one as a successor
    pub fn execute(&self, project_id: &str, id: &str) -> Result<Deployment, DeploydError> {
        let deployment = self.deployment(project_id, id)?;
        match deployment.status {
            DeploymentStatus::Pending => self.enqueue(id),
            status if status.is_terminal() => {
                let successor = self.successor_of(&deployment, TriggerSource::Redeploy)?;
                self.store.insert_deployment(&successor)?;
                info!(deployment_id = %successor.id, predecessor = %id, "redeploy created");
                self.enqueue(&successor.id)
            }
            status => Err(DeploydError::Conflict(format!(
                "Deployment {} is already {}",
                id, status
            ))),
        }
    }

    /// Delete a deployment that is not running. Deleting a pending one cancels it.
    pub fn delete(&self, project_id: &str, id: &str) -> Result<Deployment, DeploydError> {
        let deleted = self.store.delete_deployment_if(id, |d| {
            if d.project_id != project_id {
                return Err(DeploydError::NotFound(format!("Deployment {}", id)));
            }
            if d.status.is_active() {
                return Err(DeploydError::Conflict(format!(
                    "Deployment {} is {} and cannot be deleted",
                    id, d.status
                )));
            }
            Ok(())
        })?;
        info!(deployment_id = id, status = %deleted.status, "deployment deleted");
        Ok(deleted)
    }

    /// Consume the repository's pending-update marker into one deployment
    pub fn deploy_pending(
        &self,
        project_id: &str,
        repo_id: &str,
        request: DeployPendingRequest,
    ) -> Result<Deployment, DeploydError> {
        let repo = self.repository(project_id, repo_id)?;
        let template = self.store.latest_deployment_for_repository(repo_id)?;
        let web_server_id = request
            .web_server_id
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| template.as_ref().map(|t| t.web_server_id.clone()))
            .ok_or_else(|| {
                DeploydError::ValidationError(
                    "No previous deployment to copy; web_server_id is required".to_string(),
                )
            })?;

        let marker = self
            .store
            .take_pending_update(repo_id)?
            .ok_or_else(|| DeploydError::Conflict(format!("Repository {} has no pending update", repo.id)))?;

        let same_server = template.as_ref().is_some_and(|t| t.web_server_id == web_server_id);
        let create = CreateDeploymentRequest {
            github_repository_id: Some(repo_id.to_string()),
            ssh_key_id: template.as_ref().filter(|_| same_server).map(|t| t.ssh_key_id.clone()),
            web_server_id,
            branch: Some(marker.branch.clone()),
            commit_hash: Some(marker.commit_hash.clone()),
            install_option: template.as_ref().map(|t| t.install_option.clone()),
            install_option_name: None,
            port: template.as_ref().and_then(|t| t.port),
            deployment_path: request
                .deployment_path
                .clone()
                .or_else(|| template.as_ref().filter(|_| same_server).map(|t| t.deployment_path.clone())),
            environment: Default::default(),
        };

        let created = self
            .build(project_id, create, TriggerSource::PendingUpdate, template.map(|t| t.id))
            .and_then(|deployment| {
                self.store.insert_deployment(&deployment)?;
                self.enqueue(&deployment.id)
            });
        if created.is_err() {
            // put the marker back unless a newer push replaced it meanwhile
            let restored = self.store.update_repository(repo_id, |r| {
                r.pending_update.get_or_insert(marker);
                Ok(())
            });
            if let Err(e) = restored {
                warn!(repo_id, "failed to restore pending update: {}", e);
            }
        }
        created
    }

    /// Port Guard pre-flight over a short-lived session
    pub async fn check_port(&self, project_id: &str, request: &PortCheckRequest) -> Result<PortCheckResponse, DeploydError> {
        let server = self.web_server(project_id, &request.web_server_id)?;
        let path = match request.deployment_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => Some(server.resolve_path(path)?),
            None => None,
        };
        let target = resolve_target(&self.store, &self.cipher, &server, &server.ssh_key_id)?;
        let shell = self.connector.connect(&target).await?;
        let result = port_guard::check_port(shell.as_ref(), request.port, path.as_deref()).await;
        if let Err(e) = shell.close().await {
            warn!(server_id = %server.id, "failed to close ssh session: {}", e);
        }
        result
    }
}
