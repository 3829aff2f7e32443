//! Repository registry: registration, sync, webhook info and analysis

use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use tracing::{info, warn};

use deploy_api::{
    CreateRepositoryRequest, RepositoryAccessResponse, SyncResponse, UpdateRepositoryRequest,
    WebhookInfoResponse,
};

use crate::credentials::cipher::CredentialCipher;
use crate::errors::DeploydError;
use crate::github::analysis::{analyze, fetch_manifests};
use crate::github::client::RepositoryHost;
use crate::github::webhook::generate_webhook_secret;
use crate::models::analysis::RepositoryAnalysis;
use crate::models::repository::{GitHubRepository, RepositoryCreated, RepositoryResponse, DEFAULT_BRANCH};
use crate::services::required;
use crate::store::StateStore;
use crate::utils::generate_uuid;

pub struct RepositoryService {
    store: StateStore,
    cipher: Arc<CredentialCipher>,
    host: Arc<dyn RepositoryHost>,
    /// `{base_url}{api_prefix}`
    public_api_url: String,
}

fn validate_full_name(full_name: &str) -> Result<String, DeploydError> {
    let full_name = full_name.trim().trim_end_matches(".git");
    let valid = match full_name.split_once('/') {
        Some((owner, name)) => {
            !owner.is_empty()
                && !name.is_empty()
                && full_name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c))
                && !name.contains('/')
        }
        None => false,
    };
    if !valid {
        return Err(DeploydError::ValidationError(format!(
            "full_name must look like owner/name: {}",
            full_name
        )));
    }
    Ok(full_name.to_string())
}

impl RepositoryService {
    pub fn new(
        store: StateStore,
        cipher: Arc<CredentialCipher>,
        host: Arc<dyn RepositoryHost>,
        public_api_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cipher,
            host,
            public_api_url: public_api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn repository(&self, project_id: &str, id: &str) -> Result<GitHubRepository, DeploydError> {
        self.store
            .get_repository(id)?
            .filter(|r| r.project_id == project_id)
            .ok_or_else(|| DeploydError::RepositoryNotFound(id.to_string()))
    }

    fn ensure_key(&self, project_id: &str, key_id: &str) -> Result<(), DeploydError> {
        self.store
            .get_ssh_key(key_id)?
            .filter(|k| k.project_id == project_id)
            .map(|_| ())
            .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", key_id)))
    }

    fn token(&self, repo: &GitHubRepository) -> Result<Option<SecretString>, DeploydError> {
        repo.encrypted_access_token
            .as_deref()
            .map(|sealed| self.cipher.open(sealed))
            .transpose()
    }

    pub fn webhook_url(&self, repo_id: &str) -> String {
        format!("{}/deploy/webhook/{}", self.public_api_url, repo_id)
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<RepositoryResponse>, DeploydError> {
        Ok(self
            .store
            .list_repositories(project_id)?
            .into_iter()
            .map(RepositoryResponse::from)
            .collect())
    }

    pub fn get(&self, project_id: &str, id: &str) -> Result<RepositoryResponse, DeploydError> {
        self.repository(project_id, id).map(RepositoryResponse::from)
    }

    /// Register a repository. The webhook secret is generated here and
    /// returned in this response only.
    pub fn create(&self, project_id: &str, request: CreateRepositoryRequest) -> Result<RepositoryCreated, DeploydError> {
        let full_name = validate_full_name(&request.full_name)?;
        if let Some(key_id) = request.ssh_key_id.as_deref().filter(|k| !k.is_empty()) {
            self.ensure_key(project_id, key_id)?;
        }
        if request.app_port == Some(0) {
            return Err(DeploydError::ValidationError("app_port must be between 1 and 65535".to_string()));
        }

        let webhook_secret = generate_webhook_secret();
        let now = Utc::now();
        let short_name = full_name.rsplit('/').next().unwrap_or(&full_name).to_string();
        let repo = GitHubRepository {
            id: generate_uuid(),
            project_id: project_id.to_string(),
            name: request.name.filter(|n| !n.trim().is_empty()).unwrap_or(short_name),
            clone_url: request
                .clone_url
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| format!("https://github.com/{}.git", full_name)),
            full_name,
            default_branch: request
                .default_branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            is_private: request.is_private,
            ssh_key_id: request.ssh_key_id.filter(|k| !k.is_empty()),
            encrypted_access_token: match request.access_token.as_deref().filter(|t| !t.is_empty()) {
                Some(token) => Some(self.cipher.seal(token)?),
                None => None,
            },
            encrypted_webhook_secret: self.cipher.seal(&webhook_secret)?,
            is_active: true,
            auto_deploy: request.auto_deploy,
            app_port: request.app_port,
            build_command: request.build_command,
            start_command: request.start_command,
            environment: request.environment,
            last_sync_at: None,
            last_commit_hash: None,
            cached_analysis: None,
            pending_update: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_repository(&repo)?;
        info!(repo_id = %repo.id, full_name = %repo.full_name, "repository registered");

        Ok(RepositoryCreated {
            webhook_url: self.webhook_url(&repo.id),
            webhook_secret,
            repository: repo.into(),
        })
    }

    pub fn update(&self, project_id: &str, id: &str, request: UpdateRepositoryRequest) -> Result<RepositoryResponse, DeploydError> {
        self.repository(project_id, id)?;
        if let Some(key_id) = request.ssh_key_id.as_deref().filter(|k| !k.is_empty()) {
            self.ensure_key(project_id, key_id)?;
        }
        let sealed_token = match request.access_token.as_deref() {
            Some("") => Some(None),
            Some(token) => Some(Some(self.cipher.seal(token)?)),
            None => None,
        };

        let updated = self.store.update_repository(id, |repo| {
            if let Some(name) = request.name {
                repo.name = required("name", &name)?;
            }
            if let Some(url) = request.clone_url {
                repo.clone_url = required("clone_url", &url)?;
            }
            if let Some(branch) = request.default_branch {
                repo.default_branch = required("default_branch", &branch)?;
            }
            if let Some(private) = request.is_private {
                repo.is_private = private;
            }
            if let Some(key_id) = request.ssh_key_id {
                repo.ssh_key_id = Some(key_id).filter(|k| !k.is_empty());
            }
            if let Some(token) = sealed_token {
                repo.encrypted_access_token = token;
            }
            if let Some(active) = request.is_active {
                repo.is_active = active;
            }
            if let Some(auto_deploy) = request.auto_deploy {
                repo.auto_deploy = auto_deploy;
            }
            if let Some(port) = request.app_port {
                if port == 0 {
                    return Err(DeploydError::ValidationError("app_port must be between 1 and 65535".to_string()));
                }
                repo.app_port = Some(port);
            }
            if let Some(build) = request.build_command {
                repo.build_command = Some(build).filter(|c| !c.trim().is_empty());
            }
            if let Some(start) = request.start_command {
                repo.start_command = Some(start).filter(|c| !c.trim().is_empty());
            }
            if let Some(environment) = request.environment {
                repo.environment = environment;
            }
            repo.updated_at = Utc::now();
            Ok(())
        })?;
        updated
            .map(RepositoryResponse::from)
            .ok_or_else(|| DeploydError::RepositoryNotFound(id.to_string()))
    }

    /// Refused while a deployment of the repository is running
    pub fn delete(&self, project_id: &str, id: &str) -> Result<(), DeploydError> {
        self.repository(project_id, id)?;
        let active = self.store.list_deployments(|d| {
            d.github_repository_id.as_deref() == Some(id) && d.status.is_active()
        })?;
        if !active.is_empty() {
            return Err(DeploydError::Conflict(format!(
                "Repository {} has {} deployment(s) in progress",
                id,
                active.len()
            )));
        }
        self.store.delete_repository(id)?;
        info!(repo_id = id, "repository deleted");
        Ok(())
    }

    /// Record the head of the default branch
    pub async fn sync(&self, project_id: &str, id: &str) -> Result<SyncResponse, DeploydError> {
        let repo = self.repository(project_id, id)?;
        let token = self.token(&repo)?;
        let head = self
            .host
            .branch_head(&repo.full_name, &repo.default_branch, token.as_ref())
            .await?;

        let synced_at = Utc::now();
        self.store.update_repository(id, |r| {
            r.last_commit_hash = Some(head.clone());
            r.last_sync_at = Some(synced_at);
            Ok(())
        })?;
        info!(repo_id = id, commit = %head, "repository synced");
        Ok(SyncResponse {
            success: true,
            branch: repo.default_branch,
            commit_hash: head,
            synced_at,
        })
    }

    pub fn webhook_info(&self, project_id: &str, id: &str) -> Result<WebhookInfoResponse, DeploydError> {
        let repo = self.repository(project_id, id)?;
        Ok(WebhookInfoResponse {
            webhook_url: self.webhook_url(&repo.id),
            repository_id: repo.id,
            content_type: "application/json".to_string(),
            events: vec!["push".to_string()],
            auto_deploy: repo.auto_deploy,
            branch: repo.default_branch,
            pending_update: repo.pending_update,
        })
    }

    /// Cached analysis, if one was run
    pub fn analysis(&self, project_id: &str, id: &str) -> Result<RepositoryAnalysis, DeploydError> {
        self.repository(project_id, id)?
            .cached_analysis
            .ok_or_else(|| DeploydError::NotFound(format!("Analysis of repository {}", id)))
    }

    /// Return the cached analysis or run one
    pub async fn analyze(&self, project_id: &str, id: &str) -> Result<RepositoryAnalysis, DeploydError> {
        let repo = self.repository(project_id, id)?;
        match repo.cached_analysis {
            Some(analysis) => Ok(analysis),
            None => self.run_analysis(repo).await,
        }
    }

    /// Always run a fresh analysis
    pub async fn reanalyze(&self, project_id: &str, id: &str) -> Result<RepositoryAnalysis, DeploydError> {
        let repo = self.repository(project_id, id)?;
        self.run_analysis(repo).await
    }

    async fn run_analysis(&self, repo: GitHubRepository) -> Result<RepositoryAnalysis, DeploydError> {
        let token = self.token(&repo)?;
        let manifests = fetch_manifests(self.host.as_ref(), &repo.full_name, &repo.default_branch, token.as_ref()).await?;
        let analysis = analyze(&manifests, repo.app_name(), &repo.default_branch);

        let cached = analysis.clone();
        self.store.update_repository(&repo.id, |r| {
            r.cached_analysis = Some(cached);
            r.updated_at = Utc::now();
            Ok(())
        })?;
        info!(
            repo_id = %repo.id,
            language = %analysis.language,
            options = analysis.install_options.len(),
            "repository analyzed"
        );
        Ok(analysis)
    }

    /// Check the repository is readable with the configured credentials
    pub async fn test_access(&self, project_id: &str, id: &str) -> Result<RepositoryAccessResponse, DeploydError> {
        let repo = self.repository(project_id, id)?;
        let token = self.token(&repo)?;
        match self.host.repository(&repo.full_name, token.as_ref()).await {
            Ok(remote) => Ok(RepositoryAccessResponse {
                accessible: true,
                message: format!("{} is accessible", remote.full_name),
                default_branch: Some(remote.default_branch),
                private: Some(remote.private),
            }),
            Err(e) => {
                warn!(repo_id = id, "repository access test failed: {}", e);
                Ok(RepositoryAccessResponse {
                    accessible: false,
                    message: e.to_string(),
                    default_branch: None,
                    private: None,
                })
            }
        }
    }
}
