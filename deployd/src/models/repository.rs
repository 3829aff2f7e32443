//! Registered GitHub repository

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::analysis::{InstallOption, RepositoryAnalysis};

pub use deploy_api::PendingUpdate;

pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubRepository {
    pub id: String,
    pub project_id: String,
    pub name: String,
    /// `owner/name`
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    #[serde(default)]
    pub is_private: bool,
    /// Deploy key used to clone private repositories on the target
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    /// Encrypted GitHub token (base64 of nonce || ciphertext)
    #[serde(default)]
    pub encrypted_access_token: Option<String>,
    /// Encrypted webhook secret; never leaves the store in plaintext
    /// except in the registration response
    pub encrypted_webhook_secret: String,
    pub is_active: bool,
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
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_commit_hash: Option<String>,
    #[serde(default)]
    pub cached_analysis: Option<RepositoryAnalysis>,
    #[serde(default)]
    pub pending_update: Option<PendingUpdate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GitHubRepository {
    /// Directory name used under a server's deploy root
    pub fn app_name(&self) -> &str {
        self.full_name
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }

    /// Install option built from the commands configured on the repository
    pub fn configured_install_option(&self) -> Option<InstallOption> {
        let start_command = self.start_command.clone().filter(|c| !c.trim().is_empty())?;
        Some(InstallOption {
            name: "configured".to_string(),
            description: "Commands configured on the repository".to_string(),
            build_command: self.build_command.clone().unwrap_or_default(),
            start_command,
            port: self.app_port,
            is_recommended: false,
            environment: self.environment.clone(),
        })
    }

    /// SSH URL used when a deploy key is attached
    pub fn ssh_clone_url(&self) -> String {
        format!("git@github.com:{}.git", self.full_name)
    }
}

/// Read view of a repository. Credentials are reduced to presence flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryResponse {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub is_private: bool,
    pub ssh_key_id: Option<String>,
    pub has_access_token: bool,
    pub is_active: bool,
    pub auto_deploy: bool,
    pub app_port: Option<u16>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_commit_hash: Option<String>,
    pub analyzed: bool,
    pub pending_update: Option<PendingUpdate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GitHubRepository> for RepositoryResponse {
    fn from(repo: GitHubRepository) -> Self {
        Self {
            id: repo.id,
            project_id: repo.project_id,
            name: repo.name,
            full_name: repo.full_name,
            clone_url: repo.clone_url,
            default_branch: repo.default_branch,
            is_private: repo.is_private,
            ssh_key_id: repo.ssh_key_id,
            has_access_token: repo.encrypted_access_token.is_some(),
            is_active: repo.is_active,
            auto_deploy: repo.auto_deploy,
            app_port: repo.app_port,
            build_command: repo.build_command,
            start_command: repo.start_command,
            environment: repo.environment,
            last_sync_at: repo.last_sync_at,
            last_commit_hash: repo.last_commit_hash,
            analyzed: repo.cached_analysis.is_some(),
            pending_update: repo.pending_update,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
        }
    }
}

/// Create response: the only time the webhook secret leaves the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryCreated {
    #[serde(flatten)]
    pub repository: RepositoryResponse,
    pub webhook_url: String,
    pub webhook_secret: String,
}
