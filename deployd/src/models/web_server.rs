//! Deployment target reachable over SSH

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeploydError;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_DEPLOY_ROOT: &str = "~/deploys";

/// Result of the last connection test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebServerStatus {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl WebServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebServerStatus::Unknown => "unknown",
            WebServerStatus::Reachable => "reachable",
            WebServerStatus::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServer {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub host: String,
    pub port: u16,
    pub ssh_user: String,
    pub ssh_key_id: String,
    /// Root under which deployments without an explicit path are placed
    pub deploy_path: String,
    #[serde(default)]
    pub status: WebServerStatus,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebServer {
    /// Home directory of the SSH user
    pub fn home_dir(&self) -> String {
        if self.ssh_user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.ssh_user)
        }
    }

    /// Normalize a remote path so every spelling of one directory maps to
    /// the same lock key: `~` is expanded and trailing slashes dropped.
    pub fn resolve_path(&self, path: &str) -> Result<String, DeploydError> {
        let path = path.trim();
        let expanded = if path == "~" {
            self.home_dir()
        } else if let Some(rest) = path.strip_prefix("~/") {
            format!("{}/{}", self.home_dir(), rest)
        } else {
            path.to_string()
        };

        if !expanded.starts_with('/') {
            return Err(DeploydError::ValidationError(format!(
                "Deployment path must be absolute or start with ~/: {}",
                path
            )));
        }
        if expanded.split('/').any(|segment| segment == "..") {
            return Err(DeploydError::ValidationError(format!(
                "Deployment path must not contain '..': {}",
                path
            )));
        }
        if expanded.chars().any(|c| c.is_control()) {
            return Err(DeploydError::ValidationError(
                "Deployment path contains control characters".to_string(),
            ));
        }

        let mut normalized = String::with_capacity(expanded.len());
        for segment in expanded.split('/').filter(|s| !s.is_empty() && *s != ".") {
            normalized.push('/');
            normalized.push_str(segment);
        }
        if normalized.is_empty() {
            return Err(DeploydError::ValidationError(
                "Deployment path must not be the filesystem root".to_string(),
            ));
        }
        Ok(normalized)
    }

    /// Default directory for an application deployed to this server
    pub fn default_deployment_path(&self, app_name: &str) -> Result<String, DeploydError> {
        let root = if self.deploy_path.trim().is_empty() {
            DEFAULT_DEPLOY_ROOT
        } else {
            self.deploy_path.as_str()
        };
        self.resolve_path(&format!("{}/{}", root, app_name))
    }
}
