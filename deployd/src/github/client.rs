//! GitHub REST API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, error};

use crate::errors::DeploydError;
use crate::storage::settings::GitHubSettings;

/// Repository metadata as reported by GitHub
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteRepository {
    pub full_name: String,
    pub default_branch: String,
    pub private: bool,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Debug, Deserialize)]
struct BranchCommit {
    sha: String,
}

/// Read access to a hosted repository
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    async fn repository(&self, full_name: &str, token: Option<&SecretString>) -> Result<RemoteRepository, DeploydError>;

    /// Commit sha at the head of `branch`
    async fn branch_head(&self, full_name: &str, branch: &str, token: Option<&SecretString>) -> Result<String, DeploydError>;

    /// Raw file contents at `git_ref`, `None` when the file does not exist
    async fn file(
        &self,
        full_name: &str,
        git_ref: &str,
        path: &str,
        token: Option<&SecretString>,
    ) -> Result<Option<String>, DeploydError>;
}

/// HTTP client for api.github.com (or an enterprise endpoint)
pub struct GitHubClient {
    client: Client,
    base_url: String,
    default_token: Option<SecretString>,
}

impl GitHubClient {
    pub fn new(settings: &GitHubSettings) -> Result<Self, DeploydError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("deployd/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            default_token: settings.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str, token: Option<&SecretString>) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let mut request = self
            .client
            .get(&url)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = token.or(self.default_token.as_ref()) {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        request
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: Option<&SecretString>) -> Result<T, DeploydError> {
        let response = self
            .get(path, token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::failure(path, response).await);
        }
        Ok(response.json().await?)
    }

    async fn failure(path: &str, response: reqwest::Response) -> DeploydError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("GitHub GET {} failed: {} - {}", path, status, body);
        match status {
            StatusCode::NOT_FOUND => DeploydError::GitHubError(format!(
                "{} not found or not accessible with the configured credentials",
                path
            )),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DeploydError::GitHubError(format!("access denied ({})", status))
            }
            _ => DeploydError::GitHubError(format!("{}: {}", status, body)),
        }
    }
}

#[async_trait]
impl RepositoryHost for GitHubClient {
    async fn repository(&self, full_name: &str, token: Option<&SecretString>) -> Result<RemoteRepository, DeploydError> {
        self.get_json(&format!("/repos/{}", full_name), token).await
    }

    async fn branch_head(&self, full_name: &str, branch: &str, token: Option<&SecretString>) -> Result<String, DeploydError> {
        let branch: BranchResponse = self
            .get_json(&format!("/repos/{}/branches/{}", full_name, branch), token)
            .await?;
        Ok(branch.commit.sha)
    }

    async fn file(
        &self,
        full_name: &str,
        git_ref: &str,
        path: &str,
        token: Option<&SecretString>,
    ) -> Result<Option<String>, DeploydError> {
        let api_path = format!("/repos/{}/contents/{}", full_name, path);
        let response = self
            .get(&api_path, token)
            .header(header::ACCEPT, "application/vnd.github.raw+json")
            .query(&[("ref", git_ref)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            _ => Err(Self::failure(&api_path, response).await),
        }
    }
}
