//! Push webhook verification and handling

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use deploy_api::{PendingUpdate, WebhookResponse};

use crate::credentials::cipher::CredentialCipher;
use crate::deploy::manager::DeploymentManager;
use crate::errors::DeploydError;
use crate::models::deployment::TriggerSource;
use crate::store::StateStore;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

const SIGNATURE_PREFIX: &str = "sha256=";
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// 32 random bytes, hex encoded
pub fn generate_webhook_secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// `sha256=<hex>` signature GitHub sends for `body`
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, DeploydError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| DeploydError::CryptoError(format!("webhook key: {}", e)))?;
    mac.update(body);
    Ok(format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Check `X-Hub-Signature-256` against the raw body in constant time
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), DeploydError> {
    let expected = header
        .and_then(|h| h.trim().strip_prefix(SIGNATURE_PREFIX))
        .and_then(|h| hex::decode(h).ok())
        .ok_or(DeploydError::InvalidSignature)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| DeploydError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| DeploydError::InvalidSignature)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
    #[serde(default)]
    pub pusher: Option<Pusher>,
    #[serde(default)]
    pub repository: Option<PushRepository>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub full_name: String,
}

impl PushPayload {
    pub fn parse(body: &[u8]) -> Result<Self, DeploydError> {
        serde_json::from_slice(body)
            .map_err(|e| DeploydError::ValidationError(format!("Malformed push payload: {}", e)))
    }

    /// Branch name for `refs/heads/*` refs
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Pushed commit: `head_commit.id`, else `after`
    pub fn commit(&self) -> Option<&str> {
        self.head_commit
            .as_ref()
            .map(|c| c.id.as_str())
            .or(self.after.as_deref())
            .filter(|c| !c.is_empty())
    }

    pub fn is_deletion(&self) -> bool {
        self.deleted || self.after.as_deref() == Some(ZERO_SHA)
    }

    pub fn pusher(&self) -> String {
        self.pusher
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// What a delivery resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Pong,
    Ignored(String),
    DeploymentCreated { deployment_id: String, commit_hash: String },
    PendingUpdateRecorded { commit_hash: String },
}

impl From<WebhookOutcome> for WebhookResponse {
    fn from(outcome: WebhookOutcome) -> Self {
        match outcome {
            WebhookOutcome::Pong => WebhookResponse {
                result: "pong".to_string(),
                message: "pong".to_string(),
                deployment_id: None,
                commit_hash: None,
            },
            WebhookOutcome::Ignored(reason) => WebhookResponse {
                result: "ignored".to_string(),
                message: reason,
                deployment_id: None,
                commit_hash: None,
            },
            WebhookOutcome::DeploymentCreated { deployment_id, commit_hash } => WebhookResponse {
                result: "deployment_created".to_string(),
                message: "Deployment queued".to_string(),
                deployment_id: Some(deployment_id),
                commit_hash: Some(commit_hash),
            },
            WebhookOutcome::PendingUpdateRecorded { commit_hash } => WebhookResponse {
                result: "pending_update_recorded".to_string(),
                message: "Update recorded, deploy it when ready".to_string(),
                deployment_id: None,
                commit_hash: Some(commit_hash),
            },
        }
    }
}

/// Turns verified push deliveries into deployments or pending-update markers
pub struct WebhookGateway {
    store: StateStore,
    cipher: Arc<CredentialCipher>,
    deployments: Arc<DeploymentManager>,
}

impl WebhookGateway {
    pub fn new(store: StateStore, cipher: Arc<CredentialCipher>, deployments: Arc<DeploymentManager>) -> Self {
        Self {
            store,
            cipher,
            deployments,
        }
    }

    /// Handle one delivery. Nothing is recorded unless the signature checks out.
    pub fn handle(
        &self,
        repo_id: &str,
        event: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, DeploydError> {
        let repo = self
            .store
            .get_repository(repo_id)?
            .filter(|r| r.is_active)
            .ok_or_else(|| DeploydError::RepositoryNotFound(repo_id.to_string()))?;

        let secret = self.cipher.open(&repo.encrypted_webhook_secret)?;
        if let Err(e) = verify_signature(secret.expose_secret().as_bytes(), body, signature) {
            warn!(repo_id, "webhook signature rejected");
            return Err(e);
        }

        match event.unwrap_or_default() {
            "ping" => return Ok(WebhookOutcome::Pong),
            "push" => {}
            other => {
                debug!(repo_id, event = other, "ignoring webhook event");
                return Ok(WebhookOutcome::Ignored(format!("Event '{}' ignored", other)));
            }
        }

        let payload = PushPayload::parse(body)?;
        if let Some(pushed) = payload.repository.as_ref().map(|r| r.full_name.as_str()) {
            if !pushed.eq_ignore_ascii_case(&repo.full_name) {
                warn!(repo_id, pushed, registered = %repo.full_name, "push for a different repository name");
            }
        }
        let Some(branch) = payload.branch() else {
            return Ok(WebhookOutcome::Ignored(format!("Ref {} is not a branch", payload.git_ref)));
        };
        if payload.is_deletion() {
            return Ok(WebhookOutcome::Ignored(format!("Branch {} was deleted", branch)));
        }
        if branch != repo.default_branch {
            return Ok(WebhookOutcome::Ignored(format!(
                "Push to {} ignored, watching {}",
                branch, repo.default_branch
            )));
        }
        let commit_hash = payload
            .commit()
            .ok_or_else(|| DeploydError::ValidationError("Push payload carries no commit".to_string()))?
            .to_string();

        let now = Utc::now();
        self.store.update_repository(&repo.id, |r| {
            r.last_sync_at = Some(now);
            r.last_commit_hash = Some(commit_hash.clone());
            r.updated_at = now;
            Ok(())
        })?;

        let template = if repo.auto_deploy {
            self.store.latest_deployment_for_repository(&repo.id)?
        } else {
            None
        };
        if let Some(template) = template {
            let deployment = self
                .deployments
                .redeploy_from(&template, &commit_hash, branch, TriggerSource::Webhook)?;
            info!(repo_id, deployment_id = %deployment.id, commit = %commit_hash, "push triggered deployment");
            return Ok(WebhookOutcome::DeploymentCreated {
                deployment_id: deployment.id,
                commit_hash,
            });
        }

        let marker = PendingUpdate {
            commit_hash: commit_hash.clone(),
            branch: branch.to_string(),
            pusher: payload.pusher(),
            message: payload.head_commit.as_ref().and_then(|c| c.message.clone()),
            received_at: now,
        };
        self.store.update_repository(&repo.id, |r| {
            r.pending_update = Some(marker);
            Ok(())
        })?;
        info!(repo_id, commit = %commit_hash, "pending update recorded");
        Ok(WebhookOutcome::PendingUpdateRecorded { commit_hash })
    }
}
