//! SSH key management

use std::sync::Arc;

use chrono::Utc;
use secrecy::ExposeSecret;
use tracing::info;

use deploy_api::{CreateSshKeyRequest, UpdateSshKeyRequest};

use crate::credentials::cipher::CredentialCipher;
use crate::credentials::keys::{generate_ed25519, validate_private_key, PublicKey};
use crate::errors::DeploydError;
use crate::models::ssh_key::{SshKey, SshKeyResponse};
use crate::services::required;
use crate::store::StateStore;
use crate::utils::generate_uuid;

pub struct SshKeyService {
    store: StateStore,
    cipher: Arc<CredentialCipher>,
}

impl SshKeyService {
    pub fn new(store: StateStore, cipher: Arc<CredentialCipher>) -> Self {
        Self { store, cipher }
    }

    fn key(&self, project_id: &str, id: &str) -> Result<SshKey, DeploydError> {
        self.store
            .get_ssh_key(id)?
            .filter(|k| k.project_id == project_id)
            .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", id)))
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<SshKeyResponse>, DeploydError> {
        Ok(self
            .store
            .list_ssh_keys(project_id)?
            .into_iter()
            .map(SshKeyResponse::from)
            .collect())
    }

    pub fn get(&self, project_id: &str, id: &str) -> Result<SshKeyResponse, DeploydError> {
        self.key(project_id, id).map(SshKeyResponse::from)
    }

    /// Import the given pair, or generate an ed25519 pair when no private key is supplied
    pub fn create(&self, project_id: &str, request: CreateSshKeyRequest) -> Result<SshKeyResponse, DeploydError> {
        let name = required("name", &request.name)?;

        let (key_type, private_key, public_key, fingerprint) =
            match request.private_key.as_deref().filter(|k| !k.trim().is_empty()) {
                Some(private_key) => {
                    validate_private_key(private_key)?;
                    let public_line = request.public_key.as_deref().unwrap_or_default();
                    if public_line.trim().is_empty() {
                        return Err(DeploydError::ValidationError(
                            "public_key is required when importing a private key".to_string(),
                        ));
                    }
                    let public = PublicKey::parse(public_line)?;
                    let sealed = self.cipher.seal(private_key.trim())?;
                    (public.key_type.clone(), sealed, public.to_openssh(), public.fingerprint())
                }
                None => {
                    let pair = generate_ed25519(&format!("deployd-{}", name.replace(char::is_whitespace, "-")));
                    let sealed = self.cipher.seal(pair.private_key.expose_secret())?;
                    (pair.key_type, sealed, pair.public_key, pair.fingerprint)
                }
            };

        let now = Utc::now();
        let key = SshKey {
            id: generate_uuid(),
            project_id: project_id.to_string(),
            name,
            description: request.description,
            key_type,
            encrypted_private_key: private_key,
            public_key,
            fingerprint,
            created_at: now,
            updated_at: now,
        };
        self.store.put_ssh_key(&key)?;
        info!(key_id = %key.id, fingerprint = %key.fingerprint, "ssh key created");
        Ok(key.into())
    }

    pub fn update(&self, project_id: &str, id: &str, request: UpdateSshKeyRequest) -> Result<SshKeyResponse, DeploydError> {
        self.key(project_id, id)?;
        let name = match request.name.as_deref() {
            Some(name) => Some(required("name", name)?),
            None => None,
        };
        let updated = self.store.update_ssh_key(id, |key| {
            if let Some(name) = name {
                key.name = name;
            }
            if let Some(description) = request.description {
                key.description = Some(description).filter(|d| !d.is_empty());
            }
            key.updated_at = Utc::now();
            Ok(())
        })?;
        updated
            .map(SshKeyResponse::from)
            .ok_or_else(|| DeploydError::NotFound(format!("SSH key {}", id)))
    }

    /// Refused while any server or repository still authenticates with the key
    pub fn delete(&self, project_id: &str, id: &str) -> Result<(), DeploydError> {
        self.key(project_id, id)?;
        let servers = self.store.web_servers_using_key(id)?;
        let repositories = self.store.repositories_using_key(id)?;
        if !servers.is_empty() || !repositories.is_empty() {
            return Err(DeploydError::Conflict(format!(
                "SSH key {} is used by {} web server(s) and {} repository(ies)",
                id,
                servers.len(),
                repositories.len()
            )));
        }
        self.store.delete_ssh_key(id)?;
        info!(key_id = id, "ssh key deleted");
        Ok(())
    }
}
