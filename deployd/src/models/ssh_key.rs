//! SSH key pair owned by a project

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored SSH key. The private half only ever exists encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// e.g. `ssh-ed25519`
    pub key_type: String,
    /// base64 of nonce || AES-256-GCM ciphertext
    pub encrypted_private_key: String,
    /// OpenSSH public key line
    pub public_key: String,
    /// `SHA256:<base64>` as printed by `ssh-keygen -l`
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read view of a key: everything except the private half
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyResponse {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub key_type: String,
    pub public_key: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SshKey> for SshKeyResponse {
    fn from(key: SshKey) -> Self {
        Self {
            id: key.id,
            project_id: key.project_id,
            name: key.name,
            description: key.description,
            key_type: key.key_type,
            public_key: key.public_key,
            fingerprint: key.fingerprint,
            created_at: key.created_at,
            updated_at: key.updated_at,
        }
    }
}
