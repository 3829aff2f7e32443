//! Caller token verification
//!
//! Tokens are issued by the platform's auth subsystem and signed with a
//! shared HS256 secret. Only admins scoped to the project, and superadmins,
//! may reach the orchestration surface.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::DeploydError;

/// Platform role carried in the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Superadmin,
    Admin,
    Developer,
    Viewer,
}

/// Caller token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerClaims {
    /// Subject (user ID)
    pub sub: String,

    pub role: Role,

    /// Projects the caller administers
    #[serde(default)]
    pub projects: Vec<String>,

    /// Issued at timestamp
    #[serde(default)]
    pub iat: i64,

    /// Expiration timestamp
    pub exp: i64,
}

impl CallerClaims {
    /// Check the caller may operate on `project_id`
    pub fn authorize(&self, project_id: &str) -> Result<(), DeploydError> {
        match self.role {
            Role::Superadmin => Ok(()),
            Role::Admin if self.projects.iter().any(|p| p == project_id) => Ok(()),
            Role::Admin => Err(DeploydError::Forbidden(format!(
                "No access to project {}",
                project_id
            ))),
            _ => Err(DeploydError::Forbidden(
                "Admin or superadmin role required".to_string(),
            )),
        }
    }
}

/// Verifies caller tokens against the shared secret
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    /// Decode and validate signature and expiry
    pub fn verify(&self, raw: &str) -> Result<CallerClaims, DeploydError> {
        decode::<CallerClaims>(raw, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| DeploydError::AuthError(format!("Invalid token: {}", e)))
    }
}

/// Sign claims with the shared secret. Used by tooling and tests.
pub fn issue_token(claims: &CallerClaims, secret: &SecretString) -> Result<String, DeploydError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
    )
    .map_err(|e| DeploydError::AuthError(format!("Failed to sign token: {}", e)))
}
