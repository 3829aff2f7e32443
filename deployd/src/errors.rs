//! Error types for the deployment orchestrator

use thiserror::Error;

/// Main error type for deployd
#[derive(Error, Debug)]
pub enum DeploydError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    // ---- webhook gateway ----
    #[error("Invalid webhook signature")]
    InvalidSignature,

    // ---- referential validation ----
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Deployment target not found: {0}")]
    TargetNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ---- execution ----
    #[error("Target busy: {0}")]
    TargetBusy(String),

    #[error("SSH connection error: {0}")]
    SshConnectionError(String),

    #[error("Port {port} is already in use by {occupant}")]
    PortConflict { port: u16, occupant: String },

    #[error("Build failed (exit {exit_code}): {command}")]
    BuildFailureError { command: String, exit_code: i32 },

    #[error("Activation failed (exit {exit_code}): {command}")]
    ActivationFailureError { command: String, exit_code: i32 },

    #[error("Illegal state transition: {0}")]
    InternalStateError(String),

    // ---- caller ----
    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // ---- infrastructure ----
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("GitHub error: {0}")]
    GitHubError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for DeploydError {
    fn from(err: anyhow::Error) -> Self {
        DeploydError::Internal(err.to_string())
    }
}
