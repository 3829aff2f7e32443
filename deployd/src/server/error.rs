//! Mapping from service errors to HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use deploy_api::ErrorResponse;

use crate::errors::DeploydError;

impl DeploydError {
    /// HTTP status reported to callers
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeploydError::InvalidSignature | DeploydError::AuthError(_) => StatusCode::UNAUTHORIZED,
            DeploydError::Forbidden(_) => StatusCode::FORBIDDEN,
            DeploydError::RepositoryNotFound(_)
            | DeploydError::TargetNotFound(_)
            | DeploydError::NotFound(_) => StatusCode::NOT_FOUND,
            DeploydError::ValidationError(_) | DeploydError::JsonError(_) => StatusCode::BAD_REQUEST,
            DeploydError::Conflict(_) | DeploydError::TargetBusy(_) | DeploydError::PortConflict { .. } => {
                StatusCode::CONFLICT
            }
            DeploydError::SshConnectionError(_) | DeploydError::GitHubError(_) | DeploydError::HttpError(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            DeploydError::IoError(_) => "io_error",
            DeploydError::JsonError(_) => "invalid_json",
            DeploydError::HttpError(_) => "http_error",
            DeploydError::InvalidSignature => "invalid_signature",
            DeploydError::RepositoryNotFound(_) => "repository_not_found",
            DeploydError::TargetNotFound(_) => "target_not_found",
            DeploydError::NotFound(_) => "not_found",
            DeploydError::TargetBusy(_) => "target_busy",
            DeploydError::SshConnectionError(_) => "ssh_connection_error",
            DeploydError::PortConflict { .. } => "port_conflict",
            DeploydError::BuildFailureError { .. } => "build_failure",
            DeploydError::ActivationFailureError { .. } => "activation_failure",
            DeploydError::InternalStateError(_) => "internal_state_error",
            DeploydError::AuthError(_) => "unauthorized",
            DeploydError::Forbidden(_) => "forbidden",
            DeploydError::ValidationError(_) => "validation_error",
            DeploydError::Conflict(_) => "conflict",
            DeploydError::StorageError(_) => "storage_error",
            DeploydError::CryptoError(_) => "crypto_error",
            DeploydError::GitHubError(_) => "github_error",
            DeploydError::ConfigError(_) => "config_error",
            DeploydError::ServerError(_) => "server_error",
            DeploydError::ShutdownError(_) => "shutdown_error",
            DeploydError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for DeploydError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Missing repositories are reported the same way whatever the lookup
        let message = match &self {
            DeploydError::RepositoryNotFound(_) => "Repository not found".to_string(),
            DeploydError::InvalidSignature => "Invalid webhook signature".to_string(),
            e if status.is_server_error() && !matches!(e, DeploydError::SshConnectionError(_)) => {
                error!(code = self.code(), "request failed: {}", self);
                "Internal server error".to_string()
            }
            e => e.to_string(),
        };
        let body = ErrorResponse {
            code: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
